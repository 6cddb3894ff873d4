//! Recording of simulation event streams.
//!
//! Domain code emits `tracing` events whose target names the stream
//! (`job_finished`, `fo_ready`, ...) and whose fields carry a `sim_time`
//! stamp plus a handful of entity ids and measures. Events of one stream
//! are sparse and heterogeneous - different sites contribute different
//! fields - so the recorder keeps them as rows, in emission order, and
//! pivots a stream into a polars DataFrame only when column access is
//! wanted.
//!
//! # Usage
//!
//! ```ignore
//! // In simulation code:
//! tracing::info!(target: "job_finished", sim_time, job, makespan);
//!
//! // In a test or analysis script:
//! instrument::install_subscriber();
//! // ... run the simulation ...
//! let recorder = instrument::drain();
//! let finished = &recorder.streams["job_finished"];
//! assert_eq!(finished.len(), 3);
//! let df = finished.to_dataframe()?;
//! ```

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Record};
use tracing::{Event, Id, Metadata, Subscriber};

// ============================================================================
// Streams of event rows
// ============================================================================

/// One recorded field value. Simulation events carry entity ids and counts
/// (unsigned), measures and durations (float), and the occasional message.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uint(u64),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view; integers widen to float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Uint(v) => Some(*v as f64),
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// One event: its simulated timestamp plus the remaining fields, in
/// emission order.
#[derive(Debug, Clone, Default)]
pub struct EventRecord {
    pub sim_time: f64,
    pub fields: Vec<(String, Value)>,
}

impl EventRecord {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(field, _)| field == name).map(|(_, value)| value)
    }
}

/// All events of one target, in emission order.
#[derive(Debug, Clone, Default)]
pub struct EventStream {
    pub events: Vec<EventRecord>,
}

impl EventStream {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Timestamps of the stream, one per event.
    pub fn sim_times(&self) -> Vec<f64> {
        self.events.iter().map(|event| event.sim_time).collect()
    }

    /// Field names seen anywhere in the stream, in first-seen order.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for event in &self.events {
            for (name, _) in &event.fields {
                if !names.iter().any(|seen| seen == name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// Numeric column for `name`; events without the field (or with a
    /// non-numeric value) yield `None`.
    pub fn column_f64(&self, name: &str) -> Vec<Option<f64>> {
        self.events.iter().map(|event| event.get(name).and_then(Value::as_f64)).collect()
    }

    /// Text column for `name`.
    pub fn column_text(&self, name: &str) -> Vec<Option<String>> {
        self.events
            .iter()
            .map(|event| event.get(name).and_then(|value| value.as_str().map(str::to_string)))
            .collect()
    }
}

/// All streams of a run, keyed by tracing target.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    pub streams: HashMap<String, EventStream>,
}

thread_local! {
    static RECORDER: RefCell<Recorder> = RefCell::default();
}

// ============================================================================
// Tracing subscriber
// ============================================================================

/// Visitor that folds one event's fields into an [`EventRecord`]. The
/// `sim_time` field becomes the row timestamp rather than a regular field.
struct RowVisitor {
    record: EventRecord,
}

impl RowVisitor {
    fn push(&mut self, field: &Field, value: Value) {
        if field.name() == "sim_time" {
            if let Some(time) = value.as_f64() {
                self.record.sim_time = time;
                return;
            }
        }
        self.record.fields.push((field.name().to_string(), value));
    }
}

impl Visit for RowVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, Value::Uint(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, Value::Int(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, Value::Float(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, Value::Uint(u64::from(value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, Value::Text(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field, Value::Text(format!("{:?}", value)));
    }
}

/// Tracing subscriber that appends every info-level event to the stream
/// named by its target.
pub struct SimTraceSubscriber;

impl Subscriber for SimTraceSubscriber {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        // Only collect info-level events (not spans, not debug/trace)
        metadata.is_event() && *metadata.level() <= tracing::Level::INFO
    }

    fn new_span(&self, _span: &Attributes<'_>) -> Id {
        // Spans are not tracked; return a dummy id.
        Id::from_u64(1)
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut visitor = RowVisitor { record: EventRecord::default() };
        event.record(&mut visitor);
        let target = event.metadata().target().to_string();
        RECORDER.with(|recorder| {
            recorder
                .borrow_mut()
                .streams
                .entry(target)
                .or_default()
                .events
                .push(visitor.record);
        });
    }

    fn enter(&self, _span: &Id) {}

    fn exit(&self, _span: &Id) {}
}

/// Install the subscriber as the global default. Call once at the start of
/// a run; later calls are no-ops.
pub fn install_subscriber() {
    let _ = tracing::subscriber::set_global_default(SimTraceSubscriber);
}

/// Drain all recorded streams from the thread-local recorder.
pub fn drain() -> Recorder {
    RECORDER.with(|recorder| std::mem::take(&mut *recorder.borrow_mut()))
}

/// Clear all recorded data without returning it.
pub fn clear() {
    RECORDER.with(|recorder| *recorder.borrow_mut() = Recorder::default());
}

// === Polars Integration ===

use polars::prelude::*;

impl EventStream {
    /// Pivot the rows into a DataFrame: a `sim_time` column plus one column
    /// per field name. A field is numeric unless every occurrence is text;
    /// rows missing a field get nulls.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let mut columns: Vec<Column> = vec![Column::new("sim_time".into(), self.sim_times())];
        for name in self.field_names() {
            let numeric = self
                .events
                .iter()
                .filter_map(|event| event.get(&name))
                .all(|value| value.as_f64().is_some());
            let column = if numeric {
                Column::new(name.as_str().into(), self.column_f64(&name))
            } else {
                Column::new(name.as_str().into(), self.column_text(&name))
            };
            columns.push(column);
        }
        DataFrame::new(columns)
    }
}

impl Recorder {
    /// Convert every stream to a polars DataFrame.
    pub fn to_dataframes(&self) -> HashMap<String, DataFrame> {
        self.streams
            .iter()
            .filter_map(|(name, stream)| {
                stream.to_dataframe().ok().map(|df| (name.clone(), df))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_become_rows_with_their_sim_time() {
        use tracing::subscriber::with_default;

        clear();
        with_default(SimTraceSubscriber, || {
            tracing::info!(target: "test_stream", sim_time = 1.0f64, job = 1u64, note = "first");
            tracing::info!(target: "test_stream", sim_time = 2.0f64, job = 2u64);
            tracing::info!(target: "test_stream", sim_time = 3.0f64, job = 3u64, note = "third");
        });

        let recorder = drain();
        let stream = &recorder.streams["test_stream"];
        assert_eq!(stream.len(), 3);
        assert_eq!(stream.sim_times(), vec![1.0, 2.0, 3.0]);
        assert_eq!(stream.events[0].get("job"), Some(&Value::Uint(1)));
        // The second event has no note; lookups just miss.
        assert_eq!(stream.events[1].get("note"), None);
        assert_eq!(stream.field_names(), vec!["job".to_string(), "note".to_string()]);
    }

    #[test]
    fn sparse_fields_pivot_to_nullable_columns() {
        let stream = EventStream {
            events: vec![
                EventRecord {
                    sim_time: 0.0,
                    fields: vec![
                        ("count".to_string(), Value::Uint(4)),
                        ("note".to_string(), Value::Text("warmup".to_string())),
                    ],
                },
                EventRecord {
                    sim_time: 1.5,
                    fields: vec![("count".to_string(), Value::Uint(5))],
                },
            ],
        };
        assert_eq!(stream.column_f64("count"), vec![Some(4.0), Some(5.0)]);
        assert_eq!(stream.column_text("note"), vec![Some("warmup".to_string()), None]);

        let df = stream.to_dataframe().unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 3);
    }
}
