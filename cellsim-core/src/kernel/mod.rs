//! Deterministic event scheduler.
//!
//! The scheduler owns the simulated clock, a priority queue of scheduled
//! events keyed on `(time, sequence)`, an arena of events, and an arena of
//! cooperative tasks. Everything else in the crate is driven from here:
//! resources, stores, servers, cells and AGVs all suspend their tasks on
//! events and are resumed in deterministic order.
//!
//! Ordering guarantees:
//! - events scheduled for the same time fire in creation order;
//! - a zero-delay timeout advances no time but still goes through the queue,
//!   so already-queued same-time events fire first.

pub mod process;

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use slotmap::{SecondaryMap, SlotMap, new_key_type};

use crate::errors::SimError;
use crate::sim::Sim;
use crate::types::SimTime;

pub use process::{Payload, Process, Resume, Step, Until};

new_key_type! {
    pub struct EventKey;
    pub struct TaskKey;
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone)]
enum EventKind {
    /// Initial activation of a freshly spawned task.
    Start,
    /// Normal success.
    Fire,
    /// Preemption / external interrupt of a suspended task.
    Interrupt,
    /// Failure; waiters are resumed with the error.
    Fail(SimError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waiter {
    Task(TaskKey),
    /// A composite (`all_of` / `any_of`) parent listening on a child.
    Composite(EventKey),
}

#[derive(Debug)]
enum Composite {
    All { remaining: usize, values: Vec<Payload> },
    Any { fired: bool },
}

#[derive(Debug)]
struct EventState {
    kind: EventKind,
    payload: Payload,
    waiters: Vec<Waiter>,
    composite: Option<Composite>,
    /// Whether the event is already on the heap.
    queued: bool,
}

impl EventState {
    fn pending() -> Self {
        Self {
            kind: EventKind::Fire,
            payload: Payload::None,
            waiters: Vec::new(),
            composite: None,
            queued: false,
        }
    }
}

// ============================================================================
// Heap entries
// ============================================================================

#[derive(Debug)]
struct HeapEntry {
    time: SimTime,
    seq: u64,
    event: EventKey,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time.total_cmp(&other.time).then(self.seq.cmp(&other.seq))
    }
}

// ============================================================================
// Tasks
// ============================================================================

struct TaskSlot {
    /// Taken out while the task is being stepped; `None` also marks a task
    /// currently on the call stack.
    body: Option<Box<dyn Process>>,
    /// Succeeds when the task returns [`Step::Done`].
    done: Option<EventKey>,
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct Scheduler {
    now: SimTime,
    seq: u64,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    events: SlotMap<EventKey, EventState>,
    tasks: SlotMap<TaskKey, TaskSlot>,
    /// Which event each suspended task is waiting on, for interrupts.
    waiting: SecondaryMap<TaskKey, EventKey>,
    /// The task currently on the call stack, if any.
    current: Option<TaskKey>,
    stop_requested: bool,
    failure: Option<SimError>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            now: 0.0,
            seq: 0,
            heap: BinaryHeap::new(),
            events: SlotMap::with_key(),
            tasks: SlotMap::with_key(),
            waiting: SecondaryMap::new(),
            current: None,
            stop_requested: false,
            failure: None,
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// The task being stepped right now. Tasks use this to identify
    /// themselves when issuing resource requests.
    pub fn current_task(&self) -> Option<TaskKey> {
        self.current
    }

    /// Request a cooperative stop; `run` returns normally at the next
    /// dequeue.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Abort the run with a domain error at the next dequeue. Used by code
    /// that detects an invariant violation outside a task frame.
    pub fn abort(&mut self, error: SimError) {
        self.failure = Some(error);
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn enqueue(&mut self, event: EventKey, time: SimTime) {
        let seq = self.next_seq();
        self.heap.push(Reverse(HeapEntry { time, seq, event }));
    }

    /// A bare event the caller will succeed or fail later.
    pub fn event(&mut self) -> EventKey {
        self.events.insert(EventState::pending())
    }

    /// An event that fires `delay` seconds from now. `delay` must be >= 0; a
    /// zero delay still goes through the queue.
    pub fn timeout(&mut self, delay: SimTime) -> EventKey {
        debug_assert!(delay >= 0.0, "negative timeout");
        let at = self.now + delay.max(0.0);
        let key = self.events.insert(EventState {
            kind: EventKind::Fire,
            payload: Payload::Time(at),
            waiters: Vec::new(),
            composite: None,
            queued: true,
        });
        self.enqueue(key, at);
        key
    }

    /// Whether the event still exists (has not fired and been consumed).
    pub fn event_exists(&self, event: EventKey) -> bool {
        self.events.contains_key(event)
    }

    /// Succeed a pending event with a payload. Returns `false` when the
    /// event is unknown or already queued to fire.
    pub fn succeed(&mut self, event: EventKey, payload: Payload) -> bool {
        let Some(state) = self.events.get_mut(event) else {
            return false;
        };
        if state.queued {
            return false;
        }
        state.kind = EventKind::Fire;
        state.payload = payload;
        state.queued = true;
        let now = self.now;
        self.enqueue(event, now);
        true
    }

    /// Fail a pending event; waiters are resumed with the error.
    pub fn fail(&mut self, event: EventKey, error: SimError) -> bool {
        let Some(state) = self.events.get_mut(event) else {
            return false;
        };
        if state.queued {
            return false;
        }
        state.kind = EventKind::Fail(error);
        state.queued = true;
        let now = self.now;
        self.enqueue(event, now);
        true
    }

    /// Composite event that fires when every child has fired, carrying the
    /// child payloads in order. Children that already fired count as done.
    pub fn all_of(&mut self, children: &[EventKey]) -> EventKey {
        let parent = self.events.insert(EventState::pending());
        let mut remaining = 0;
        for &child in children {
            if let Some(state) = self.events.get_mut(child) {
                state.waiters.push(Waiter::Composite(parent));
                remaining += 1;
            }
        }
        self.events[parent].composite = Some(Composite::All { remaining, values: Vec::new() });
        if remaining == 0 {
            self.succeed(parent, Payload::Many(Vec::new()));
        }
        parent
    }

    /// Composite event that fires on the first child to fire, carrying that
    /// child's payload. A child that already fired makes it fire at once.
    pub fn any_of(&mut self, children: &[EventKey]) -> EventKey {
        let parent = self.events.insert(EventState::pending());
        let mut already_fired = false;
        for &child in children {
            if let Some(state) = self.events.get_mut(child) {
                state.waiters.push(Waiter::Composite(parent));
            } else {
                already_fired = true;
            }
        }
        self.events[parent].composite = Some(Composite::Any { fired: false });
        if already_fired {
            self.notify_composite(parent, Payload::None);
        }
        parent
    }

    fn notify_composite(&mut self, parent: EventKey, child_payload: Payload) {
        let Some(state) = self.events.get_mut(parent) else {
            return;
        };
        match &mut state.composite {
            Some(Composite::All { remaining, values }) => {
                values.push(child_payload);
                *remaining -= 1;
                if *remaining == 0 {
                    let values = std::mem::take(values);
                    self.succeed(parent, Payload::Many(values));
                }
            }
            Some(Composite::Any { fired }) => {
                if !*fired {
                    *fired = true;
                    self.succeed(parent, child_payload);
                }
            }
            None => {}
        }
    }

    // --- Tasks --------------------------------------------------------------

    /// Register a task; it is first resumed (with [`Resume::Started`]) once
    /// the queue reaches the current time again.
    pub fn spawn(&mut self, body: Box<dyn Process>) -> TaskKey {
        let task = self.tasks.insert(TaskSlot { body: Some(body), done: None });
        self.schedule_start(task);
        task
    }

    /// Like [`Scheduler::spawn`], also returning an event that succeeds when
    /// the task completes (or fails if the task fails).
    pub fn spawn_tracked(&mut self, body: Box<dyn Process>) -> (TaskKey, EventKey) {
        let done = self.event();
        let task = self.tasks.insert(TaskSlot { body: Some(body), done: Some(done) });
        self.schedule_start(task);
        (task, done)
    }

    fn schedule_start(&mut self, task: TaskKey) {
        let start = self.events.insert(EventState {
            kind: EventKind::Start,
            payload: Payload::None,
            waiters: vec![Waiter::Task(task)],
            composite: None,
            queued: true,
        });
        self.waiting.insert(task, start);
        let now = self.now;
        self.enqueue(start, now);
    }

    /// Interrupt a suspended task: it is detached from the event it waits on
    /// and resumed with [`Resume::Interrupted`] at the current time.
    pub fn interrupt(&mut self, task: TaskKey) {
        let Some(waited) = self.waiting.remove(task) else {
            return;
        };
        if let Some(state) = self.events.get_mut(waited) {
            state.waiters.retain(|w| *w != Waiter::Task(task));
        }
        let interrupt = self.events.insert(EventState {
            kind: EventKind::Interrupt,
            payload: Payload::None,
            waiters: vec![Waiter::Task(task)],
            composite: None,
            queued: true,
        });
        self.waiting.insert(task, interrupt);
        let now = self.now;
        self.enqueue(interrupt, now);
    }

    pub fn task_alive(&self, task: TaskKey) -> bool {
        self.tasks.contains_key(task)
    }

    fn add_task_waiter(&mut self, event: EventKey, task: TaskKey) -> bool {
        let Some(state) = self.events.get_mut(event) else {
            return false;
        };
        state.waiters.push(Waiter::Task(task));
        self.waiting.insert(task, event);
        true
    }

    fn peek_time(&self) -> Option<SimTime> {
        self.heap.peek().map(|Reverse(entry)| entry.time)
    }

    fn pop_entry(&mut self) -> Option<(SimTime, EventKey)> {
        self.heap.pop().map(|Reverse(entry)| (entry.time, entry.event))
    }
}

// ============================================================================
// Run loop - lives on Sim because stepping a task needs the whole world
// ============================================================================

impl Sim {
    /// Advance simulated time, stepping events in order. Stops when the
    /// horizon is reached, when the watched event fires, when the queue
    /// drains, or when [`Scheduler::stop`] was requested (returning `Ok`).
    /// An unhandled task failure aborts the run with its error.
    pub fn run(&mut self, until: Until) -> Result<(), SimError> {
        let watch = match until {
            Until::Event(event) => Some(event),
            _ => None,
        };
        loop {
            if self.sched.stop_requested {
                self.sched.stop_requested = false;
                return Ok(());
            }
            if let Some(error) = self.sched.failure.take() {
                return Err(error);
            }
            let Some(next_time) = self.sched.peek_time() else {
                if let Until::Time(t) = until {
                    if t > self.sched.now {
                        self.sched.now = t;
                    }
                }
                return Ok(());
            };
            if let Until::Time(t) = until {
                if next_time > t {
                    self.sched.now = t;
                    return Ok(());
                }
            }
            let Some((time, event)) = self.sched.pop_entry() else {
                return Ok(());
            };
            self.sched.now = time;
            if self.dispatch(event) && watch == Some(event) {
                return Ok(());
            }
        }
    }

    /// Fire an event: resume every waiting task in registration order and
    /// notify composite parents. Returns whether the event existed.
    fn dispatch(&mut self, event: EventKey) -> bool {
        let Some(state) = self.sched.events.remove(event) else {
            return false;
        };
        let EventState { kind, payload, waiters, .. } = state;
        for waiter in waiters {
            match waiter {
                Waiter::Task(task) => {
                    let resume = match &kind {
                        EventKind::Start => Resume::Started,
                        EventKind::Fire => Resume::Fired(payload.clone()),
                        EventKind::Interrupt => Resume::Interrupted,
                        EventKind::Fail(error) => Resume::Failed(error.clone()),
                    };
                    self.step_task(task, resume);
                }
                Waiter::Composite(parent) => {
                    let child_payload = match &kind {
                        EventKind::Fail(_) => Payload::None,
                        _ => payload.clone(),
                    };
                    self.sched.notify_composite(parent, child_payload);
                }
            }
        }
        true
    }

    fn step_task(&mut self, task: TaskKey, input: Resume) {
        let Some(slot) = self.sched.tasks.get_mut(task) else {
            return;
        };
        let Some(mut body) = slot.body.take() else {
            return;
        };
        self.sched.waiting.remove(task);

        let previous = self.sched.current.replace(task);
        let step = body.resume(self, input);
        self.sched.current = previous;
        match step {
            Step::Wait(event) => {
                if !self.sched.add_task_waiter(event, task) {
                    // The event was already consumed; resume next round so the
                    // task can re-examine the state it was waiting for.
                    let placeholder = self.sched.event();
                    self.sched.succeed(placeholder, Payload::None);
                    self.sched.add_task_waiter(placeholder, task);
                }
                if let Some(slot) = self.sched.tasks.get_mut(task) {
                    slot.body = Some(body);
                }
            }
            Step::Done => {
                if let Some(slot) = self.sched.tasks.remove(task) {
                    if let Some(done) = slot.done {
                        self.sched.succeed(done, Payload::None);
                    }
                }
            }
            Step::Failed(error) => {
                #[cfg(feature = "instrument")]
                tracing::info!(
                    target: "sim_failure",
                    sim_time = self.sched.now(),
                    error = %error,
                );
                if let Some(slot) = self.sched.tasks.remove(task) {
                    if let Some(done) = slot.done {
                        self.sched.fail(done, error.clone());
                    }
                }
                self.sched.failure = Some(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Sim;

    struct Ticker {
        delays: Vec<SimTime>,
        fired_at: Vec<SimTime>,
        cursor: usize,
    }

    impl Process for Ticker {
        fn resume(&mut self, sim: &mut Sim, _input: Resume) -> Step {
            if self.cursor > 0 {
                self.fired_at.push(sim.sched.now());
            }
            if self.cursor >= self.delays.len() {
                return Step::Done;
            }
            let delay = self.delays[self.cursor];
            self.cursor += 1;
            Step::Wait(sim.sched.timeout(delay))
        }
    }

    #[test]
    fn timeouts_fire_in_order_and_advance_the_clock() {
        let mut sim = Sim::new();
        sim.sched.spawn(Box::new(Ticker {
            delays: vec![1.0, 2.0, 0.0],
            fired_at: Vec::new(),
            cursor: 0,
        }));
        sim.run(Until::Forever).unwrap();
        assert_eq!(sim.sched.now(), 3.0);
    }

    #[test]
    fn run_until_time_stops_at_horizon() {
        let mut sim = Sim::new();
        sim.sched.spawn(Box::new(Ticker {
            delays: vec![10.0, 10.0],
            fired_at: Vec::new(),
            cursor: 0,
        }));
        sim.run(Until::Time(15.0)).unwrap();
        assert_eq!(sim.sched.now(), 15.0);
    }

    struct Waiting {
        event: EventKey,
    }

    impl Process for Waiting {
        fn resume(&mut self, _sim: &mut Sim, input: Resume) -> Step {
            match input {
                Resume::Started => Step::Wait(self.event),
                Resume::Fired(payload) => {
                    assert_eq!(payload, Payload::Raw(7));
                    Step::Done
                }
                _ => Step::Done,
            }
        }
    }

    struct Firing {
        event: EventKey,
    }

    impl Process for Firing {
        fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
            match input {
                Resume::Started => Step::Wait(sim.sched.timeout(5.0)),
                _ => {
                    sim.sched.succeed(self.event, Payload::Raw(7));
                    Step::Done
                }
            }
        }
    }

    #[test]
    fn bare_events_carry_payloads_to_waiters() {
        let mut sim = Sim::new();
        let event = sim.sched.event();
        sim.sched.spawn(Box::new(Waiting { event }));
        sim.sched.spawn(Box::new(Firing { event }));
        sim.run(Until::Forever).unwrap();
        assert_eq!(sim.sched.now(), 5.0);
    }

    #[test]
    fn same_time_events_fire_in_creation_order() {
        let mut sim = Sim::new();
        let first = sim.sched.timeout(1.0);
        let second = sim.sched.timeout(1.0);
        // Run until the *second* event; the first must already be consumed.
        sim.run(Until::Event(second)).unwrap();
        assert!(!sim.sched.event_exists(first));
        assert_eq!(sim.sched.now(), 1.0);
    }

    #[test]
    fn any_of_fires_on_first_child() {
        let mut sim = Sim::new();
        let slow = sim.sched.timeout(10.0);
        let fast = sim.sched.timeout(2.0);
        let either = sim.sched.any_of(&[slow, fast]);
        sim.run(Until::Event(either)).unwrap();
        assert_eq!(sim.sched.now(), 2.0);
    }

    #[test]
    fn all_of_waits_for_every_child() {
        let mut sim = Sim::new();
        let a = sim.sched.timeout(3.0);
        let b = sim.sched.timeout(8.0);
        let both = sim.sched.all_of(&[a, b]);
        sim.run(Until::Event(both)).unwrap();
        assert_eq!(sim.sched.now(), 8.0);
    }

    #[test]
    fn stop_aborts_run_normally() {
        let mut sim = Sim::new();
        sim.sched.timeout(100.0);
        sim.sched.stop();
        sim.run(Until::Forever).unwrap();
        assert_eq!(sim.sched.now(), 0.0);
    }
}
