use serde::{Deserialize, Serialize};
use slotmap::{Key, KeyData, new_key_type};

// ============================================================================
// Simulated time
// ============================================================================

/// Simulated seconds. Monotonically non-decreasing, never negative.
pub type SimTime = f64;

/// A `(time, value)` sample series.
pub type History<T> = Vec<(SimTime, T)>;

// ============================================================================
// IDs - generational arena keys, one class per entity kind
// ============================================================================

new_key_type! {
    pub struct ProductId;
    pub struct UnitLoadId;
    pub struct LocationId;
    pub struct PalletRequestId;
    pub struct JobId;
    pub struct ServerId;
    pub struct StoreId;
    pub struct CellId;
    pub struct AgvId;
    pub struct FoId;
}

/// Round-trip between an arena key and its `u64` FFI encoding.
///
/// Event payloads and store items travel through the kernel as raw `u64`s so
/// the kernel stays ignorant of entity types; typed wrappers convert at the
/// boundary.
pub trait RawKey: Copy {
    fn to_raw(self) -> u64;
    fn from_raw(raw: u64) -> Self;
}

impl<K: Key> RawKey for K {
    fn to_raw(self) -> u64 {
        self.data().as_ffi()
    }

    fn from_raw(raw: u64) -> Self {
        KeyData::from_ffi(raw).into()
    }
}

// ============================================================================
// Geographic locations
// ============================================================================

/// A named point on the plant floor. AGV trips run between locations; travel
/// time is `distance / speed` under the configured metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub x: i64,
    pub y: i64,
}

impl Location {
    pub fn new(name: impl Into<String>, x: i64, y: i64) -> Self {
        Self { name: name.into(), x, y }
    }
}

// ============================================================================
// Workload units
// ============================================================================

/// Unit of measure for picking-cell workload accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadUnit {
    Cases,
    Layers,
}
