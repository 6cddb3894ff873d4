//! Feeding operations: one AGV retrieval of one unit load for one cell.

use serde::{Deserialize, Serialize};

use crate::errors::SimError;
use crate::kernel::EventKey;
use crate::resources::RequestId;
use crate::types::{AgvId, CellId, PalletRequestId, SimTime, StoreId, UnitLoadId};

/// Progress flags of a feeding operation through the cell pipeline. Exactly
/// the flags set so far define where the operation stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoStatus {
    pub arrived: bool,
    pub staging: bool,
    pub inside: bool,
    pub ready: bool,
    pub done: bool,
}

impl FoStatus {
    fn exactly(&self, arrived: bool, staging: bool, inside: bool, ready: bool, done: bool) -> bool {
        self.arrived == arrived
            && self.staging == staging
            && self.inside == inside
            && self.ready == ready
            && self.done == done
    }
}

/// Timestamp log of one feeding operation, from creation to the end of its
/// return or drop leg.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedingOperationLog {
    pub created: SimTime,
    pub started_retrieval: Option<SimTime>,
    pub finished_retrieval: Option<SimTime>,
    pub started_trip_to_store: Option<SimTime>,
    pub finished_trip_to_store: Option<SimTime>,
    pub started_loading: Option<SimTime>,
    pub finished_loading: Option<SimTime>,
    pub started_trip_to_cell: Option<SimTime>,
    pub finished_trip_to_cell: Option<SimTime>,
    pub started_trip_to_staging_area: Option<SimTime>,
    pub finished_trip_to_staging_area: Option<SimTime>,
    pub started_trip_to_internal_area: Option<SimTime>,
    pub finished_trip_to_internal_area: Option<SimTime>,
    pub started_return_trip_to_store: Option<SimTime>,
    pub finished_return_trip_to_store: Option<SimTime>,
    pub started_unloading_for_return: Option<SimTime>,
    pub finished_unloading_for_return: Option<SimTime>,
    pub started_return_trip_to_recharge: Option<SimTime>,
    pub finished_return_trip_to_recharge: Option<SimTime>,
}

impl FeedingOperationLog {
    pub fn new(created: SimTime) -> Self {
        Self { created, ..Default::default() }
    }

    fn span(start: Option<SimTime>, end: Option<SimTime>) -> Option<f64> {
        Some(end? - start?)
    }

    /// Delay between creation and the AGV starting toward the store.
    pub fn startup_delay(&self) -> Option<f64> {
        Self::span(Some(self.created), self.started_trip_to_store)
    }

    pub fn move_to_store(&self) -> Option<f64> {
        Self::span(self.started_trip_to_store, self.finished_trip_to_store)
    }

    pub fn waiting_at_store(&self) -> Option<f64> {
        Self::span(self.finished_trip_to_store, self.started_loading)
    }

    pub fn move_to_cell(&self) -> Option<f64> {
        Self::span(self.started_trip_to_cell, self.finished_trip_to_cell)
    }

    pub fn waiting_at_cell(&self) -> Option<f64> {
        Self::span(self.finished_trip_to_cell, self.started_trip_to_staging_area)
    }

    pub fn waiting_at_staging(&self) -> Option<f64> {
        Self::span(self.finished_trip_to_staging_area, self.started_trip_to_internal_area)
    }

    pub fn waiting_at_internal(&self) -> Option<f64> {
        let left = self.started_return_trip_to_store.or(self.started_return_trip_to_recharge)?;
        Some(left - self.finished_trip_to_internal_area?)
    }

    /// Total life: creation to the end of the return (or drop) leg.
    pub fn life_time(&self) -> Option<f64> {
        let end =
            self.finished_unloading_for_return.or(self.finished_return_trip_to_recharge)?;
        Some(end - self.created)
    }

    /// Every recorded interval must have a positive duration.
    pub fn check(&self) -> Result<(), SimError> {
        let spans = [
            ("retrieval", self.started_retrieval, self.finished_retrieval),
            ("trip to store", self.started_trip_to_store, self.finished_trip_to_store),
            ("loading", self.started_loading, self.finished_loading),
            ("trip to cell", self.started_trip_to_cell, self.finished_trip_to_cell),
            (
                "trip to staging area",
                self.started_trip_to_staging_area,
                self.finished_trip_to_staging_area,
            ),
            (
                "trip to internal area",
                self.started_trip_to_internal_area,
                self.finished_trip_to_internal_area,
            ),
            (
                "return trip to store",
                self.started_return_trip_to_store,
                self.finished_return_trip_to_store,
            ),
            (
                "unloading for return",
                self.started_unloading_for_return,
                self.finished_unloading_for_return,
            ),
        ];
        for (name, start, end) in spans {
            if let (Some(start), Some(end)) = (start, end) {
                if end <= start {
                    return Err(SimError::InvalidRequest(format!(
                        "feeding operation log: {name} interval not consistent"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A scheduled retrieval of a specific unit load from a store to a specific
/// picking cell, carried out by one AGV through the cell's area pipeline.
pub struct FeedingOperation {
    /// Monotonically increasing creation order across all operations; the
    /// internal-area admission picks the smallest.
    pub seq: u64,
    /// Position among the cell's feeding operations.
    pub relative_id: usize,
    pub cell: CellId,
    pub agv: AgvId,
    pub store: StoreId,
    /// Source location index within the store; `None` for synthetic
    /// replenishment loads.
    pub location: Option<usize>,
    pub unit_load: UnitLoadId,
    /// `(pallet request, product request id)` pairs this operation serves.
    pub product_requests: Vec<(PalletRequestId, u64)>,
    /// The retrieved pallet is below a full single-product load.
    pub has_partial_unit_load: bool,

    pub status: FoStatus,
    pub pre_unload_position: Option<usize>,
    pub unload_position: Option<usize>,
    pub unload_position_request: Option<RequestId>,
    pub pre_unload_position_request: Option<RequestId>,
    /// The AGV semaphore grant backing this operation's mission.
    pub mission_request: Option<RequestId>,
    /// Succeeds once the operation reaches its unload position.
    pub ready_event: EventKey,

    pub log: FeedingOperationLog,
}

impl FeedingOperation {
    pub fn is_in_front_of_staging_area(&self) -> bool {
        self.status.exactly(true, false, false, false, false)
    }

    pub fn is_inside_staging_area(&self) -> bool {
        self.status.exactly(true, true, false, false, false)
    }

    pub fn is_in_internal_area(&self) -> bool {
        self.status.exactly(true, true, true, false, false)
    }

    pub fn is_at_unload_position(&self) -> bool {
        self.status.exactly(true, true, true, true, false)
    }

    pub fn is_done(&self) -> bool {
        self.status.exactly(true, true, true, true, true)
    }

    /// Distinct pallet requests this operation contributes to.
    pub fn pallet_requests(&self) -> Vec<PalletRequestId> {
        let mut pallets: Vec<PalletRequestId> =
            self.product_requests.iter().map(|(pallet, _)| *pallet).collect();
        pallets.dedup();
        pallets
    }

    pub fn serves_product_request(&self, product_request: u64) -> bool {
        self.product_requests.iter().any(|(_, id)| *id == product_request)
    }
}
