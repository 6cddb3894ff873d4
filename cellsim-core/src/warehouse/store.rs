//! A warehouse store: a bank of two-deep locations served by one crane.

use crate::resources::PrioritySemaphore;
use crate::types::{History, LocationId, ProductId, SimTime, UnitLoadId};
use crate::unitload::UnitLoad;
use crate::warehouse::WarehouseLocation;

use slotmap::SlotMap;

/// Aggregates storage locations behind a capacity-1 crane. AGVs interact
/// with the store at its input (for putaway) and output (for retrieval)
/// locations; the crane consumes a fixed time per movement.
pub struct WarehouseStore {
    pub name: String,
    pub locations: Vec<WarehouseLocation>,
    pub input_location: LocationId,
    pub output_location: LocationId,
    pub crane: PrioritySemaphore,
    /// Crane time to bring a unit load to the output bay.
    pub retrieval_time: f64,
    /// Crane time to store a unit load from the input bay.
    pub storage_time: f64,
    pub input_agvs_queue: u32,
    pub output_agvs_queue: u32,
    pub input_queue_history: History<u32>,
    pub output_queue_history: History<u32>,
}

impl WarehouseStore {
    pub fn new(
        name: impl Into<String>,
        locations: Vec<WarehouseLocation>,
        input_location: LocationId,
        output_location: LocationId,
        retrieval_time: f64,
        storage_time: f64,
    ) -> Self {
        Self {
            name: name.into(),
            locations,
            input_location,
            output_location,
            crane: PrioritySemaphore::new(1),
            retrieval_time,
            storage_time,
            input_agvs_queue: 0,
            output_agvs_queue: 0,
            input_queue_history: Vec::new(),
            output_queue_history: Vec::new(),
        }
    }

    pub fn note_input_queue(&mut self, now: SimTime, delta: i32) {
        self.input_agvs_queue = self.input_agvs_queue.saturating_add_signed(delta);
        self.input_queue_history.push((now, self.input_agvs_queue));
    }

    pub fn note_output_queue(&mut self, now: SimTime, delta: i32) {
        self.output_agvs_queue = self.output_agvs_queue.saturating_add_signed(delta);
        self.output_queue_history.push((now, self.output_agvs_queue));
    }

    /// Locations currently dealing with `product`, by index.
    pub fn locations_for<'a>(
        &'a self,
        product: ProductId,
        unit_loads: &'a SlotMap<UnitLoadId, UnitLoad>,
    ) -> impl Iterator<Item = usize> + 'a {
        self.locations
            .iter()
            .enumerate()
            .filter(move |(_, location)| location.product(unit_loads) == Some(product))
            .map(|(idx, _)| idx)
    }

    /// Total cases of `product` physically present in the store.
    pub fn on_hand_cases(
        &self,
        product: ProductId,
        unit_loads: &SlotMap<UnitLoadId, UnitLoad>,
    ) -> u32 {
        self.locations
            .iter()
            .flat_map(|location| {
                [location.first_position.unit_load, location.second_position.unit_load]
            })
            .flatten()
            .filter_map(|ul| unit_loads.get(ul))
            .map(|ul| ul.n_cases_of(product))
            .sum()
    }
}
