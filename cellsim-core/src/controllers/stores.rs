//! Stock ledger and storing/retrieval policies.

use slotmap::SecondaryMap;

use crate::errors::SimError;
use crate::sim::Sim;
use crate::types::{ProductId, RawKey, StoreId, UnitLoadId};
use crate::unitload::UnitLoad;
use crate::world::World;

// ============================================================================
// Stock ledger
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ProductStock {
    /// Cases physically in the stores.
    pub on_hand: i64,
    /// Cases ordered or traveling, not yet stored.
    pub on_transit: i64,
}

/// Per-product on-hand / on-transit accounting, maintained by every store
/// movement the controllers organize.
#[derive(Debug, Default)]
pub struct StockLedger {
    stock: SecondaryMap<ProductId, ProductStock>,
}

impl StockLedger {
    pub fn on_hand(&self, product: ProductId) -> i64 {
        self.stock.get(product).map(|s| s.on_hand).unwrap_or(0)
    }

    pub fn on_transit(&self, product: ProductId) -> i64 {
        self.stock.get(product).map(|s| s.on_transit).unwrap_or(0)
    }

    /// On-hand plus on-transit: what replenishment decisions look at.
    pub fn inventory_position(&self, product: ProductId) -> i64 {
        let stock = self.stock.get(product).copied().unwrap_or_default();
        stock.on_hand + stock.on_transit
    }

    pub fn add_on_hand(&mut self, product: ProductId, cases: i64) {
        if !self.stock.contains_key(product) {
            self.stock.insert(product, ProductStock::default());
        }
        self.stock[product].on_hand += cases;
    }

    pub fn add_on_transit(&mut self, product: ProductId, cases: i64) {
        if !self.stock.contains_key(product) {
            self.stock.insert(product, ProductStock::default());
        }
        self.stock[product].on_transit += cases;
    }
}

// ============================================================================
// Policies
// ============================================================================

/// Chooses where an incoming unit load is stored.
pub trait StoringPolicy {
    /// Location index within `store` for a unit load of `product`.
    fn find_location(&self, world: &World, store: StoreId, product: ProductId) -> Option<usize>;
}

/// Prefer topping up a compatible half-full location, then the first empty
/// one, scanning the aisle in order.
pub struct NearestStoring;

impl StoringPolicy for NearestStoring {
    fn find_location(&self, world: &World, store: StoreId, product: ProductId) -> Option<usize> {
        let store = &world.stores[store];
        let compatible = store.locations.iter().enumerate().find(|(_, location)| {
            location.is_half_full()
                && !location.frozen
                && location.booked_pickups.is_empty()
                && location.product(&world.unit_loads) == Some(product)
        });
        if let Some((idx, _)) = compatible {
            return Some(idx);
        }
        store
            .locations
            .iter()
            .enumerate()
            .find(|(_, location)| location.is_empty() && !location.frozen)
            .map(|(idx, _)| idx)
    }
}

/// Chooses which unit load feeds a picking request.
pub trait RetrievalPolicy {
    /// `(store, location index, unit load)` able to supply `n_cases` of
    /// `product`, or [`SimError::OutOfStock`].
    fn find_unit_load(
        &self,
        world: &World,
        product: ProductId,
        n_cases: u32,
    ) -> Result<(StoreId, usize, UnitLoadId), SimError>;
}

/// Prefer partial unit loads (cleans up remnants first), then any location
/// holding the product, outermost pallet only.
pub struct PartialFirstRetrieval;

impl RetrievalPolicy for PartialFirstRetrieval {
    fn find_unit_load(
        &self,
        world: &World,
        product: ProductId,
        n_cases: u32,
    ) -> Result<(StoreId, usize, UnitLoadId), SimError> {
        let mut fallback: Option<(StoreId, usize, UnitLoadId)> = None;
        for (store_id, store) in world.stores.iter() {
            for (idx, location) in store.locations.iter().enumerate() {
                if location.frozen {
                    continue;
                }
                let Ok(unit_load_id) = location.first_available_unit_load() else {
                    continue;
                };
                if !location.booked_pickups.is_empty() {
                    continue;
                }
                let Some(unit_load) = world.unit_loads.get(unit_load_id) else {
                    continue;
                };
                if unit_load.product != Some(product) || unit_load.n_cases() == 0 {
                    continue;
                }
                let product_spec = &world.products[product];
                if unit_load.is_partial(product_spec) && unit_load.n_cases() >= n_cases {
                    return Ok((store_id, idx, unit_load_id));
                }
                if fallback.is_none() && unit_load.n_cases() >= n_cases {
                    fallback = Some((store_id, idx, unit_load_id));
                }
            }
        }
        fallback.ok_or(SimError::OutOfStock { product: product.to_raw(), requested: n_cases })
    }
}

// ============================================================================
// Controller entry points
// ============================================================================

/// Find and book a unit load for a feeding operation.
///
/// On [`SimError::OutOfStock`], unless `raise_on_none` is set, falls back
/// to the magic replenishment rule: a synthetic full pallet materializes,
/// bound to no storage location.
pub fn book_unit_load_for_feeding(
    sim: &mut Sim,
    product: ProductId,
    n_cases: u32,
    raise_on_none: bool,
) -> Result<(StoreId, Option<usize>, UnitLoadId), SimError> {
    let found = sim.world.system.retrieval_policy.find_unit_load(&sim.world, product, n_cases);
    match found {
        Ok((store, location, unit_load)) => {
            let booked_cases = sim.world.unit_loads[unit_load].n_cases();
            sim.world.stores[store].locations[location].book_pickup(unit_load);
            sim.world.stock.add_on_hand(product, -i64::from(booked_cases));
            Ok((store, Some(location), unit_load))
        }
        Err(error @ SimError::OutOfStock { .. }) => {
            if raise_on_none || !sim.world.system.magic_replenishment {
                return Err(error);
            }
            let store = sim
                .world
                .stores
                .keys()
                .next()
                .ok_or(SimError::OutOfStock { product: product.to_raw(), requested: n_cases })?;
            let spec = sim.world.products[product].clone();
            let unit_load = sim.world.unit_loads.insert(UnitLoad::full_of(product, &spec));
            #[cfg(feature = "instrument")]
            tracing::info!(
                target: "magic_replenishment",
                sim_time = sim.sched.now(),
                product = product.to_raw(),
                n_cases = spec.case_per_pallet(),
            );
            Ok((store, None, unit_load))
        }
        Err(error) => Err(error),
    }
}

/// Store a unit load at a location chosen by the storing policy, updating
/// the ledger. Used by return legs and replenishment arrivals.
pub fn store_unit_load(
    sim: &mut Sim,
    store: StoreId,
    unit_load: UnitLoadId,
) -> Result<usize, SimError> {
    let product = sim.world.unit_loads[unit_load].product;
    let Some(product) = product else {
        return Err(SimError::InvalidRequest("cannot store a mixed unit load".into()));
    };
    let location = sim
        .world
        .system
        .storing_policy
        .find_location(&sim.world, store, product)
        .ok_or(SimError::LocationBusy { x: -1, y: -1 })?;
    let cases = {
        let World { stores, unit_loads, .. } = &mut sim.world;
        stores[store].locations[location].put(unit_load, unit_loads)?;
        unit_loads[unit_load].n_cases()
    };
    sim.world.stock.add_on_hand(product, i64::from(cases));
    Ok(location)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_tracks_inventory_position() {
        let mut products: slotmap::SlotMap<ProductId, ()> = slotmap::SlotMap::with_key();
        let product = products.insert(());
        let mut ledger = StockLedger::default();
        ledger.add_on_hand(product, 120);
        ledger.add_on_transit(product, 40);
        ledger.add_on_hand(product, -20);
        assert_eq!(ledger.on_hand(product), 100);
        assert_eq!(ledger.inventory_position(product), 140);
    }
}
