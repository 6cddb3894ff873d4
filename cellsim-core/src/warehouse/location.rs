//! Physical storage locations.
//!
//! A location is two physical positions in depth: the outer (first) position
//! is in front of the inner (second) one, so the outer may be occupied only
//! if the inner already is, and picks always take the outermost unit load.
//! A location never mixes products.

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::errors::SimError;
use crate::types::{ProductId, UnitLoadId};
use crate::unitload::UnitLoad;

/// One physical pallet slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhysicalPosition {
    pub unit_load: Option<UnitLoadId>,
    pub n_cases: u32,
}

impl PhysicalPosition {
    pub fn free(&self) -> bool {
        self.unit_load.is_none()
    }

    pub fn busy(&self) -> bool {
        self.unit_load.is_some()
    }

    pub fn put(&mut self, unit_load: UnitLoadId, n_cases: u32) -> Result<(), SimError> {
        if self.busy() {
            return Err(SimError::PhysicalPositionBusy);
        }
        self.unit_load = Some(unit_load);
        self.n_cases = n_cases;
        Ok(())
    }

    pub fn take(&mut self) -> Result<UnitLoadId, SimError> {
        let Some(unit_load) = self.unit_load.take() else {
            return Err(SimError::PhysicalPositionEmpty);
        };
        self.n_cases = 0;
        Ok(unit_load)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// A two-deep storage location in a warehouse aisle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseLocation {
    pub x: i64,
    pub y: i64,
    pub side: Side,
    pub depth: u8,
    /// Outer position; reachable first, filled last.
    pub first_position: PhysicalPosition,
    /// Inner position; filled first, reachable last.
    pub second_position: PhysicalPosition,
    pub frozen: bool,
    /// Unit loads booked to arrive here.
    pub future_unit_loads: Vec<UnitLoadId>,
    /// Unit loads booked to be picked from here.
    pub booked_pickups: Vec<UnitLoadId>,
}

impl WarehouseLocation {
    pub fn new(x: i64, y: i64, side: Side) -> Self {
        Self {
            x,
            y,
            side,
            depth: 2,
            first_position: PhysicalPosition::default(),
            second_position: PhysicalPosition::default(),
            frozen: false,
            future_unit_loads: Vec::new(),
            booked_pickups: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first_position.free() && self.second_position.free()
    }

    pub fn is_half_full(&self) -> bool {
        self.second_position.busy() && self.first_position.free()
    }

    pub fn is_full(&self) -> bool {
        self.first_position.busy() && self.second_position.busy()
    }

    pub fn n_unit_loads(&self) -> usize {
        usize::from(self.first_position.busy()) + usize::from(self.second_position.busy())
    }

    /// The product this location deals with: from its contents when
    /// occupied, otherwise from the first booked arrival.
    pub fn product(&self, unit_loads: &SlotMap<UnitLoadId, UnitLoad>) -> Option<ProductId> {
        if let Ok(unit_load) = self.first_available_unit_load() {
            return unit_loads.get(unit_load).and_then(|ul| ul.product);
        }
        self.future_unit_loads
            .first()
            .and_then(|&booked| unit_loads.get(booked))
            .and_then(|ul| ul.product)
    }

    /// The outermost occupied unit load, the only one reachable by a crane.
    pub fn first_available_unit_load(&self) -> Result<UnitLoadId, SimError> {
        if self.is_full() {
            return Ok(self.first_position.unit_load.expect("full implies outer busy"));
        }
        if self.is_half_full() {
            return Ok(self.second_position.unit_load.expect("half full implies inner busy"));
        }
        Err(SimError::LocationEmpty { x: self.x, y: self.y })
    }

    fn check_compatibility(
        &self,
        unit_load: UnitLoadId,
        unit_loads: &SlotMap<UnitLoadId, UnitLoad>,
    ) -> Result<(), SimError> {
        let incoming = unit_loads.get(unit_load).and_then(|ul| ul.product);
        let resident = self.product(unit_loads);
        match (incoming, resident) {
            (Some(a), Some(b)) if a == b => Ok(()),
            (_, None) => Ok(()),
            _ => Err(SimError::IncompatibleUnitLoad {
                unit_load: crate::types::RawKey::to_raw(unit_load),
                x: self.x,
                y: self.y,
            }),
        }
    }

    /// Reserve the location for an incoming unit load. A non-empty location
    /// only accepts a compatible product.
    pub fn freeze(
        &mut self,
        unit_load: UnitLoadId,
        unit_loads: &SlotMap<UnitLoadId, UnitLoad>,
    ) -> Result<(), SimError> {
        if !self.is_empty() {
            self.check_compatibility(unit_load, unit_loads)?;
        }
        self.frozen = true;
        self.future_unit_loads.push(unit_load);
        Ok(())
    }

    pub fn unfreeze(&mut self, unit_load: UnitLoadId) {
        self.future_unit_loads.retain(|&booked| booked != unit_load);
        self.frozen = false;
    }

    /// Reserve the outermost unit load for a future pick.
    pub fn book_pickup(&mut self, unit_load: UnitLoadId) {
        self.booked_pickups.push(unit_load);
    }

    /// Store a unit load. Empty locations fill the inner position; half-full
    /// locations fill the outer one if the product matches; full locations
    /// refuse.
    pub fn put(
        &mut self,
        unit_load: UnitLoadId,
        unit_loads: &SlotMap<UnitLoadId, UnitLoad>,
    ) -> Result<(), SimError> {
        let n_cases = unit_loads.get(unit_load).map(|ul| ul.n_cases()).unwrap_or(0);
        if self.is_empty() {
            self.second_position.put(unit_load, n_cases)?;
        } else if self.is_half_full() {
            self.check_compatibility(unit_load, unit_loads)?;
            self.first_position.put(unit_load, n_cases)?;
        } else {
            return Err(SimError::LocationBusy { x: self.x, y: self.y });
        }
        self.future_unit_loads.retain(|&booked| booked != unit_load);
        if self.future_unit_loads.is_empty() {
            self.frozen = false;
        }
        Ok(())
    }

    /// Pick the outermost occupied unit load and free its position.
    pub fn get(&mut self) -> Result<UnitLoadId, SimError> {
        let unit_load = if self.is_half_full() {
            self.second_position.take()?
        } else if self.is_full() {
            self.first_position.take()?
        } else {
            return Err(SimError::LocationEmpty { x: self.x, y: self.y });
        };
        self.booked_pickups.retain(|&booked| booked != unit_load);
        Ok(unit_load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::products::Product;
    use crate::unitload::UnitLoad;

    fn fixture() -> (SlotMap<UnitLoadId, UnitLoad>, Vec<UnitLoadId>, Vec<ProductId>) {
        let mut products: SlotMap<ProductId, Product> = SlotMap::with_key();
        let spec = Product {
            probability: 1.0,
            family: "t".to_string(),
            cases_per_layer: 10,
            layers_per_pallet: 4,
            min_case_per_pallet: 60,
            max_case_per_pallet: 60,
            lp_enabled: true,
            reorder_level: 4,
        };
        let a = products.insert(spec.clone());
        let b = products.insert(spec.clone());
        let mut unit_loads = SlotMap::with_key();
        let ul_a = unit_loads.insert(UnitLoad::full_of(a, &spec));
        let ul_a2 = unit_loads.insert(UnitLoad::full_of(a, &spec));
        let ul_b = unit_loads.insert(UnitLoad::full_of(b, &spec));
        (unit_loads, vec![ul_a, ul_a2, ul_b], vec![a, b])
    }

    #[test]
    fn put_fills_inner_then_outer() {
        let (unit_loads, uls, _) = fixture();
        let mut location = WarehouseLocation::new(0, 0, Side::Left);

        location.freeze(uls[0], &unit_loads).unwrap();
        location.put(uls[0], &unit_loads).unwrap();
        assert!(location.is_half_full());
        assert!(location.first_position.free());

        location.freeze(uls[1], &unit_loads).unwrap();
        location.put(uls[1], &unit_loads).unwrap();
        assert!(location.is_full());
    }

    #[test]
    fn incompatible_product_is_refused() {
        let (unit_loads, uls, _) = fixture();
        let mut location = WarehouseLocation::new(0, 0, Side::Left);
        location.put(uls[0], &unit_loads).unwrap();
        let err = location.put(uls[2], &unit_loads).unwrap_err();
        assert!(matches!(err, SimError::IncompatibleUnitLoad { .. }));
    }

    #[test]
    fn get_returns_the_outermost_unit_load() {
        let (unit_loads, uls, _) = fixture();
        let mut location = WarehouseLocation::new(0, 0, Side::Left);
        location.put(uls[0], &unit_loads).unwrap();
        location.put(uls[1], &unit_loads).unwrap();
        assert_eq!(location.get().unwrap(), uls[1]);
        assert_eq!(location.get().unwrap(), uls[0]);
        assert!(location.is_empty());
        assert!(location.get().is_err());
    }

    #[test]
    fn freeze_put_book_get_round_trips_and_leaves_empty() {
        let (unit_loads, uls, _) = fixture();
        let mut location = WarehouseLocation::new(0, 0, Side::Left);
        location.freeze(uls[0], &unit_loads).unwrap();
        location.put(uls[0], &unit_loads).unwrap();
        location.book_pickup(uls[0]);
        assert_eq!(location.get().unwrap(), uls[0]);
        assert!(location.is_empty());
        assert!(location.booked_pickups.is_empty());
        assert!(!location.frozen);
    }

    #[test]
    fn full_location_refuses_another_put() {
        let (unit_loads, uls, _) = fixture();
        let mut location = WarehouseLocation::new(0, 0, Side::Left);
        location.put(uls[0], &unit_loads).unwrap();
        location.put(uls[1], &unit_loads).unwrap();
        let err = location.put(uls[1], &unit_loads).unwrap_err();
        assert!(matches!(err, SimError::LocationBusy { .. }));
    }
}
