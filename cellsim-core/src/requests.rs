//! The picking request tree: case -> product -> layer -> pallet.
//!
//! A pallet request is the unit of demand handed to a picking cell. Its
//! leaves are single-case picks; the root owns the unit load being built.

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::errors::SimError;
use crate::products::Product;
use crate::types::{CellId, FoId, ProductId, SimTime, UnitLoadId, WorkloadUnit};

/// Atomic pick of one case of a product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRequest {
    pub product: ProductId,
    pub picked: bool,
}

/// 1..`cases_per_layer` case requests of one product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRequest {
    /// Monotonically increasing across all product requests.
    pub id: u64,
    pub product: ProductId,
    pub n_cases: u32,
    pub picked_n_cases: u32,
    pub cases: Vec<CaseRequest>,
    /// Feeding operations scheduled to serve this request.
    pub feeding_operations: Vec<FoId>,
}

impl ProductRequest {
    pub fn new(
        id: u64,
        product_id: ProductId,
        product: &Product,
        n_cases: u32,
    ) -> Result<Self, SimError> {
        if n_cases == 0 || n_cases > product.cases_per_layer {
            return Err(SimError::InvalidRequest(format!(
                "product request of {n_cases} cases outside 1..={}",
                product.cases_per_layer
            )));
        }
        Ok(Self {
            id,
            product: product_id,
            n_cases,
            picked_n_cases: 0,
            cases: (0..n_cases).map(|_| CaseRequest { product: product_id, picked: false }).collect(),
            feeding_operations: Vec::new(),
        })
    }

    pub fn processed(&self) -> bool {
        self.picked_n_cases == self.n_cases
    }

    pub fn remaining_to_pick(&self) -> u32 {
        self.n_cases - self.picked_n_cases
    }

    /// Record `n` picked cases, ticking off case requests in order.
    pub fn mark_picked(&mut self, n: u32) {
        let n = n.min(self.remaining_to_pick());
        for case in self.cases.iter_mut().filter(|case| !case.picked).take(n as usize) {
            case.picked = true;
        }
        self.picked_n_cases += n;
    }
}

/// One pallet layer's worth of product requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerRequest {
    pub product_requests: Vec<ProductRequest>,
}

impl LayerRequest {
    pub fn new(
        product_requests: Vec<ProductRequest>,
        products: &SlotMap<ProductId, Product>,
    ) -> Result<Self, SimError> {
        if product_requests.is_empty() {
            return Err(SimError::InvalidRequest("layer request needs a product request".into()));
        }
        let n_cases: u32 = product_requests.iter().map(|pr| pr.n_cases).sum();
        let bound: u32 = product_requests
            .iter()
            .filter_map(|pr| products.get(pr.product))
            .map(|product| product.cases_per_layer)
            .sum();
        if n_cases > bound {
            return Err(SimError::InvalidRequest(format!(
                "layer request of {n_cases} cases overflows its layer bound {bound}"
            )));
        }
        Ok(Self { product_requests })
    }

    pub fn n_cases(&self) -> u32 {
        self.product_requests.iter().map(|pr| pr.n_cases).sum()
    }

    pub fn picked_n_cases(&self) -> u32 {
        self.product_requests.iter().map(|pr| pr.picked_n_cases).sum()
    }

    pub fn processed(&self) -> bool {
        self.product_requests.iter().all(ProductRequest::processed)
    }

    /// True when the layer should be handled by a layer-picking cell.
    pub fn has_single_product_request(&self) -> bool {
        self.product_requests.len() == 1
    }

    pub fn total_workload(&self, unit: WorkloadUnit) -> u32 {
        match unit {
            WorkloadUnit::Layers => 1,
            WorkloadUnit::Cases => self.n_cases(),
        }
    }

    pub fn remaining_workload(&self, unit: WorkloadUnit) -> u32 {
        match unit {
            WorkloadUnit::Layers => 1 - u32::from(self.processed()),
            WorkloadUnit::Cases => self.n_cases() - self.picked_n_cases(),
        }
    }
}

/// Ordered sequence of layer requests building one output pallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PalletRequest {
    /// Monotonically increasing across all pallet requests.
    pub id: u64,
    pub layers: Vec<LayerRequest>,
    /// The pallet under construction.
    pub unit_load: UnitLoadId,
    pub started_at: Option<SimTime>,
    pub completed_at: Option<SimTime>,
    pub assigned_cell: Option<CellId>,
}

impl PalletRequest {
    pub fn new(id: u64, layers: Vec<LayerRequest>, unit_load: UnitLoadId) -> Result<Self, SimError> {
        if layers.is_empty() {
            return Err(SimError::InvalidRequest("pallet request needs a layer request".into()));
        }
        Ok(Self { id, layers, unit_load, started_at: None, completed_at: None, assigned_cell: None })
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn n_cases(&self) -> u32 {
        self.layers.iter().map(LayerRequest::n_cases).sum()
    }

    pub fn processed(&self) -> bool {
        self.layers.iter().all(LayerRequest::processed)
    }

    /// Every layer holds exactly one product request.
    pub fn is_for_layer_picking_cell(&self) -> bool {
        self.layers.iter().all(LayerRequest::has_single_product_request)
    }

    /// No layer holds a single product request.
    pub fn is_for_case_picking_cell(&self) -> bool {
        self.layers.iter().all(|layer| !layer.has_single_product_request())
    }

    pub fn total_workload(&self, unit: WorkloadUnit) -> u32 {
        self.layers.iter().map(|layer| layer.total_workload(unit)).sum()
    }

    pub fn remaining_workload(&self, unit: WorkloadUnit) -> u32 {
        self.layers.iter().map(|layer| layer.remaining_workload(unit)).sum()
    }

    pub fn started(&mut self, now: SimTime) {
        self.started_at = Some(now);
    }

    pub fn completed(&mut self, now: SimTime) {
        self.completed_at = Some(now);
    }

    pub fn lead_time(&self) -> Option<SimTime> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Product requests in pallet order (layer by layer).
    pub fn product_requests(&self) -> impl Iterator<Item = &ProductRequest> {
        self.layers.iter().flat_map(|layer| layer.product_requests.iter())
    }

    pub fn product_request(&self, id: u64) -> Option<&ProductRequest> {
        self.product_requests().find(|pr| pr.id == id)
    }

    pub fn product_request_mut(&mut self, id: u64) -> Option<&mut ProductRequest> {
        self.layers
            .iter_mut()
            .flat_map(|layer| layer.product_requests.iter_mut())
            .find(|pr| pr.id == id)
    }

    /// The first product request, in pallet order, with unpicked cases.
    /// This is what the staging admission rule calls "the next unmet
    /// product request".
    pub fn next_unmet_product_request(&self) -> Option<u64> {
        self.product_requests().find(|pr| !pr.processed()).map(|pr| pr.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unitload::UnitLoad;

    fn products(n: usize) -> (SlotMap<ProductId, Product>, Vec<ProductId>) {
        let mut arena = SlotMap::with_key();
        let ids = (0..n)
            .map(|_| {
                arena.insert(Product {
                    probability: 1.0,
                    family: "t".to_string(),
                    cases_per_layer: 10,
                    layers_per_pallet: 4,
                    min_case_per_pallet: 60,
                    max_case_per_pallet: 60,
                    lp_enabled: true,
                    reorder_level: 4,
                })
            })
            .collect();
        (arena, ids)
    }

    fn unit_load() -> UnitLoadId {
        let mut arena: SlotMap<UnitLoadId, UnitLoad> = SlotMap::with_key();
        arena.insert(UnitLoad::empty())
    }

    #[test]
    fn product_request_bounds_are_enforced() {
        let (arena, ids) = products(1);
        let product = &arena[ids[0]];
        assert!(ProductRequest::new(0, ids[0], product, 0).is_err());
        assert!(ProductRequest::new(0, ids[0], product, 11).is_err());
        let pr = ProductRequest::new(0, ids[0], product, 10).unwrap();
        assert_eq!(pr.cases.len(), 10);
    }

    #[test]
    fn picking_accounts_cases_and_completion() {
        let (arena, ids) = products(1);
        let mut pr = ProductRequest::new(0, ids[0], &arena[ids[0]], 4).unwrap();
        pr.mark_picked(3);
        assert_eq!(pr.remaining_to_pick(), 1);
        assert!(!pr.processed());
        pr.mark_picked(5); // clamped to what remains
        assert!(pr.processed());
        assert!(pr.cases.iter().all(|case| case.picked));
    }

    #[test]
    fn pallet_classification_by_layer_shape() {
        let (arena, ids) = products(2);
        let single = |id: u64| {
            LayerRequest::new(
                vec![ProductRequest::new(id, ids[0], &arena[ids[0]], 10).unwrap()],
                &arena,
            )
            .unwrap()
        };
        let mixed = |id: u64| {
            LayerRequest::new(
                vec![
                    ProductRequest::new(id, ids[0], &arena[ids[0]], 4).unwrap(),
                    ProductRequest::new(id + 1, ids[1], &arena[ids[1]], 3).unwrap(),
                ],
                &arena,
            )
            .unwrap()
        };

        let layer_pallet = PalletRequest::new(0, vec![single(0), single(1)], unit_load()).unwrap();
        assert!(layer_pallet.is_for_layer_picking_cell());
        assert!(!layer_pallet.is_for_case_picking_cell());

        let case_pallet = PalletRequest::new(1, vec![mixed(2), mixed(4)], unit_load()).unwrap();
        assert!(case_pallet.is_for_case_picking_cell());
        assert!(!case_pallet.is_for_layer_picking_cell());

        let hybrid = PalletRequest::new(2, vec![single(6), mixed(7)], unit_load()).unwrap();
        assert!(!hybrid.is_for_layer_picking_cell());
        assert!(!hybrid.is_for_case_picking_cell());
    }

    #[test]
    fn next_unmet_follows_pallet_order() {
        let (arena, ids) = products(1);
        let layer = |id: u64, n: u32| {
            LayerRequest::new(
                vec![ProductRequest::new(id, ids[0], &arena[ids[0]], n).unwrap()],
                &arena,
            )
            .unwrap()
        };
        let mut pallet = PalletRequest::new(0, vec![layer(0, 2), layer(1, 3)], unit_load()).unwrap();
        assert_eq!(pallet.next_unmet_product_request(), Some(0));
        pallet.product_request_mut(0).unwrap().mark_picked(2);
        assert_eq!(pallet.next_unmet_product_request(), Some(1));
        pallet.product_request_mut(1).unwrap().mark_picked(3);
        assert_eq!(pallet.next_unmet_product_request(), None);
        assert!(pallet.processed());
    }

    #[test]
    fn workload_in_both_units() {
        let (arena, ids) = products(1);
        let layer = |id: u64, n: u32| {
            LayerRequest::new(
                vec![ProductRequest::new(id, ids[0], &arena[ids[0]], n).unwrap()],
                &arena,
            )
            .unwrap()
        };
        let mut pallet = PalletRequest::new(0, vec![layer(0, 10), layer(1, 5)], unit_load()).unwrap();
        assert_eq!(pallet.total_workload(WorkloadUnit::Layers), 2);
        assert_eq!(pallet.total_workload(WorkloadUnit::Cases), 15);
        pallet.product_request_mut(0).unwrap().mark_picked(10);
        assert_eq!(pallet.remaining_workload(WorkloadUnit::Layers), 1);
        assert_eq!(pallet.remaining_workload(WorkloadUnit::Cases), 5);
    }
}
