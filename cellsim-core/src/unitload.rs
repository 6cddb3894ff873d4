//! Unit loads: pallets built from stacked layers of cases.

use serde::{Deserialize, Serialize};

use crate::errors::SimError;
use crate::products::Product;
use crate::types::{FoId, ProductId};

/// One layer of cases on a pallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Layer {
    /// A full or partial layer of a single product.
    Single { product: ProductId, n_cases: u32 },
    /// A mixed layer; per-product case counts.
    Multi { cases: Vec<(ProductId, u32)> },
}

impl Layer {
    pub fn n_cases(&self) -> u32 {
        match self {
            Layer::Single { n_cases, .. } => *n_cases,
            Layer::Multi { cases } => cases.iter().map(|(_, n)| n).sum(),
        }
    }

    pub fn contains(&self, product: ProductId) -> bool {
        match self {
            Layer::Single { product: p, .. } => *p == product,
            Layer::Multi { cases } => cases.iter().any(|(p, _)| *p == product),
        }
    }

    pub fn n_cases_of(&self, product: ProductId) -> u32 {
        match self {
            Layer::Single { product: p, n_cases } if *p == product => *n_cases,
            Layer::Single { .. } => 0,
            Layer::Multi { cases } => {
                cases.iter().filter(|(p, _)| *p == product).map(|(_, n)| n).sum()
            }
        }
    }

    fn remove_case(&mut self, product: ProductId) -> Result<(), SimError> {
        match self {
            Layer::Single { product: p, n_cases } => {
                if *p != product || *n_cases == 0 {
                    return Err(SimError::PhysicalPositionEmpty);
                }
                *n_cases -= 1;
                Ok(())
            }
            Layer::Multi { cases } => {
                let Some(slot) = cases.iter_mut().find(|(p, n)| *p == product && *n > 0) else {
                    return Err(SimError::PhysicalPositionEmpty);
                };
                slot.1 -= 1;
                cases.retain(|(_, n)| *n > 0);
                Ok(())
            }
        }
    }
}

/// An ordered stack of layers on a pallet; the last layer is the top and
/// most accessible one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitLoad {
    pub layers: Vec<Layer>,
    /// Set for single-product pallets; mixed pallets leave it `None`.
    pub product: Option<ProductId>,
    /// The feeding operation currently carting this unit load, if any.
    pub feeding_operation: Option<FoId>,
}

impl UnitLoad {
    /// Empty pallet, ready to be built on.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A full single-product pallet: `layers_per_pallet` layers of
    /// `cases_per_layer` cases each.
    pub fn full_of(product_id: ProductId, product: &Product) -> Self {
        let layers = (0..product.layers_per_pallet)
            .map(|_| Layer::Single { product: product_id, n_cases: product.cases_per_layer })
            .collect();
        Self { layers, product: Some(product_id), feeding_operation: None }
    }

    /// A single-product pallet with the given per-layer case counts (top
    /// last). Validates the per-layer and per-pallet bounds.
    pub fn single(
        product_id: ProductId,
        product: &Product,
        layer_cases: &[u32],
    ) -> Result<Self, SimError> {
        if layer_cases.len() as u32 > product.layers_per_pallet {
            return Err(SimError::InvalidRequest(format!(
                "{} layers exceed layers_per_pallet={}",
                layer_cases.len(),
                product.layers_per_pallet
            )));
        }
        for &n_cases in layer_cases {
            if n_cases > product.cases_per_layer {
                return Err(SimError::InvalidRequest(format!(
                    "layer of {n_cases} cases exceeds cases_per_layer={}",
                    product.cases_per_layer
                )));
            }
        }
        let layers = layer_cases
            .iter()
            .map(|&n_cases| Layer::Single { product: product_id, n_cases })
            .collect();
        Ok(Self { layers, product: Some(product_id), feeding_operation: None })
    }

    pub fn upper_layer(&self) -> Option<&Layer> {
        self.layers.last()
    }

    /// Remove the most accessible layer.
    pub fn remove_layer(&mut self) -> Option<Layer> {
        let layer = self.layers.pop();
        self.prune();
        layer
    }

    /// Remove one case of `product` from the topmost layer holding it.
    pub fn remove_case(&mut self, product: ProductId) -> Result<(), SimError> {
        let Some(layer) =
            self.layers.iter_mut().rev().find(|layer| layer.n_cases_of(product) > 0)
        else {
            return Err(SimError::PhysicalPositionEmpty);
        };
        layer.remove_case(product)?;
        self.prune();
        Ok(())
    }

    fn prune(&mut self) {
        while self.layers.last().is_some_and(|layer| layer.n_cases() == 0) {
            self.layers.pop();
        }
    }

    /// Stack `n_cases` of a product while building a mixed pallet. A count
    /// equal to a full layer becomes a single-product layer; anything
    /// smaller tops up the current mixed layer or starts a new one.
    pub fn add_product(
        &mut self,
        product_id: ProductId,
        product: &Product,
        n_cases: u32,
    ) -> Result<(), SimError> {
        if n_cases > product.cases_per_layer {
            return Err(SimError::InvalidRequest(format!(
                "{n_cases} cases exceed cases_per_layer={}",
                product.cases_per_layer
            )));
        }
        if n_cases == product.cases_per_layer {
            self.layers.push(Layer::Single { product: product_id, n_cases });
        } else {
            match self.layers.last_mut() {
                Some(Layer::Multi { cases }) => cases.push((product_id, n_cases)),
                _ => self.layers.push(Layer::Multi { cases: vec![(product_id, n_cases)] }),
            }
        }
        self.product = self.sole_product();
        Ok(())
    }

    fn sole_product(&self) -> Option<ProductId> {
        let mut sole = None;
        for layer in &self.layers {
            let products: Vec<ProductId> = match layer {
                Layer::Single { product, .. } => vec![*product],
                Layer::Multi { cases } => cases.iter().map(|(p, _)| *p).collect(),
            };
            for product in products {
                match sole {
                    None => sole = Some(product),
                    Some(existing) if existing != product => return None,
                    Some(_) => {}
                }
            }
        }
        sole
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn n_cases(&self) -> u32 {
        self.layers.iter().map(Layer::n_cases).sum()
    }

    pub fn n_cases_of(&self, product: ProductId) -> u32 {
        self.layers.iter().map(|layer| layer.n_cases_of(product)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.n_cases() == 0
    }

    /// A pallet is partial when it is below a full single-product load.
    pub fn is_partial(&self, product: &Product) -> bool {
        self.n_cases() < product.case_per_pallet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn product() -> Product {
        Product {
            probability: 1.0,
            family: "test".to_string(),
            cases_per_layer: 10,
            layers_per_pallet: 4,
            min_case_per_pallet: 60,
            max_case_per_pallet: 60,
            lp_enabled: true,
            reorder_level: 4,
        }
    }

    fn product_ids(n: usize) -> Vec<ProductId> {
        let mut arena: SlotMap<ProductId, ()> = SlotMap::with_key();
        (0..n).map(|_| arena.insert(())).collect()
    }

    fn product_id() -> ProductId {
        product_ids(1)[0]
    }

    #[test]
    fn full_pallet_counts_cases() {
        let id = product_id();
        let p = product();
        let ul = UnitLoad::full_of(id, &p);
        assert_eq!(ul.n_layers(), 4);
        assert_eq!(ul.n_cases(), 40);
        assert!(!ul.is_partial(&p));
    }

    #[test]
    fn single_rejects_overflowing_layers() {
        let id = product_id();
        let p = product();
        assert!(UnitLoad::single(id, &p, &[11]).is_err());
        assert!(UnitLoad::single(id, &p, &[1, 1, 1, 1, 1]).is_err());
        let ul = UnitLoad::single(id, &p, &[10, 3]).unwrap();
        assert_eq!(ul.n_cases(), 13);
        assert!(ul.is_partial(&p));
    }

    #[test]
    fn removing_cases_drains_top_layers_first() {
        let id = product_id();
        let p = product();
        let mut ul = UnitLoad::single(id, &p, &[10, 2]).unwrap();
        ul.remove_case(id).unwrap();
        ul.remove_case(id).unwrap();
        // The two-case top layer is gone; the full layer is now on top.
        assert_eq!(ul.n_layers(), 1);
        assert_eq!(ul.n_cases(), 10);
    }

    #[test]
    fn mixed_building_tops_up_the_current_layer() {
        let ids = product_ids(2);
        let (id_a, id_b) = (ids[0], ids[1]);
        let p = product();
        let mut ul = UnitLoad::empty();
        ul.add_product(id_a, &p, 4).unwrap();
        ul.add_product(id_b, &p, 3).unwrap();
        assert_eq!(ul.n_layers(), 1);
        assert_eq!(ul.n_cases(), 7);
        assert!(ul.product.is_none());
        // A full layer starts its own single-product layer.
        ul.add_product(id_a, &p, 10).unwrap();
        assert_eq!(ul.n_layers(), 2);
    }
}
