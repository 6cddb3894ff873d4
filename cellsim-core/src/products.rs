//! Product catalogue and its generator.

use std::collections::HashSet;

use rand::Rng;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::errors::SimError;
use crate::types::ProductId;

/// A stock-keeping product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    /// Relative demand weight used by weighted catalogue draws.
    pub probability: f64,
    pub family: String,
    pub cases_per_layer: u32,
    pub layers_per_pallet: u32,
    pub min_case_per_pallet: u32,
    pub max_case_per_pallet: u32,
    /// Whether layer picking is allowed for this product.
    pub lp_enabled: bool,
    /// Inventory position at or below which replenishment is triggered.
    pub reorder_level: u32,
}

impl Product {
    /// Cases on a full pallet.
    pub fn case_per_pallet(&self) -> u32 {
        self.cases_per_layer * self.layers_per_pallet
    }
}

/// Configuration of a [`ProductsGenerator`]. Every field is a sampling
/// closure so callers can plug arbitrary distributions; the defaults build a
/// uniform catalogue of identical products.
pub struct ProductsConfig {
    pub n_products: usize,
    /// Demand weights for the whole catalogue; uniform when `None`.
    pub probabilities: Option<Box<dyn FnMut(usize) -> Vec<f64>>>,
    pub cases_per_layer: Box<dyn FnMut() -> u32>,
    pub layers_per_pallet: Box<dyn FnMut() -> u32>,
    pub min_case_per_pallet: Box<dyn FnMut() -> u32>,
    pub max_case_per_pallet: Box<dyn FnMut() -> u32>,
    pub lp_enabled: Box<dyn FnMut() -> bool>,
    pub reorder_level: Box<dyn FnMut() -> u32>,
    pub family: Box<dyn FnMut() -> String>,
}

impl ProductsConfig {
    pub fn uniform(n_products: usize) -> Self {
        Self {
            n_products,
            probabilities: None,
            cases_per_layer: Box::new(|| 10),
            layers_per_pallet: Box::new(|| 4),
            min_case_per_pallet: Box::new(|| 60),
            max_case_per_pallet: Box::new(|| 60),
            lp_enabled: Box::new(|| true),
            reorder_level: Box::new(|| 4),
            family: Box::new(|| "standard".to_string()),
        }
    }
}

/// Builds a product catalogue into the product arena and offers weighted
/// draws over it.
pub struct ProductsGenerator {
    products: Vec<ProductId>,
    probabilities: Vec<f64>,
}

impl ProductsGenerator {
    pub fn generate(mut config: ProductsConfig, arena: &mut SlotMap<ProductId, Product>) -> Self {
        let probabilities = match config.probabilities.as_mut() {
            Some(sample) => sample(config.n_products),
            None => vec![1.0 / config.n_products as f64; config.n_products],
        };
        let products = probabilities
            .iter()
            .map(|&probability| {
                arena.insert(Product {
                    probability,
                    family: (config.family)(),
                    cases_per_layer: (config.cases_per_layer)(),
                    layers_per_pallet: (config.layers_per_pallet)(),
                    min_case_per_pallet: (config.min_case_per_pallet)(),
                    max_case_per_pallet: (config.max_case_per_pallet)(),
                    lp_enabled: (config.lp_enabled)(),
                    reorder_level: (config.reorder_level)(),
                })
            })
            .collect();
        Self { products, probabilities }
    }

    pub fn products(&self) -> &[ProductId] {
        &self.products
    }

    fn weighted_draw(&self, rng: &mut impl Rng) -> ProductId {
        let total: f64 = self.probabilities.iter().sum();
        let mut target = rng.random::<f64>() * total;
        for (product, weight) in self.products.iter().zip(&self.probabilities) {
            target -= weight;
            if target <= 0.0 {
                return *product;
            }
        }
        *self.products.last().expect("catalogue is never empty")
    }

    /// Draw one product by demand weight. With `exclude`, redraws until a
    /// product outside the set appears, then records it there.
    pub fn choose_one(
        &self,
        rng: &mut impl Rng,
        exclude: Option<&mut HashSet<ProductId>>,
    ) -> ProductId {
        let mut product = self.weighted_draw(rng);
        if let Some(exclude) = exclude {
            while exclude.contains(&product) {
                product = self.weighted_draw(rng);
            }
            exclude.insert(product);
        }
        product
    }

    /// Draw `n` products by demand weight, with or without replacement.
    pub fn choose_some(
        &self,
        rng: &mut impl Rng,
        n: usize,
        replace: bool,
    ) -> Result<Vec<ProductId>, SimError> {
        if !replace && n > self.products.len() {
            return Err(SimError::InvalidRequest(
                "cannot draw a sample larger than the catalogue without replacement".to_string(),
            ));
        }
        if replace {
            return Ok((0..n).map(|_| self.weighted_draw(rng)).collect());
        }
        let mut seen = HashSet::new();
        let mut drawn = Vec::with_capacity(n);
        while drawn.len() < n {
            let product = self.weighted_draw(rng);
            if seen.insert(product) {
                drawn.push(product);
            }
        }
        Ok(drawn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn uniform_catalogue_has_expected_shape() {
        let mut arena = SlotMap::with_key();
        let catalogue = ProductsGenerator::generate(ProductsConfig::uniform(5), &mut arena);
        assert_eq!(catalogue.products().len(), 5);
        let product = &arena[catalogue.products()[0]];
        assert_eq!(product.case_per_pallet(), 40);
        assert!((product.probability - 0.2).abs() < 1e-12);
    }

    #[test]
    fn choose_some_without_replacement_yields_distinct_products() {
        let mut arena = SlotMap::with_key();
        let catalogue = ProductsGenerator::generate(ProductsConfig::uniform(8), &mut arena);
        let mut rng = StdRng::seed_from_u64(42);
        let drawn = catalogue.choose_some(&mut rng, 8, false).unwrap();
        let unique: HashSet<_> = drawn.iter().copied().collect();
        assert_eq!(unique.len(), 8);
    }

    #[test]
    fn choose_one_respects_the_exclusion_set() {
        let mut arena = SlotMap::with_key();
        let catalogue = ProductsGenerator::generate(ProductsConfig::uniform(3), &mut arena);
        let mut rng = StdRng::seed_from_u64(7);
        let mut exclude = HashSet::new();
        let a = catalogue.choose_one(&mut rng, Some(&mut exclude));
        let b = catalogue.choose_one(&mut rng, Some(&mut exclude));
        let c = catalogue.choose_one(&mut rng, Some(&mut exclude));
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }
}
