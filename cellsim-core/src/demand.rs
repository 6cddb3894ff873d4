//! Demand: shifts of customer orders carrying pallet requests.

use std::collections::VecDeque;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::types::{PalletRequestId, ProductId, SimTime};
use crate::world::World;

/// A customer order: the pallet requests one client expects.
#[derive(Debug, Clone)]
pub struct CustomerOrder {
    pub day: u32,
    pub shift: u32,
    pub pallet_requests: Vec<PalletRequestId>,
}

/// A work shift: the customer orders to satisfy during it.
#[derive(Debug, Clone)]
pub struct Shift {
    pub day: u32,
    pub shift: u32,
    pub orders: Vec<CustomerOrder>,
}

/// Supplies a lazy, restartable sequence of shifts. The controller asks for
/// one shift every eight simulated hours; generators materialize their
/// pallet requests into the world on demand.
pub trait DemandGenerator {
    fn next_shift(&mut self, world: &mut World, now: SimTime) -> Option<Shift>;
}

// ============================================================================
// Fixed sequence - deterministic demand for tests and replays
// ============================================================================

/// Order line specs per shift, per order: `(product, n_cases)` rows become
/// single-product layers.
pub type ShiftSpec = Vec<Vec<Vec<(ProductId, u32)>>>;

pub struct FixedSequenceGenerator {
    shifts: VecDeque<Vec<Vec<(ProductId, u32)>>>,
    day: u32,
    shifts_per_day: u32,
    cursor: u32,
}

impl FixedSequenceGenerator {
    pub fn new(shifts: ShiftSpec, shifts_per_day: u32) -> Self {
        Self { shifts: shifts.into_iter().collect(), day: 0, shifts_per_day, cursor: 0 }
    }
}

impl DemandGenerator for FixedSequenceGenerator {
    fn next_shift(&mut self, world: &mut World, _now: SimTime) -> Option<Shift> {
        let orders_spec = self.shifts.pop_front()?;
        let (day, shift) = (self.day, self.cursor);
        self.cursor += 1;
        if self.cursor >= self.shifts_per_day {
            self.cursor = 0;
            self.day += 1;
        }
        let orders = orders_spec
            .into_iter()
            .map(|order_lines| {
                let layers: Vec<Vec<(ProductId, u32)>> =
                    order_lines.into_iter().map(|line| vec![line]).collect();
                CustomerOrder {
                    day,
                    shift,
                    pallet_requests: world.build_pallet_request(&layers).ok().into_iter().collect(),
                }
            })
            .collect();
        Some(Shift { day, shift, orders })
    }
}

// ============================================================================
// Random demand
// ============================================================================

/// Samples orders from uniform ranges over a product catalogue; one pallet
/// request per order, one single-product layer per line.
pub struct RandomOrdersGenerator {
    pub n_shifts: u32,
    pub shifts_per_day: u32,
    pub orders_per_shift: (u32, u32),
    pub lines_per_order: (u32, u32),
    pub cases_per_line: (u32, u32),
    pub catalogue: Vec<ProductId>,
    rng: StdRng,
    generated: u32,
}

impl RandomOrdersGenerator {
    pub fn new(
        n_shifts: u32,
        shifts_per_day: u32,
        orders_per_shift: (u32, u32),
        lines_per_order: (u32, u32),
        cases_per_line: (u32, u32),
        catalogue: Vec<ProductId>,
        seed: u64,
    ) -> Self {
        assert!(!catalogue.is_empty(), "demand needs a product catalogue");
        Self {
            n_shifts,
            shifts_per_day,
            orders_per_shift,
            lines_per_order,
            cases_per_line,
            catalogue,
            rng: StdRng::seed_from_u64(seed),
            generated: 0,
        }
    }

    fn sample(&mut self, range: (u32, u32)) -> u32 {
        let (low, high) = range;
        if low >= high { low } else { self.rng.random_range(low..=high) }
    }
}

impl DemandGenerator for RandomOrdersGenerator {
    fn next_shift(&mut self, world: &mut World, _now: SimTime) -> Option<Shift> {
        if self.generated >= self.n_shifts {
            // The sequence is exhausted; the controller keeps polling but
            // no further demand arrives.
            return None;
        }
        let index = self.generated;
        self.generated += 1;
        let day = index / self.shifts_per_day.max(1);
        let shift = index % self.shifts_per_day.max(1);

        let n_orders = self.sample(self.orders_per_shift);
        let mut orders = Vec::with_capacity(n_orders as usize);
        for _ in 0..n_orders {
            let n_lines = self.sample(self.lines_per_order).max(1);
            let mut layers = Vec::with_capacity(n_lines as usize);
            for _ in 0..n_lines {
                let product_idx = self.rng.random_range(0..self.catalogue.len());
                let product = self.catalogue[product_idx];
                let bound = world.products[product].cases_per_layer;
                let n_cases = self.sample(self.cases_per_line).clamp(1, bound);
                layers.push(vec![(product, n_cases)]);
            }
            let pallet_requests = world.build_pallet_request(&layers).ok().into_iter().collect();
            orders.push(CustomerOrder { day, shift, pallet_requests });
        }
        Some(Shift { day, shift, orders })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Scheduler;
    use crate::products::{ProductsConfig, ProductsGenerator};

    fn world_with_products(n: usize) -> (World, Vec<ProductId>) {
        let mut sched = Scheduler::new();
        let mut world = World::new(&mut sched);
        let catalogue =
            ProductsGenerator::generate(ProductsConfig::uniform(n), &mut world.products);
        let products = catalogue.products().to_vec();
        (world, products)
    }

    #[test]
    fn fixed_sequence_materializes_pallet_requests_in_order() {
        let (mut world, products) = world_with_products(1);
        let product = products[0];
        let mut generator = FixedSequenceGenerator::new(
            vec![vec![vec![(product, 5)]], vec![vec![(product, 3)], vec![(product, 2)]]],
            2,
        );

        let first = generator.next_shift(&mut world, 0.0).unwrap();
        assert_eq!((first.day, first.shift), (0, 0));
        assert_eq!(first.orders.len(), 1);

        let second = generator.next_shift(&mut world, 0.0).unwrap();
        assert_eq!((second.day, second.shift), (0, 1));
        assert_eq!(second.orders.len(), 2);

        assert!(generator.next_shift(&mut world, 0.0).is_none());
        assert_eq!(world.pallet_requests.len(), 3);
    }

    #[test]
    fn random_generator_respects_layer_bounds_and_shift_count() {
        let (mut world, products) = world_with_products(4);
        let mut generator = RandomOrdersGenerator::new(
            3,
            3,
            (1, 3),
            (1, 4),
            (1, 20),
            products,
            42,
        );

        let mut shifts = 0;
        while let Some(shift) = generator.next_shift(&mut world, 0.0) {
            shifts += 1;
            for order in &shift.orders {
                for &pallet in &order.pallet_requests {
                    let pallet = &world.pallet_requests[pallet];
                    for layer in &pallet.layers {
                        for pr in &layer.product_requests {
                            let bound = world.products[pr.product].cases_per_layer;
                            assert!(pr.n_cases >= 1 && pr.n_cases <= bound);
                        }
                    }
                }
            }
        }
        assert_eq!(shifts, 3);
    }
}
