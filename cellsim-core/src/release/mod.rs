//! Pull release policies for the pre-shop pool.

pub mod lumscor;
pub mod slar;
pub mod starvation;

use crate::errors::SimError;
use crate::sim::Sim;

pub use lumscor::{LumsCor, LumsCorStarvationTrigger};
pub use slar::{Slar, SlarTrigger};
pub use starvation::StarvationAvoidanceTask;

/// Decides which pooled jobs leave for the shopfloor on each invocation.
pub trait ReleasePolicy {
    fn release(&mut self, sim: &mut Sim) -> Result<(), SimError>;
}
