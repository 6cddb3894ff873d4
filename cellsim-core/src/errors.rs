//! Typed error kinds for the simulation core.
//!
//! Domain errors propagate out of the offending task; unless a task handles
//! them, they abort the run. Every failure is emitted once through the event
//! log with the entity id and the simulated time at which it occurred.

use thiserror::Error;

use crate::types::SimTime;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    /// Append to a full area, or a bulk put past a bounded store's capacity,
    /// without the explicit exceed bypass.
    #[error("{name}: capacity {capacity} exceeded at t={at}")]
    CapacityExceeded { name: String, capacity: usize, at: SimTime },

    /// A warehouse location already holds two unit loads.
    #[error("location ({x}, {y}) is busy")]
    LocationBusy { x: i64, y: i64 },

    /// A warehouse location has nothing to pick.
    #[error("location ({x}, {y}) is empty")]
    LocationEmpty { x: i64, y: i64 },

    /// The unit load's product does not match the product already stored (or
    /// booked) at the location.
    #[error("unit load {unit_load} is incompatible with location ({x}, {y})")]
    IncompatibleUnitLoad { unit_load: u64, x: i64, y: i64 },

    #[error("physical position is busy")]
    PhysicalPositionBusy,

    #[error("physical position is empty")]
    PhysicalPositionEmpty,

    /// The store controller cannot find enough material for a product.
    #[error("out of stock: product {product}, requested {requested} cases")]
    OutOfStock { product: u64, requested: u32 },

    /// AGV load/unload invoked in an incompatible status, or an attempt to
    /// carry two unit loads at once.
    #[error("AGV {agv}: invalid transition {from} -> {attempted} at t={at}")]
    WrongStatusTransition { agv: u64, from: &'static str, attempted: &'static str, at: SimTime },

    /// External stop signal observed while a task was suspended.
    #[error("simulation stopped")]
    Stopped,

    /// A corrected-WIP release policy met a shopfloor configured with the
    /// standard WIP strategy.
    #[error("release policy requires the corrected WIP strategy")]
    StrategyMismatch,

    /// Keyed store lookup failed in raise-on-missing mode.
    #[error("key not found in hash store")]
    NotFound,

    /// A request-tree node violated a structural bound.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
