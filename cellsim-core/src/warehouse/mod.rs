//! Warehouse storage: physical positions, two-deep locations, and stores.

pub mod location;
pub mod store;

pub use location::{PhysicalPosition, Side, WarehouseLocation};
pub use store::WarehouseStore;
