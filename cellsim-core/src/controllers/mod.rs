//! Controllers gluing stores, AGVs, cells and demand together.

pub mod agvs;
pub mod stores;
pub mod system;

pub use stores::{PartialFirstRetrieval, NearestStoring, RetrievalPolicy, StockLedger, StoringPolicy};
pub use system::SystemState;
