//! Typed coordination primitives over the scheduler.

pub mod semaphore;
pub mod stores;

pub use semaphore::{PrioritySemaphore, RequestId};
pub use stores::{FilterStore, HashStore, MultiStore, SequentialStore, Store};
