//! Discrete-event simulation core for industrial material handling
//!
//! This crate implements the kernel of a warehouse simulation: automated
//! guided vehicles (AGVs) feed picking cells from deep-lane stores, cells
//! build output pallets from customer orders, and a pull-based release
//! control decides when production jobs leave the pre-shop pool.
//!
//! ## Scheduler
//!
//! A single-threaded cooperative **scheduler** owns simulated time, an
//! event queue keyed on `(time, sequence)`, and every task. Tasks are state
//! machines resumed at explicit yield points (timeouts, events, resource
//! grants, store operations), so between two yields a task sees a
//! consistent world and no data race can exist.
//!
//! ## Resources
//!
//! Typed wrappers over the scheduler:
//!
//! - a **priority semaphore** with preemption, backing servers, AGVs,
//!   robots, cranes and unload positions;
//! - blocking **stores**: plain FIFO, filtered, bulk, head-only sequential,
//!   and keyed.
//!
//! ## Shopfloor and release control
//!
//! **Servers** track queues and utilization; the **shopfloor** owns the WIP
//! map (standard or corrected accounting) and streams KPIs as exponential
//! moving averages. Jobs pool in a **PSP** until a release policy moves
//! them: LUMS-COR (corrected workload norms plus planned release dates),
//! SLAR (planned slack with urgent insertion), or a plain
//! starvation-avoidance bypass.
//!
//! ## Picking cells
//!
//! A **picking cell** pulls pallet requests from its input queue and builds
//! each pallet at a capacity-1 building point with its robot. Feeding
//! operations carry unit loads through the cell's area pipeline
//! (feeding -> staging -> internal -> unload), admission being driven by
//! pump functions that enforce capacity and pick-sequence locality.
//!
//! ## Module structure
//!
//! - `kernel`      Scheduler, events, cooperative tasks
//! - `resources`   Priority semaphore and the store family
//! - `types`       Arena ids, locations, simulated time
//! - `products`    Product catalogue and generator
//! - `unitload`    Pallets of layers of cases
//! - `warehouse`   Physical positions, two-deep locations, stores
//! - `requests`    Case/product/layer/pallet request tree
//! - `jobs`        Production/transport/warehouse jobs and their timings
//! - `server`      Workstations (standard, faulty, inspection)
//! - `shopfloor`   WIP accounting, KPIs, per-job main task
//! - `psp`         Pre-shop pool
//! - `release`     LUMS-COR, SLAR, starvation avoidance
//! - `cell`        Picking cells, areas, flow control
//! - `operations`  Feeding operations and their logs
//! - `agv`         Vehicles, trips, missions
//! - `controllers` System, store and AGV controllers
//! - `router`      Distribution-driven job source
//! - `demand`      Shifts, customer orders, demand generators
//! - `snapshot`    Replay snapshots and mission export
//! - `sim`         The simulation facade
//! - `world`       Entity arenas

pub mod agv;
pub mod cell;
pub mod controllers;
pub mod demand;
pub mod distance;
pub mod errors;
#[cfg(feature = "instrument")]
pub use instrument;
pub mod jobs;
pub mod kernel;
pub mod operations;
pub mod products;
pub mod psp;
pub mod release;
pub mod requests;
pub mod resources;
pub mod router;
pub mod server;
pub mod shopfloor;
pub mod sim;
pub mod snapshot;
pub mod types;
pub mod unitload;
pub mod warehouse;
pub mod world;

// Re-export commonly used types at the crate root

// Kernel
pub use kernel::{Payload, Process, Resume, Scheduler, Step, Until};

// Core types
pub use types::{
    AgvId, CellId, FoId, JobId, Location, LocationId, PalletRequestId, ProductId, RawKey,
    ServerId, SimTime, StoreId, UnitLoadId, WorkloadUnit,
};

// Errors
pub use errors::SimError;

// Resources
pub use resources::{FilterStore, HashStore, MultiStore, PrioritySemaphore, SequentialStore, Store};

// Data model
pub use products::{Product, ProductsConfig, ProductsGenerator};
pub use requests::{CaseRequest, LayerRequest, PalletRequest, ProductRequest};
pub use unitload::{Layer, UnitLoad};
pub use warehouse::{PhysicalPosition, Side, WarehouseLocation, WarehouseStore};

// Jobs and shopfloor
pub use jobs::{Job, JobKind, QueuePriority, WarehouseOp};
pub use psp::PreShopPool;
pub use server::{Server, ServerKind};
pub use shopfloor::{ShopFloor, WipStrategy};

// Release policies
pub use release::{LumsCor, LumsCorStarvationTrigger, ReleasePolicy, Slar, SlarTrigger,
    StarvationAvoidanceTask};

// Picking
pub use cell::{Area, CellLayout, PickingCell, Position, Robot};
pub use operations::{FeedingOperation, FeedingOperationLog, FoStatus};

// AGVs
pub use agv::{Agv, AgvKind, AgvStatus};

// Glue
pub use controllers::SystemState;
pub use demand::{CustomerOrder, DemandGenerator, FixedSequenceGenerator, RandomOrdersGenerator,
    Shift};
pub use distance::DistanceMetric;
pub use router::{Router, RouterTarget, SkuProfile};
pub use sim::Sim;
pub use snapshot::{SystemSnapshot, TripRecord};
pub use world::World;
