//! The system controller: demand intake, pallet-request dispatch, feeding
//! missions, retrieval missions, and replenishment.

use slotmap::SecondaryMap;

use crate::agv::{AgvKind, AgvStatus};
use crate::cell::flow;
use crate::controllers::agvs::{best_agv, best_feeding_agv};
use crate::controllers::stores::{
    NearestStoring, PartialFirstRetrieval, RetrievalPolicy, StoringPolicy, book_unit_load_for_feeding,
    store_unit_load,
};
use crate::errors::SimError;
use crate::kernel::{EventKey, Process, Resume, Step};
use crate::operations::{FeedingOperation, FeedingOperationLog, FoStatus};
use crate::resources::RequestId;
use crate::sim::Sim;
use crate::types::{
    AgvId, CellId, FoId, LocationId, PalletRequestId, ProductId, RawKey, SimTime, StoreId,
};
use crate::unitload::UnitLoad;
use crate::world::World;

/// One shift every eight hours.
pub const SHIFT_INTERVAL: SimTime = 8.0 * 60.0 * 60.0;

/// State owned by the system controller.
pub struct SystemState {
    /// Pallet requests pooled before assignment to a cell.
    pub pallet_pool: Vec<PalletRequestId>,
    pub finished_pallet_requests: Vec<PalletRequestId>,
    /// Feeding vehicles parked after finishing a mission.
    pub idle_feeding_agvs: Vec<AgvId>,
    /// Which store feeds which cell.
    pub cell_store: SecondaryMap<CellId, StoreId>,

    pub input_location: LocationId,
    pub output_location: LocationId,
    pub recharge_location: LocationId,

    pub shift_interval: SimTime,
    pub assign_interval: SimTime,
    pub replenishment_interval: SimTime,

    pub storing_policy: Box<dyn StoringPolicy>,
    pub retrieval_policy: Box<dyn RetrievalPolicy>,
    /// Synthesize a full pallet when retrieval runs out of stock.
    pub magic_replenishment: bool,
}

impl SystemState {
    pub fn new(
        input_location: LocationId,
        output_location: LocationId,
        recharge_location: LocationId,
    ) -> Self {
        Self {
            pallet_pool: Vec::new(),
            finished_pallet_requests: Vec::new(),
            idle_feeding_agvs: Vec::new(),
            cell_store: SecondaryMap::new(),
            input_location,
            output_location,
            recharge_location,
            shift_interval: SHIFT_INTERVAL,
            assign_interval: 60.0,
            replenishment_interval: SHIFT_INTERVAL,
            storing_policy: Box::new(NearestStoring),
            retrieval_policy: Box::new(PartialFirstRetrieval),
            magic_replenishment: true,
        }
    }
}

/// Start the controller's periodic tasks.
pub fn start(sim: &mut Sim) {
    sim.sched.spawn(Box::new(ShiftPullTask));
    sim.sched.spawn(Box::new(AssignTask));
    sim.sched.spawn(Box::new(ReplenishmentSweepTask));
}

fn begin_agv_trip(sim: &mut Sim, agv: AgvId, destination: LocationId) -> Result<EventKey, SimError> {
    let now = sim.sched.now();
    let distance = sim.distance_to(agv, destination);
    let duration = sim.world.agvs[agv].begin_trip(destination, distance, now)?;
    Ok(sim.sched.timeout(duration))
}

/// Close an AGV mission: end-of-mission bookkeeping, semaphore release,
/// and re-registration of idle feeding vehicles.
fn finish_agv_mission(sim: &mut Sim, agv_id: AgvId, request: Option<RequestId>) {
    let now = sim.sched.now();
    let Sim { sched, world, .. } = sim;
    let agv = &mut world.agvs[agv_id];
    agv.end_mission(now);
    if let Some(request) = request {
        agv.sem.release(sched, request);
    }
    if agv.kind == AgvKind::Feeding && !world.system.idle_feeding_agvs.contains(&agv_id) {
        world.system.idle_feeding_agvs.push(agv_id);
    }
}

// ============================================================================
// Demand intake
// ============================================================================

/// Pulls one shift from the demand generator every eight hours and pools
/// its pallet requests.
struct ShiftPullTask;

impl Process for ShiftPullTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        if let Resume::Failed(error) = input {
            return Step::Failed(error);
        }
        let now = sim.sched.now();
        let mut demand = sim.demand.take();
        if let Some(generator) = demand.as_mut() {
            if let Some(shift) = generator.next_shift(&mut sim.world, now) {
                let mut pooled = 0usize;
                for order in &shift.orders {
                    for &pallet in &order.pallet_requests {
                        sim.world.system.pallet_pool.push(pallet);
                        pooled += 1;
                    }
                }
                #[cfg(feature = "instrument")]
                tracing::info!(
                    target: "shift_pulled",
                    sim_time = now,
                    day = shift.day,
                    shift = shift.shift,
                    pallet_requests = pooled,
                );
                #[cfg(not(feature = "instrument"))]
                let _ = pooled;
            }
        }
        sim.demand = demand;
        let interval = sim.world.system.shift_interval;
        Step::Wait(sim.sched.timeout(interval))
    }
}

// ============================================================================
// Pallet request assignment
// ============================================================================

/// Assigns pooled pallet requests to the least loaded cell, creates their
/// feeding operations, and queues them at the cell input.
struct AssignTask;

impl AssignTask {
    fn assign_next(&mut self, sim: &mut Sim) -> Step {
        if sim.world.system.pallet_pool.is_empty() || sim.world.cells.is_empty() {
            let interval = sim.world.system.assign_interval;
            return Step::Wait(sim.sched.timeout(interval));
        }
        let pallet = sim.world.system.pallet_pool.remove(0);
        match assign_pallet_request(sim, pallet) {
            Ok(put) => Step::Wait(put),
            Err(error) => Step::Failed(error),
        }
    }
}

impl Process for AssignTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Failed(error) => Step::Failed(error),
            Resume::Interrupted => Step::Done,
            _ => self.assign_next(sim),
        }
    }
}

/// Commit a pallet request to the least loaded cell. Returns the event of
/// the input-queue put.
fn assign_pallet_request(sim: &mut Sim, pallet: PalletRequestId) -> Result<EventKey, SimError> {
    let cell_id = sim
        .world
        .cells
        .iter()
        .min_by(|(_, a), (_, b)| a.workload.total_cmp(&b.workload))
        .map(|(id, _)| id)
        .ok_or_else(|| SimError::InvalidRequest("no picking cell registered".into()))?;

    let product_request_ids: Vec<u64> = {
        let World { cells, pallet_requests, .. } = &mut sim.world;
        let cell = &mut cells[cell_id];
        let pallet_request = &mut pallet_requests[pallet];
        pallet_request.assigned_cell = Some(cell_id);
        cell.add_workload(pallet_request);
        cell.assigned.push(pallet);
        pallet_request.product_requests().map(|pr| pr.id).collect()
    };
    #[cfg(feature = "instrument")]
    tracing::info!(
        target: "pallet_assigned",
        sim_time = sim.sched.now(),
        cell = cell_id.to_raw(),
        pallet_request = pallet.to_raw(),
    );
    for pr_id in product_request_ids {
        setup_feeding_operation(sim, cell_id, pallet, pr_id)?;
    }
    let Sim { sched, world, .. } = sim;
    Ok(world.cells[cell_id].input_queue.put(sched, pallet))
}

// ============================================================================
// Feeding operations
// ============================================================================

/// Create a feeding operation for one product request: book a unit load,
/// pick an AGV, register with the cell, and launch the mission.
pub fn setup_feeding_operation(
    sim: &mut Sim,
    cell_id: CellId,
    pallet: PalletRequestId,
    product_request: u64,
) -> Result<FoId, SimError> {
    let (product, n_cases) = {
        let pallet_request = &sim.world.pallet_requests[pallet];
        let pr = pallet_request
            .product_request(product_request)
            .ok_or_else(|| SimError::InvalidRequest("unknown product request".into()))?;
        (pr.product, pr.remaining_to_pick())
    };
    let (store, location, unit_load) = book_unit_load_for_feeding(sim, product, n_cases, false)?;
    sim.world.system.cell_store.insert(cell_id, store);
    let agv = best_feeding_agv(sim)
        .ok_or_else(|| SimError::InvalidRequest("no feeding AGV available".into()))?;

    let now = sim.sched.now();
    let ready_event = sim.sched.event();
    let fo = {
        let world = &mut sim.world;
        let seq = world.next_fo_seq;
        world.next_fo_seq += 1;
        let has_partial_unit_load = {
            let spec = &world.products[product];
            world.unit_loads[unit_load].is_partial(spec)
        };
        let fo = world.feeding_ops.insert(FeedingOperation {
            seq,
            relative_id: 0,
            cell: cell_id,
            agv,
            store,
            location,
            unit_load,
            product_requests: vec![(pallet, product_request)],
            has_partial_unit_load,
            status: FoStatus::default(),
            pre_unload_position: None,
            unload_position: None,
            unload_position_request: None,
            pre_unload_position_request: None,
            mission_request: None,
            ready_event,
            log: FeedingOperationLog::new(now),
        });
        world.unit_loads[unit_load].feeding_operation = Some(fo);
        if let Some(pr) = world.pallet_requests[pallet].product_request_mut(product_request) {
            pr.feeding_operations.push(fo);
        }
        fo
    };
    #[cfg(feature = "instrument")]
    tracing::info!(
        target: "fo_created",
        sim_time = now,
        cell = cell_id.to_raw(),
        fo = fo.to_raw(),
        product = product.to_raw(),
    );
    flow::register_feeding_operation(sim, cell_id, fo);
    sim.sched.spawn(Box::new(FeedingMissionTask {
        fo,
        crane_request: None,
        state: FeedState::Init,
    }));
    Ok(fo)
}

enum FeedState {
    Init,
    AwaitAgv,
    ToStore,
    AwaitCrane,
    Retrieving,
    Loading,
    ToCell,
}

/// The outbound half of a feeding operation: acquire the AGV, drive to the
/// store, retrieve and load the unit load, drive to the cell door.
struct FeedingMissionTask {
    fo: FoId,
    crane_request: Option<RequestId>,
    state: FeedState,
}

impl FeedingMissionTask {
    fn step(&mut self, sim: &mut Sim) -> Result<Step, SimError> {
        let now = sim.sched.now();
        match self.state {
            FeedState::Init => {
                let task = sim.sched.current_task().expect("mission task is running");
                let agv_id = sim.world.feeding_ops[self.fo].agv;
                let Sim { sched, world, .. } = sim;
                let agv = &mut world.agvs[agv_id];
                let (request, granted) =
                    agv.sem.request(sched, 0.0, false, task, self.fo.to_raw());
                agv.note_mission_requested(request, Some(self.fo));
                world.feeding_ops[self.fo].mission_request = Some(request);
                self.state = FeedState::AwaitAgv;
                Ok(Step::Wait(granted))
            }
            FeedState::AwaitAgv => {
                let (agv_id, store, request) = {
                    let operation = &sim.world.feeding_ops[self.fo];
                    (operation.agv, operation.store, operation.mission_request)
                };
                if let Some(request) = request {
                    sim.world.agvs[agv_id].begin_mission(request, now);
                }
                sim.world.feeding_ops[self.fo].log.started_trip_to_store = Some(now);
                let destination = sim.world.stores[store].output_location;
                let arrival = begin_agv_trip(sim, agv_id, destination)?;
                self.state = FeedState::ToStore;
                Ok(Step::Wait(arrival))
            }
            FeedState::ToStore => {
                let (agv_id, store) = {
                    let operation = &sim.world.feeding_ops[self.fo];
                    (operation.agv, operation.store)
                };
                sim.world.agvs[agv_id].finish_trip(now);
                sim.world.stores[store].note_output_queue(now, 1);
                sim.world.feeding_ops[self.fo].log.finished_trip_to_store = Some(now);
                let task = sim.sched.current_task().expect("mission task is running");
                let Sim { sched, world, .. } = sim;
                let (request, granted) = world.stores[store].crane.request(
                    sched,
                    0.0,
                    false,
                    task,
                    self.fo.to_raw(),
                );
                self.crane_request = Some(request);
                self.state = FeedState::AwaitCrane;
                Ok(Step::Wait(granted))
            }
            FeedState::AwaitCrane => {
                let store = sim.world.feeding_ops[self.fo].store;
                sim.world.feeding_ops[self.fo].log.started_retrieval = Some(now);
                let retrieval_time = sim.world.stores[store].retrieval_time;
                self.state = FeedState::Retrieving;
                Ok(Step::Wait(sim.sched.timeout(retrieval_time)))
            }
            FeedState::Retrieving => {
                let (agv_id, store, location, expected) = {
                    let operation = &sim.world.feeding_ops[self.fo];
                    (operation.agv, operation.store, operation.location, operation.unit_load)
                };
                if let Some(location) = location {
                    let retrieved = sim.world.stores[store].locations[location].get()?;
                    if retrieved != expected {
                        return Err(SimError::InvalidRequest(
                            "retrieved a unit load other than the booked one".into(),
                        ));
                    }
                }
                sim.world.feeding_ops[self.fo].log.finished_retrieval = Some(now);
                if let Some(request) = self.crane_request.take() {
                    let Sim { sched, world, .. } = sim;
                    world.stores[store].crane.release(sched, request);
                }
                sim.world.agvs[agv_id].set_status(AgvStatus::WaitingToBeLoaded, now)?;
                sim.world.feeding_ops[self.fo].log.started_loading = Some(now);
                let load_timeout = sim.world.agvs[agv_id].load_timeout;
                self.state = FeedState::Loading;
                Ok(Step::Wait(sim.sched.timeout(load_timeout)))
            }
            FeedState::Loading => {
                let (agv_id, store, unit_load, cell) = {
                    let operation = &sim.world.feeding_ops[self.fo];
                    (operation.agv, operation.store, operation.unit_load, operation.cell)
                };
                sim.world.agvs[agv_id].load(unit_load, now)?;
                sim.world.stores[store].note_output_queue(now, -1);
                {
                    let log = &mut sim.world.feeding_ops[self.fo].log;
                    log.finished_loading = Some(now);
                    log.started_trip_to_cell = Some(now);
                }
                let destination = sim.world.cells[cell].input_location;
                let arrival = begin_agv_trip(sim, agv_id, destination)?;
                self.state = FeedState::ToCell;
                Ok(Step::Wait(arrival))
            }
            FeedState::ToCell => {
                let (agv_id, cell) = {
                    let operation = &sim.world.feeding_ops[self.fo];
                    (operation.agv, operation.cell)
                };
                sim.world.agvs[agv_id].finish_trip(now);
                {
                    let operation = &mut sim.world.feeding_ops[self.fo];
                    operation.log.finished_trip_to_cell = Some(now);
                    operation.status.arrived = true;
                }
                #[cfg(feature = "instrument")]
                tracing::info!(
                    target: "fo_arrived",
                    sim_time = now,
                    cell = cell.to_raw(),
                    fo = self.fo.to_raw(),
                );
                flow::on_feeding_arrival(sim, cell, self.fo);
                Ok(Step::Done)
            }
        }
    }
}

impl Process for FeedingMissionTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Failed(error) => Step::Failed(error),
            Resume::Interrupted => Step::Done,
            _ => self.step(sim).unwrap_or_else(Step::Failed),
        }
    }
}

// ============================================================================
// Return and drop legs
// ============================================================================

enum ReturnState {
    Init,
    ToStore,
    AwaitCrane,
    Storing,
    Unloading,
}

/// Brings a half-consumed unit load back to its store and frees the AGV.
pub struct ReturnTask {
    fo: FoId,
    crane_request: Option<RequestId>,
    state: ReturnState,
}

impl ReturnTask {
    pub fn new(fo: FoId) -> Self {
        Self { fo, crane_request: None, state: ReturnState::Init }
    }

    fn step(&mut self, sim: &mut Sim) -> Result<Step, SimError> {
        let now = sim.sched.now();
        match self.state {
            ReturnState::Init => {
                let (agv_id, store) = {
                    let operation = &sim.world.feeding_ops[self.fo];
                    (operation.agv, operation.store)
                };
                sim.world.feeding_ops[self.fo].log.started_return_trip_to_store = Some(now);
                let destination = sim.world.stores[store].input_location;
                let arrival = begin_agv_trip(sim, agv_id, destination)?;
                self.state = ReturnState::ToStore;
                Ok(Step::Wait(arrival))
            }
            ReturnState::ToStore => {
                let (agv_id, store) = {
                    let operation = &sim.world.feeding_ops[self.fo];
                    (operation.agv, operation.store)
                };
                sim.world.agvs[agv_id].finish_trip(now);
                sim.world.agvs[agv_id].set_status(AgvStatus::WaitingToBeUnloaded, now)?;
                sim.world.stores[store].note_input_queue(now, 1);
                sim.world.feeding_ops[self.fo].log.finished_return_trip_to_store = Some(now);
                let task = sim.sched.current_task().expect("return task is running");
                let Sim { sched, world, .. } = sim;
                let (request, granted) = world.stores[store].crane.request(
                    sched,
                    0.0,
                    false,
                    task,
                    self.fo.to_raw(),
                );
                self.crane_request = Some(request);
                self.state = ReturnState::AwaitCrane;
                Ok(Step::Wait(granted))
            }
            ReturnState::AwaitCrane => {
                let store = sim.world.feeding_ops[self.fo].store;
                let storage_time = sim.world.stores[store].storage_time;
                self.state = ReturnState::Storing;
                Ok(Step::Wait(sim.sched.timeout(storage_time)))
            }
            ReturnState::Storing => {
                let agv_id = sim.world.feeding_ops[self.fo].agv;
                sim.world.feeding_ops[self.fo].log.started_unloading_for_return = Some(now);
                let unload_timeout = sim.world.agvs[agv_id].unload_timeout;
                self.state = ReturnState::Unloading;
                Ok(Step::Wait(sim.sched.timeout(unload_timeout)))
            }
            ReturnState::Unloading => {
                let (agv_id, store, mission_request) = {
                    let operation = &mut sim.world.feeding_ops[self.fo];
                    (operation.agv, operation.store, operation.mission_request.take())
                };
                let unit_load = sim.world.agvs[agv_id].unload(now)?;
                store_unit_load(sim, store, unit_load)?;
                if let Some(request) = self.crane_request.take() {
                    let Sim { sched, world, .. } = sim;
                    world.stores[store].crane.release(sched, request);
                }
                sim.world.stores[store].note_input_queue(now, -1);
                sim.world.feeding_ops[self.fo].log.finished_unloading_for_return = Some(now);
                #[cfg(feature = "instrument")]
                tracing::info!(
                    target: "fo_returned",
                    sim_time = now,
                    fo = self.fo.to_raw(),
                );
                finish_agv_mission(sim, agv_id, mission_request);
                Ok(Step::Done)
            }
        }
    }
}

impl Process for ReturnTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Failed(error) => Step::Failed(error),
            Resume::Interrupted => Step::Done,
            _ => self.step(sim).unwrap_or_else(Step::Failed),
        }
    }
}

enum DropState {
    Init,
    ToRecharge,
    Unloading,
}

/// The unit load was fully consumed: send the AGV to the recharge spot and
/// retire the empty pallet.
pub struct DropTask {
    fo: FoId,
    state: DropState,
}

impl DropTask {
    pub fn new(fo: FoId) -> Self {
        Self { fo, state: DropState::Init }
    }

    fn step(&mut self, sim: &mut Sim) -> Result<Step, SimError> {
        let now = sim.sched.now();
        match self.state {
            DropState::Init => {
                let agv_id = sim.world.feeding_ops[self.fo].agv;
                sim.world.feeding_ops[self.fo].log.started_return_trip_to_recharge = Some(now);
                let destination = sim.world.system.recharge_location;
                let arrival = begin_agv_trip(sim, agv_id, destination)?;
                self.state = DropState::ToRecharge;
                Ok(Step::Wait(arrival))
            }
            DropState::ToRecharge => {
                let agv_id = sim.world.feeding_ops[self.fo].agv;
                sim.world.agvs[agv_id].finish_trip(now);
                sim.world.agvs[agv_id].set_status(AgvStatus::WaitingToBeUnloaded, now)?;
                sim.world.feeding_ops[self.fo].log.finished_return_trip_to_recharge = Some(now);
                let unload_timeout = sim.world.agvs[agv_id].unload_timeout;
                self.state = DropState::Unloading;
                Ok(Step::Wait(sim.sched.timeout(unload_timeout)))
            }
            DropState::Unloading => {
                let (agv_id, mission_request) = {
                    let operation = &mut sim.world.feeding_ops[self.fo];
                    (operation.agv, operation.mission_request.take())
                };
                let unit_load = sim.world.agvs[agv_id].unload(now)?;
                // The empty pallet leaves the system.
                sim.world.unit_loads.remove(unit_load);
                #[cfg(feature = "instrument")]
                tracing::info!(
                    target: "fo_dropped",
                    sim_time = now,
                    fo = self.fo.to_raw(),
                );
                finish_agv_mission(sim, agv_id, mission_request);
                Ok(Step::Done)
            }
        }
    }
}

impl Process for DropTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Failed(error) => Step::Failed(error),
            Resume::Interrupted => Step::Done,
            _ => self.step(sim).unwrap_or_else(Step::Failed),
        }
    }
}

// ============================================================================
// Retrieval of finished pallets
// ============================================================================

/// Launch the retrieval of a completed pallet request from a cell output.
pub fn retrieve_from_cell(sim: &mut Sim, cell: CellId, pallet: PalletRequestId) {
    sim.sched.spawn(Box::new(RetrieveTask {
        cell,
        pallet,
        agv: None,
        mission_request: None,
        state: RetrieveState::Init,
    }));
}

enum RetrieveState {
    Init,
    AwaitAgv,
    ToCell,
    AwaitPallet,
    Loading,
    ToOutput,
    Unloading,
}

/// Carries a finished pallet from the cell output to the system output.
struct RetrieveTask {
    cell: CellId,
    pallet: PalletRequestId,
    agv: Option<AgvId>,
    mission_request: Option<RequestId>,
    state: RetrieveState,
}

impl RetrieveTask {
    fn step(&mut self, sim: &mut Sim) -> Result<Step, SimError> {
        let now = sim.sched.now();
        match self.state {
            RetrieveState::Init => {
                let agv_id = best_agv(&sim.world, AgvKind::Output).ok_or_else(|| {
                    SimError::InvalidRequest("no output AGV available".into())
                })?;
                self.agv = Some(agv_id);
                let task = sim.sched.current_task().expect("retrieve task is running");
                let Sim { sched, world, .. } = sim;
                let agv = &mut world.agvs[agv_id];
                let (request, granted) =
                    agv.sem.request(sched, 0.0, false, task, self.pallet.to_raw());
                agv.note_mission_requested(request, None);
                self.mission_request = Some(request);
                self.state = RetrieveState::AwaitAgv;
                Ok(Step::Wait(granted))
            }
            RetrieveState::AwaitAgv => {
                let agv_id = self.agv.expect("chosen at init");
                if let Some(request) = self.mission_request {
                    sim.world.agvs[agv_id].begin_mission(request, now);
                }
                let destination = sim.world.cells[self.cell].output_location;
                let arrival = begin_agv_trip(sim, agv_id, destination)?;
                self.state = RetrieveState::ToCell;
                Ok(Step::Wait(arrival))
            }
            RetrieveState::ToCell => {
                let agv_id = self.agv.expect("chosen at init");
                sim.world.agvs[agv_id].finish_trip(now);
                let wanted = self.pallet;
                let Sim { sched, world, .. } = sim;
                let got = world.cells[self.cell]
                    .output_queue
                    .get(sched, move |pallet: &PalletRequestId| *pallet == wanted);
                self.state = RetrieveState::AwaitPallet;
                Ok(Step::Wait(got))
            }
            RetrieveState::AwaitPallet => {
                let agv_id = self.agv.expect("chosen at init");
                sim.world.agvs[agv_id].set_status(AgvStatus::WaitingToBeLoaded, now)?;
                let load_timeout = sim.world.agvs[agv_id].load_timeout;
                self.state = RetrieveState::Loading;
                Ok(Step::Wait(sim.sched.timeout(load_timeout)))
            }
            RetrieveState::Loading => {
                let agv_id = self.agv.expect("chosen at init");
                let unit_load = sim.world.pallet_requests[self.pallet].unit_load;
                sim.world.agvs[agv_id].load(unit_load, now)?;
                let destination = sim.world.system.output_location;
                let arrival = begin_agv_trip(sim, agv_id, destination)?;
                self.state = RetrieveState::ToOutput;
                Ok(Step::Wait(arrival))
            }
            RetrieveState::ToOutput => {
                let agv_id = self.agv.expect("chosen at init");
                sim.world.agvs[agv_id].finish_trip(now);
                sim.world.agvs[agv_id].set_status(AgvStatus::WaitingToBeUnloaded, now)?;
                let unload_timeout = sim.world.agvs[agv_id].unload_timeout;
                self.state = RetrieveState::Unloading;
                Ok(Step::Wait(sim.sched.timeout(unload_timeout)))
            }
            RetrieveState::Unloading => {
                let agv_id = self.agv.expect("chosen at init");
                sim.world.agvs[agv_id].unload(now)?;
                sim.world.system.finished_pallet_requests.push(self.pallet);
                #[cfg(feature = "instrument")]
                tracing::info!(
                    target: "pallet_delivered",
                    sim_time = now,
                    pallet_request = self.pallet.to_raw(),
                );
                finish_agv_mission(sim, agv_id, self.mission_request.take());
                Ok(Step::Done)
            }
        }
    }
}

impl Process for RetrieveTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Failed(error) => Step::Failed(error),
            Resume::Interrupted => Step::Done,
            _ => self.step(sim).unwrap_or_else(Step::Failed),
        }
    }
}

// ============================================================================
// Replenishment
// ============================================================================

/// Periodic sweep: any product whose inventory position fell to its reorder
/// level gets one full pallet ordered in.
struct ReplenishmentSweepTask;

impl Process for ReplenishmentSweepTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        if let Resume::Failed(error) = input {
            return Step::Failed(error);
        }
        if !matches!(input, Resume::Started) {
            let products: Vec<(ProductId, u32)> = sim
                .world
                .products
                .iter()
                .map(|(id, product)| (id, product.case_per_pallet()))
                .collect();
            for (product, case_per_pallet) in products {
                let reorder_level = i64::from(sim.world.products[product].reorder_level);
                if sim.world.stock.inventory_position(product) <= reorder_level {
                    sim.world.stock.add_on_transit(product, i64::from(case_per_pallet));
                    sim.sched.spawn(Box::new(ReplenishOneTask {
                        product,
                        agv: None,
                        mission_request: None,
                        crane_request: None,
                        store: None,
                        unit_load: None,
                        state: ReplenishState::Init,
                    }));
                }
            }
        }
        let interval = sim.world.system.replenishment_interval;
        Step::Wait(sim.sched.timeout(interval))
    }
}

enum ReplenishState {
    Init,
    AwaitAgv,
    ToInput,
    Loading,
    ToStore,
    AwaitCrane,
    Storing,
    Unloading,
}

/// Brings one fresh full pallet from the system input into a store.
struct ReplenishOneTask {
    product: ProductId,
    agv: Option<AgvId>,
    mission_request: Option<RequestId>,
    crane_request: Option<RequestId>,
    store: Option<StoreId>,
    unit_load: Option<crate::types::UnitLoadId>,
    state: ReplenishState,
}

impl ReplenishOneTask {
    fn abort(&mut self, sim: &mut Sim) -> Step {
        // Undo the transit booking; the order never moved.
        let cases = i64::from(sim.world.products[self.product].case_per_pallet());
        sim.world.stock.add_on_transit(self.product, -cases);
        Step::Done
    }

    fn step(&mut self, sim: &mut Sim) -> Result<Step, SimError> {
        let now = sim.sched.now();
        match self.state {
            ReplenishState::Init => {
                let Some(agv_id) = best_agv(&sim.world, AgvKind::Replenishment) else {
                    return Ok(self.abort(sim));
                };
                self.agv = Some(agv_id);
                let task = sim.sched.current_task().expect("replenish task is running");
                let Sim { sched, world, .. } = sim;
                let agv = &mut world.agvs[agv_id];
                let (request, granted) =
                    agv.sem.request(sched, 0.0, false, task, self.product.to_raw());
                agv.note_mission_requested(request, None);
                self.mission_request = Some(request);
                self.state = ReplenishState::AwaitAgv;
                Ok(Step::Wait(granted))
            }
            ReplenishState::AwaitAgv => {
                let agv_id = self.agv.expect("chosen at init");
                if let Some(request) = self.mission_request {
                    sim.world.agvs[agv_id].begin_mission(request, now);
                }
                let destination = sim.world.system.input_location;
                let arrival = begin_agv_trip(sim, agv_id, destination)?;
                self.state = ReplenishState::ToInput;
                Ok(Step::Wait(arrival))
            }
            ReplenishState::ToInput => {
                let agv_id = self.agv.expect("chosen at init");
                sim.world.agvs[agv_id].finish_trip(now);
                sim.world.agvs[agv_id].set_status(AgvStatus::WaitingToBeLoaded, now)?;
                let load_timeout = sim.world.agvs[agv_id].load_timeout;
                self.state = ReplenishState::Loading;
                Ok(Step::Wait(sim.sched.timeout(load_timeout)))
            }
            ReplenishState::Loading => {
                let agv_id = self.agv.expect("chosen at init");
                let spec = sim.world.products[self.product].clone();
                let unit_load = sim.world.unit_loads.insert(UnitLoad::full_of(self.product, &spec));
                self.unit_load = Some(unit_load);
                sim.world.agvs[agv_id].load(unit_load, now)?;
                let store = sim
                    .world
                    .stores
                    .keys()
                    .next()
                    .ok_or_else(|| SimError::InvalidRequest("no store registered".into()))?;
                self.store = Some(store);
                let destination = sim.world.stores[store].input_location;
                let arrival = begin_agv_trip(sim, agv_id, destination)?;
                self.state = ReplenishState::ToStore;
                Ok(Step::Wait(arrival))
            }
            ReplenishState::ToStore => {
                let agv_id = self.agv.expect("chosen at init");
                let store = self.store.expect("chosen while loading");
                sim.world.agvs[agv_id].finish_trip(now);
                sim.world.agvs[agv_id].set_status(AgvStatus::WaitingToBeUnloaded, now)?;
                sim.world.stores[store].note_input_queue(now, 1);
                let task = sim.sched.current_task().expect("replenish task is running");
                let Sim { sched, world, .. } = sim;
                let (request, granted) = world.stores[store].crane.request(
                    sched,
                    0.0,
                    false,
                    task,
                    self.product.to_raw(),
                );
                self.crane_request = Some(request);
                self.state = ReplenishState::AwaitCrane;
                Ok(Step::Wait(granted))
            }
            ReplenishState::AwaitCrane => {
                let store = self.store.expect("chosen while loading");
                let storage_time = sim.world.stores[store].storage_time;
                self.state = ReplenishState::Storing;
                Ok(Step::Wait(sim.sched.timeout(storage_time)))
            }
            ReplenishState::Storing => {
                let agv_id = self.agv.expect("chosen at init");
                let unload_timeout = sim.world.agvs[agv_id].unload_timeout;
                self.state = ReplenishState::Unloading;
                Ok(Step::Wait(sim.sched.timeout(unload_timeout)))
            }
            ReplenishState::Unloading => {
                let agv_id = self.agv.expect("chosen at init");
                let store = self.store.expect("chosen while loading");
                let unit_load = sim.world.agvs[agv_id].unload(now)?;
                store_unit_load(sim, store, unit_load)?;
                let cases = i64::from(sim.world.products[self.product].case_per_pallet());
                sim.world.stock.add_on_transit(self.product, -cases);
                if let Some(request) = self.crane_request.take() {
                    let Sim { sched, world, .. } = sim;
                    world.stores[store].crane.release(sched, request);
                }
                sim.world.stores[store].note_input_queue(now, -1);
                #[cfg(feature = "instrument")]
                tracing::info!(
                    target: "replenishment_stored",
                    sim_time = now,
                    product = self.product.to_raw(),
                );
                finish_agv_mission(sim, agv_id, self.mission_request.take());
                Ok(Step::Done)
            }
        }
    }
}

impl Process for ReplenishOneTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Failed(error) => Step::Failed(error),
            Resume::Interrupted => Step::Done,
            _ => self.step(sim).unwrap_or_else(Step::Failed),
        }
    }
}
