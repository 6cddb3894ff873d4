//! Picking cells: input/output queues, building point, robot, and the
//! three-area AGV pipeline.

pub mod areas;
pub mod flow;

use crate::kernel::{Payload, Process, Resume, Step};
use crate::requests::PalletRequest;
use crate::resources::{PrioritySemaphore, RequestId, SequentialStore, Store};
use crate::sim::Sim;
use crate::types::{
    CellId, FoId, History, LocationId, PalletRequestId, RawKey, SimTime, WorkloadUnit,
};
use crate::world::World;

pub use areas::{Area, Position};

// ============================================================================
// Robot
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmPosition {
    AtPickup,
    AtRelease,
}

/// The picking robot of a cell: a capacity-1 resource with pick, place and
/// rotation timings and an arm that must face the right side.
pub struct Robot {
    pub sem: PrioritySemaphore,
    pub pick_timeout: f64,
    pub place_timeout: f64,
    pub rotation_timeout: f64,
    pub arm_position: ArmPosition,
    pub worked_time: f64,
    pub movements: u32,
    pub saturation_history: History<f64>,
}

impl Robot {
    pub fn new(pick_timeout: f64, place_timeout: f64, rotation_timeout: f64) -> Self {
        Self {
            sem: PrioritySemaphore::new(1),
            pick_timeout,
            place_timeout,
            rotation_timeout,
            arm_position: ArmPosition::AtPickup,
            worked_time: 0.0,
            movements: 0,
            saturation_history: vec![(0.0, 0.0)],
        }
    }

    /// Busy time to move `n_cases` from pickup to release, including the
    /// rotations the current arm position forces. Advances the arm state
    /// and the work counters.
    pub fn transfer_duration(&mut self, n_cases: u32, now: SimTime) -> f64 {
        if n_cases == 0 {
            return 0.0;
        }
        let per_case = self.pick_timeout + self.place_timeout + 2.0 * self.rotation_timeout;
        let mut duration = f64::from(n_cases) * per_case;
        if self.arm_position == ArmPosition::AtPickup {
            // The first pick needs no rotation.
            duration -= self.rotation_timeout;
        }
        self.arm_position = ArmPosition::AtRelease;
        self.movements += n_cases;
        self.worked_time += duration;
        let end = now + duration;
        if end > 0.0 {
            self.saturation_history.push((end, self.worked_time / end));
        }
        duration
    }

    pub fn saturation(&self, now: SimTime) -> f64 {
        if now <= 0.0 { 0.0 } else { self.worked_time / now }
    }

    pub fn productivity(&self, now: SimTime) -> f64 {
        if now <= 0.0 { 0.0 } else { f64::from(self.movements) / now }
    }

    pub fn idle_time(&self, now: SimTime) -> f64 {
        now - self.worked_time
    }
}

// ============================================================================
// Picking cell
// ============================================================================

pub struct PickingCell {
    pub name: String,

    pub input_queue: Store<PalletRequestId>,
    pub output_queue: SequentialStore<PalletRequestId>,
    /// The slot at which the output pallet is being assembled.
    pub building_point: PrioritySemaphore,
    pub robot: Robot,

    /// Operations committed to this cell but still outside.
    pub feeding_area: Area<FoId>,
    /// Operations waiting inside the cell to be sequenced.
    pub staging_area: Area<FoId>,
    /// Operations at (or headed to) the unload positions.
    pub internal_area: Area<FoId>,
    pub unload_positions: Vec<Position>,
    pub pre_unload_positions: Vec<Position>,

    /// Every operation ever created to feed this cell.
    pub feeding_operations: Vec<FoId>,
    pub assigned: Vec<PalletRequestId>,
    pub completed: Vec<PalletRequestId>,
    pub current_pallet_request: Option<PalletRequestId>,

    pub workload: f64,
    pub workload_unit: WorkloadUnit,
    pub productivity_history: History<f64>,

    /// Whether the very first operation has entered staging; until then
    /// only the head of the feeding area may enter.
    pub first_fo_entered: bool,
    /// Sequence numbers observed arriving out of pick order.
    pub out_of_sequence: Vec<u64>,

    pub input_location: LocationId,
    pub staging_location: LocationId,
    pub internal_location: LocationId,
    pub output_location: LocationId,
}

/// Geometry and sizing of a cell under construction.
pub struct CellLayout {
    pub name: String,
    pub input_queue_capacity: usize,
    pub output_queue_capacity: usize,
    pub feeding_area_capacity: usize,
    pub staging_area_capacity: usize,
    pub internal_area_capacity: usize,
    /// Split the internal area into pre-unload and unload stages.
    pub pre_unload: bool,
    pub workload_unit: WorkloadUnit,
    pub robot: Robot,
    pub input_location: LocationId,
    pub staging_location: LocationId,
    pub internal_location: LocationId,
    pub output_location: LocationId,
}

impl PickingCell {
    pub fn new(layout: CellLayout) -> Self {
        let (n_unload, n_pre) = if layout.pre_unload {
            (layout.internal_area_capacity / 2, layout.internal_area_capacity / 2)
        } else {
            (layout.internal_area_capacity, 0)
        };
        Self {
            name: layout.name,
            input_queue: Store::new(layout.input_queue_capacity),
            output_queue: SequentialStore::new(layout.output_queue_capacity),
            building_point: PrioritySemaphore::new(1),
            robot: layout.robot,
            feeding_area: Area::new("feeding area", layout.feeding_area_capacity),
            staging_area: Area::new("staging area", layout.staging_area_capacity),
            internal_area: Area::new("internal area", layout.internal_area_capacity),
            unload_positions: (0..n_unload).map(|i| Position::new(format!("unload {i}"))).collect(),
            pre_unload_positions: (0..n_pre)
                .map(|i| Position::new(format!("pre-unload {i}")))
                .collect(),
            feeding_operations: Vec::new(),
            assigned: Vec::new(),
            completed: Vec::new(),
            current_pallet_request: None,
            workload: 0.0,
            workload_unit: layout.workload_unit,
            productivity_history: Vec::new(),
            first_fo_entered: false,
            out_of_sequence: Vec::new(),
            input_location: layout.input_location,
            staging_location: layout.staging_location,
            internal_location: layout.internal_location,
            output_location: layout.output_location,
        }
    }

    /// Completed pallet requests per unit of simulated time.
    pub fn productivity(&self, now: SimTime) -> f64 {
        if now <= 0.0 { 0.0 } else { self.completed.len() as f64 / now }
    }

    pub fn add_workload(&mut self, pallet_request: &PalletRequest) {
        self.workload += f64::from(pallet_request.total_workload(self.workload_unit));
    }

    pub fn remove_workload(&mut self, pallet_request: &PalletRequest) {
        self.workload -= f64::from(pallet_request.total_workload(self.workload_unit));
    }
}

/// Start a cell's main loop.
pub fn start_main(sim: &mut Sim, cell: CellId) {
    sim.sched.spawn(Box::new(CellMainTask { cell, state: CellState::Idle }));
}

// ============================================================================
// Cell main task
// ============================================================================

enum CellState {
    Idle,
    AwaitInput,
    AwaitBuildingPoint { pallet: PalletRequestId, request: RequestId },
    Processing { pallet: PalletRequestId, request: RequestId },
    AwaitOutputPut { pallet: PalletRequestId, request: RequestId },
}

/// Eternal loop: take a pallet request from the input queue, hold the
/// building point, run the picking, push the result to the output queue and
/// ask the system to retrieve it.
struct CellMainTask {
    cell: CellId,
    state: CellState,
}

impl CellMainTask {
    fn await_input(&mut self, sim: &mut Sim) -> Step {
        let Sim { sched, world, .. } = sim;
        let cell = &mut world.cells[self.cell];
        self.state = CellState::AwaitInput;
        Step::Wait(cell.input_queue.get(sched))
    }
}

impl Process for CellMainTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        let payload = match input {
            Resume::Failed(error) => return Step::Failed(error),
            Resume::Interrupted => return Step::Done,
            Resume::Started => Payload::None,
            Resume::Fired(payload) => payload,
        };
        match self.state {
            CellState::Idle => self.await_input(sim),
            CellState::AwaitInput => {
                let Some(raw) = payload.raw() else {
                    return self.await_input(sim);
                };
                let pallet = PalletRequestId::from_raw(raw);
                let now = sim.sched.now();
                sim.world.pallet_requests[pallet].started(now);
                let task = sim.sched.current_task().expect("cell task is running");
                let Sim { sched, world, .. } = sim;
                let cell = &mut world.cells[self.cell];
                cell.current_pallet_request = Some(pallet);
                let (request, granted) =
                    cell.building_point.request(sched, 0.0, false, task, pallet.to_raw());
                self.state = CellState::AwaitBuildingPoint { pallet, request };
                Step::Wait(granted)
            }
            CellState::AwaitBuildingPoint { pallet, request } => {
                let order: Vec<u64> = sim.world.pallet_requests[pallet]
                    .product_requests()
                    .map(|pr| pr.id)
                    .collect();
                let (_, done) = sim.sched.spawn_tracked(Box::new(ProcessPalletTask {
                    cell: self.cell,
                    pallet,
                    order,
                    state: PickState::Scan,
                }));
                self.state = CellState::Processing { pallet, request };
                Step::Wait(done)
            }
            CellState::Processing { pallet, request } => {
                let Sim { sched, world, .. } = sim;
                let cell = &mut world.cells[self.cell];
                let put = cell.output_queue.put(sched, pallet);
                self.state = CellState::AwaitOutputPut { pallet, request };
                Step::Wait(put)
            }
            CellState::AwaitOutputPut { pallet, request } => {
                let now = sim.sched.now();
                {
                    let World { cells, pallet_requests, .. } = &mut sim.world;
                    let cell = &mut cells[self.cell];
                    let pallet_request = &mut pallet_requests[pallet];
                    cell.completed.push(pallet);
                    cell.remove_workload(pallet_request);
                    pallet_request.completed(now);
                    cell.current_pallet_request = None;
                    let productivity = cell.productivity(now);
                    cell.productivity_history.push((now, productivity));
                    cell.building_point.release(&mut sim.sched, request);
                }
                #[cfg(feature = "instrument")]
                tracing::info!(
                    target: "pallet_completed",
                    sim_time = now,
                    cell = self.cell.to_raw(),
                    pallet_request = pallet.to_raw(),
                );
                crate::controllers::system::retrieve_from_cell(sim, self.cell, pallet);
                self.await_input(sim)
            }
        }
    }
}

// ============================================================================
// Pallet processing task
// ============================================================================

enum PickState {
    /// Find the next unprocessed product request and its feeding operation.
    Scan,
    /// Waiting for a feeding operation to reach its unload position.
    AwaitFo,
    AwaitRobot { product_request: u64, fo: FoId, request: RequestId },
    Transferring { product_request: u64, fo: FoId, n_cases: u32, request: RequestId },
}

/// Builds one pallet: for each product request in pallet order, wait for
/// the serving feeding operation at an unload position, run the robot, and
/// transfer cases from the feeding unit load onto the pallet.
struct ProcessPalletTask {
    cell: CellId,
    pallet: PalletRequestId,
    order: Vec<u64>,
    state: PickState,
}

impl ProcessPalletTask {
    /// The poll interval while a product request has no feeding operation
    /// scheduled yet.
    const RETRY_INTERVAL: f64 = 1.0;

    fn next_unprocessed(&self, sim: &Sim) -> Option<u64> {
        let pallet = &sim.world.pallet_requests[self.pallet];
        self.order.iter().copied().find(|&id| {
            pallet.product_request(id).map(|pr| !pr.processed()).unwrap_or(false)
        })
    }

    fn serving_fo(&self, sim: &Sim, product_request: u64) -> Option<FoId> {
        sim.world
            .feeding_ops
            .iter()
            .filter(|(_, fo)| fo.cell == self.cell && !fo.status.done)
            .filter(|(_, fo)| fo.serves_product_request(product_request))
            .min_by_key(|(_, fo)| fo.seq)
            .map(|(id, _)| id)
    }

    fn scan(&mut self, sim: &mut Sim) -> Step {
        let Some(product_request) = self.next_unprocessed(sim) else {
            return Step::Done;
        };
        match self.serving_fo(sim, product_request) {
            Some(fo_id) => {
                let fo = &sim.world.feeding_ops[fo_id];
                if fo.is_at_unload_position() {
                    let task = sim.sched.current_task().expect("pallet task is running");
                    let Sim { sched, world, .. } = sim;
                    let cell = &mut world.cells[self.cell];
                    let (request, granted) =
                        cell.robot.sem.request(sched, 0.0, false, task, self.pallet.to_raw());
                    self.state = PickState::AwaitRobot { product_request, fo: fo_id, request };
                    Step::Wait(granted)
                } else {
                    self.state = PickState::AwaitFo;
                    Step::Wait(fo.ready_event)
                }
            }
            None => {
                // No operation scheduled yet; the controller may still be
                // dispatching AGVs. Check again shortly.
                self.state = PickState::AwaitFo;
                Step::Wait(sim.sched.timeout(Self::RETRY_INTERVAL))
            }
        }
    }

    /// Robot granted: size the transfer and start the busy timeout.
    fn start_transfer(
        &mut self,
        sim: &mut Sim,
        product_request: u64,
        fo: FoId,
        request: RequestId,
    ) -> Step {
        let now = sim.sched.now();
        let (n_cases, exhausted) = {
            let world = &sim.world;
            let pallet = &world.pallet_requests[self.pallet];
            let Some(pr) = pallet.product_request(product_request) else {
                return self.release_robot_and_rescan(sim, request);
            };
            let operation = &world.feeding_ops[fo];
            let available = world.unit_loads[operation.unit_load].n_cases_of(pr.product);
            (pr.remaining_to_pick().min(available), available == 0)
        };
        if n_cases == 0 {
            // The unit load has nothing left for this request; retire the
            // operation and look for another source.
            let step = self.release_robot_and_rescan(sim, request);
            if exhausted {
                flow::complete_feeding_operation(sim, fo);
            }
            return step;
        }
        let duration = sim.world.cells[self.cell].robot.transfer_duration(n_cases, now);
        self.state = PickState::Transferring { product_request, fo, n_cases, request };
        Step::Wait(sim.sched.timeout(duration))
    }

    /// Robot done: move the cases between unit loads and settle the books.
    fn finish_transfer(
        &mut self,
        sim: &mut Sim,
        product_request: u64,
        fo: FoId,
        n_cases: u32,
        request: RequestId,
    ) -> Step {
        let mut transfer_failed = None;
        {
            let World { pallet_requests, feeding_ops, unit_loads, products, .. } = &mut sim.world;
            let operation = &feeding_ops[fo];
            let pallet = &mut pallet_requests[self.pallet];
            let Some(pr) = pallet.product_request_mut(product_request) else {
                return self.release_robot_and_rescan(sim, request);
            };
            let product_id = pr.product;
            let source_id = operation.unit_load;
            let dest_id = pallet.unit_load;

            let source = &mut unit_loads[source_id];
            for _ in 0..n_cases {
                if let Err(error) = source.remove_case(product_id) {
                    transfer_failed = Some(error);
                    break;
                }
            }
            if transfer_failed.is_none() {
                let product = &products[product_id];
                let dest = &mut unit_loads[dest_id];
                if let Err(error) = dest.add_product(product_id, product, n_cases) {
                    transfer_failed = Some(error);
                }
            }
            if transfer_failed.is_none() {
                pallet.product_request_mut(product_request)
                    .expect("request located above")
                    .mark_picked(n_cases);
            }
        }
        if let Some(error) = transfer_failed {
            return Step::Failed(error);
        }
        #[cfg(feature = "instrument")]
        tracing::info!(
            target: "cases_picked",
            sim_time = sim.sched.now(),
            cell = self.cell.to_raw(),
            pallet_request = self.pallet.to_raw(),
            n_cases,
        );

        let fo_finished = {
            let world = &sim.world;
            let operation = &world.feeding_ops[fo];
            let drained = world.unit_loads[operation.unit_load].is_empty();
            let served = operation.product_requests.iter().all(|&(pallet, pr_id)| {
                world.pallet_requests[pallet]
                    .product_request(pr_id)
                    .map(|pr| pr.processed())
                    .unwrap_or(true)
            });
            drained || served
        };
        let step = self.release_robot_and_rescan(sim, request);
        if fo_finished {
            flow::complete_feeding_operation(sim, fo);
        }
        step
    }

    fn release_robot_and_rescan(&mut self, sim: &mut Sim, request: RequestId) -> Step {
        sim.world.cells[self.cell].robot.sem.release(&mut sim.sched, request);
        self.scan(sim)
    }
}

impl Process for ProcessPalletTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Failed(error) => Step::Failed(error),
            Resume::Interrupted => Step::Done,
            Resume::Started => self.scan(sim),
            Resume::Fired(_) => match self.state {
                PickState::Scan | PickState::AwaitFo => self.scan(sim),
                PickState::AwaitRobot { product_request, fo, request } => {
                    self.start_transfer(sim, product_request, fo, request)
                }
                PickState::Transferring { product_request, fo, n_cases, request } => {
                    self.finish_transfer(sim, product_request, fo, n_cases, request)
                }
            },
        }
    }
}
