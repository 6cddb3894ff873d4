//! Flow control of feeding operations through a cell's areas.
//!
//! The area transitions (feeding -> staging -> internal -> out) are driven
//! by a pump: after every relevant append/remove the pipeline retries both
//! admissions until neither can make progress. Admission mutates the areas
//! synchronously; the AGV movement itself runs as a spawned task.

use crate::agv::AgvStatus;
use crate::kernel::{Payload, Process, Resume, Step};
use crate::sim::Sim;
use crate::types::{CellId, FoId, RawKey};
use crate::world::World;

/// An AGV knocked at the cell door: make sure the operation is tracked in
/// the feeding area, then try to move the pipeline.
pub fn on_feeding_arrival(sim: &mut Sim, cell_id: CellId, fo: FoId) {
    let now = sim.sched.now();
    let cell = &mut sim.world.cells[cell_id];
    if !cell.feeding_area.contains(fo) {
        cell.feeding_area.append_exceed(fo, now);
    }
    pump_pipeline(sim, cell_id);
}

/// Register a freshly created feeding operation with its cell. Uses the
/// capacity bypass: the operation is already committed to an AGV.
pub fn register_feeding_operation(sim: &mut Sim, cell_id: CellId, fo: FoId) {
    let now = sim.sched.now();
    let relative_id = {
        let cell = &mut sim.world.cells[cell_id];
        cell.feeding_operations.push(fo);
        cell.feeding_area.append_exceed(fo, now);
        cell.feeding_operations.len() - 1
    };
    sim.world.feeding_ops[fo].relative_id = relative_id;
    pump_pipeline(sim, cell_id);
}

/// Fire the staging admission, then the internal admission, until no more
/// progress is possible.
pub fn pump_pipeline(sim: &mut Sim, cell_id: CellId) {
    loop {
        let staged = try_admit_to_staging(sim, cell_id);
        let interned = try_admit_to_internal(sim, cell_id);
        if !staged && !interned {
            break;
        }
    }
}

/// Sequencing rule for feeding -> staging: the first operation ever must be
/// the head of the feeding area; afterwards a candidate may enter iff it
/// shares a product request with the last staged operation, or provides the
/// next unmet product request of one of that operation's pallet requests.
fn can_enter_staging(world: &World, cell_id: CellId, fo_id: FoId) -> bool {
    let cell = &world.cells[cell_id];
    let candidate = &world.feeding_ops[fo_id];
    if !cell.first_fo_entered {
        return cell.feeding_area.first() == Some(fo_id);
    }
    let Some(last_in) = cell.staging_area.last_in else {
        return true;
    };
    let last = &world.feeding_ops[last_in];
    let shares_product_request = candidate
        .product_requests
        .iter()
        .any(|(_, id)| last.serves_product_request(*id));
    if shares_product_request {
        return true;
    }
    let next_unmet: Vec<u64> = last
        .pallet_requests()
        .iter()
        .filter_map(|&pallet| world.pallet_requests[pallet].next_unmet_product_request())
        .collect();
    if next_unmet.is_empty() {
        // The sequence the rule protects is complete; nothing left to order
        // against.
        return true;
    }
    next_unmet.iter().any(|&next| candidate.serves_product_request(next))
}

fn try_admit_to_staging(sim: &mut Sim, cell_id: CellId) -> bool {
    let (admitted, any_waiting) = {
        let world = &sim.world;
        let cell = &world.cells[cell_id];
        if cell.staging_area.is_full() || cell.feeding_area.is_empty() {
            return false;
        }
        let any_waiting = cell
            .feeding_area
            .iter()
            .any(|fo_id| world.feeding_ops[fo_id].is_in_front_of_staging_area());
        let admitted = cell
            .feeding_area
            .iter()
            .filter(|&fo_id| world.feeding_ops[fo_id].is_in_front_of_staging_area())
            .filter(|&fo_id| can_enter_staging(world, cell_id, fo_id))
            .min_by_key(|&fo_id| world.feeding_ops[fo_id].seq);
        (admitted, any_waiting)
    };
    let Some(fo) = admitted else {
        // An arrived vehicle is blocked by the sequencing rule: note it.
        if any_waiting {
            let blocking = sim.world.cells[cell_id]
                .feeding_area
                .last_in
                .map(|last_in| sim.world.feeding_ops[last_in].seq);
            if let Some(seq) = blocking {
                let cell = &mut sim.world.cells[cell_id];
                if !cell.out_of_sequence.contains(&seq) {
                    cell.out_of_sequence.push(seq);
                }
            }
        }
        return false;
    };
    let now = sim.sched.now();
    let cell = &mut sim.world.cells[cell_id];
    cell.first_fo_entered = true;
    cell.feeding_area.remove(fo, now);
    sim.sched.spawn(Box::new(StagingMoveTask { fo, moving: false }));
    true
}

fn try_admit_to_internal(sim: &mut Sim, cell_id: CellId) -> bool {
    let (fo, unload_position, pre_unload_position) = {
        let world = &sim.world;
        let cell = &world.cells[cell_id];
        if cell.internal_area.is_full() || cell.staging_area.is_empty() {
            return false;
        }
        let Some(unload_position) = free_position(world, cell_id, false) else {
            return false;
        };
        let pre_unload_position = if cell.pre_unload_positions.is_empty() {
            None
        } else {
            // Two-stage internal area: a pre-unload slot must be free too.
            match free_position(world, cell_id, true) {
                Some(slot) => Some(slot),
                None => return false,
            }
        };
        let Some(fo) = cell
            .staging_area
            .iter()
            .filter(|&fo_id| world.feeding_ops[fo_id].is_inside_staging_area())
            .min_by_key(|&fo_id| world.feeding_ops[fo_id].seq)
        else {
            return false;
        };
        (fo, unload_position, pre_unload_position)
    };
    let now = sim.sched.now();
    sim.world.cells[cell_id].staging_area.remove(fo, now);
    {
        let operation = &mut sim.world.feeding_ops[fo];
        operation.unload_position = Some(unload_position);
        operation.pre_unload_position = pre_unload_position;
    }
    sim.sched.spawn(Box::new(InternalMoveTask { fo, state: InternalMoveState::Init }));
    true
}

/// A position is free when its slot is unheld and no live operation has it
/// assigned.
fn free_position(world: &World, cell_id: CellId, pre_unload: bool) -> Option<usize> {
    let cell = &world.cells[cell_id];
    let positions = if pre_unload { &cell.pre_unload_positions } else { &cell.unload_positions };
    positions.iter().enumerate().position(|(idx, position)| {
        position.free()
            && !world.feeding_ops.iter().any(|(_, fo)| {
                let assigned =
                    if pre_unload { fo.pre_unload_position } else { fo.unload_position };
                fo.cell == cell_id && !fo.status.done && assigned == Some(idx)
            })
    })
}

// ============================================================================
// Movement tasks
// ============================================================================

/// Drives the AGV from the cell door into the staging area.
struct StagingMoveTask {
    fo: FoId,
    moving: bool,
}

impl Process for StagingMoveTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        if let Resume::Failed(error) = input {
            return Step::Failed(error);
        }
        if !self.moving {
            self.moving = true;
            let now = sim.sched.now();
            let (agv_id, destination) = {
                let operation = &sim.world.feeding_ops[self.fo];
                (operation.agv, sim.world.cells[operation.cell].staging_location)
            };
            sim.world.feeding_ops[self.fo].log.started_trip_to_staging_area = Some(now);
            let distance = sim.distance_to(agv_id, destination);
            let duration =
                match sim.world.agvs[agv_id].begin_trip(destination, distance, now) {
                    Ok(duration) => duration,
                    Err(error) => return Step::Failed(error),
                };
            return Step::Wait(sim.sched.timeout(duration));
        }
        let now = sim.sched.now();
        let (agv_id, cell_id) = {
            let operation = &sim.world.feeding_ops[self.fo];
            (operation.agv, operation.cell)
        };
        sim.world.agvs[agv_id].finish_trip(now);
        {
            let operation = &mut sim.world.feeding_ops[self.fo];
            operation.status.staging = true;
            operation.log.finished_trip_to_staging_area = Some(now);
        }
        sim.world.cells[cell_id].staging_area.append_exceed(self.fo, now);
        #[cfg(feature = "instrument")]
        tracing::info!(
            target: "fo_staged",
            sim_time = now,
            cell = cell_id.to_raw(),
            fo = self.fo.to_raw(),
        );
        pump_pipeline(sim, cell_id);
        Step::Done
    }
}

enum InternalMoveState {
    Init,
    /// Waiting for the pre-unload slot grant.
    AwaitPreUnload,
    /// Traveling from staging into the internal area.
    Traveling,
    /// Waiting for the unload slot grant (after arrival).
    AwaitUnload,
}

/// Drives the AGV from staging into the internal area and onto its unload
/// position; with a two-stage layout it stops at the pre-unload slot first.
struct InternalMoveTask {
    fo: FoId,
    state: InternalMoveState,
}

impl InternalMoveTask {
    fn request_position(&mut self, sim: &mut Sim, pre_unload: bool) -> crate::kernel::EventKey {
        let task = sim.sched.current_task().expect("move task is running");
        let (cell_id, slot) = {
            let operation = &sim.world.feeding_ops[self.fo];
            let slot = if pre_unload {
                operation.pre_unload_position.expect("pre-unload slot assigned")
            } else {
                operation.unload_position.expect("unload slot assigned")
            };
            (operation.cell, slot)
        };
        let Sim { sched, world, .. } = sim;
        let cell = &mut world.cells[cell_id];
        let positions =
            if pre_unload { &mut cell.pre_unload_positions } else { &mut cell.unload_positions };
        let (request, granted) =
            positions[slot].sem.request(sched, 0.0, false, task, self.fo.to_raw());
        let operation = &mut world.feeding_ops[self.fo];
        if pre_unload {
            operation.pre_unload_position_request = Some(request);
        } else {
            operation.unload_position_request = Some(request);
        }
        granted
    }

    fn start_travel(&mut self, sim: &mut Sim) -> Step {
        let now = sim.sched.now();
        let (agv_id, destination) = {
            let operation = &sim.world.feeding_ops[self.fo];
            (operation.agv, sim.world.cells[operation.cell].internal_location)
        };
        sim.world.feeding_ops[self.fo].log.started_trip_to_internal_area = Some(now);
        let distance = sim.distance_to(agv_id, destination);
        let duration = match sim.world.agvs[agv_id].begin_trip(destination, distance, now) {
            Ok(duration) => duration,
            Err(error) => return Step::Failed(error),
        };
        self.state = InternalMoveState::Traveling;
        Step::Wait(sim.sched.timeout(duration))
    }

    fn arrive(&mut self, sim: &mut Sim) -> Step {
        let now = sim.sched.now();
        let (agv_id, cell_id, two_stage) = {
            let operation = &sim.world.feeding_ops[self.fo];
            (operation.agv, operation.cell, operation.pre_unload_position.is_some())
        };
        sim.world.agvs[agv_id].finish_trip(now);
        {
            let operation = &mut sim.world.feeding_ops[self.fo];
            operation.status.inside = true;
            operation.log.finished_trip_to_internal_area = Some(now);
        }
        sim.world.cells[cell_id].internal_area.append_exceed(self.fo, now);
        if two_stage {
            // Pipeline through the pre-unload slot: the unload slot may
            // still be occupied by the previous vehicle.
            self.state = InternalMoveState::AwaitUnload;
            let granted = self.request_position(sim, false);
            Step::Wait(granted)
        } else {
            self.finish(sim)
        }
    }

    fn finish(&mut self, sim: &mut Sim) -> Step {
        let now = sim.sched.now();
        let (agv_id, cell_id) = {
            let operation = &mut sim.world.feeding_ops[self.fo];
            operation.status.ready = true;
            (operation.agv, operation.cell)
        };
        // The vehicle sits loaded at its unload position.
        if let Err(error) =
            sim.world.agvs[agv_id].set_status(AgvStatus::WaitingToBeUnloaded, now)
        {
            return Step::Failed(error);
        }
        let ready = sim.world.feeding_ops[self.fo].ready_event;
        sim.sched.succeed(ready, Payload::Raw(self.fo.to_raw()));
        #[cfg(feature = "instrument")]
        tracing::info!(
            target: "fo_ready",
            sim_time = now,
            cell = cell_id.to_raw(),
            fo = self.fo.to_raw(),
        );
        pump_pipeline(sim, cell_id);
        Step::Done
    }
}

impl Process for InternalMoveTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Failed(error) => Step::Failed(error),
            Resume::Interrupted => Step::Done,
            Resume::Started => {
                let two_stage = sim.world.feeding_ops[self.fo].pre_unload_position.is_some();
                if two_stage {
                    self.state = InternalMoveState::AwaitPreUnload;
                    let granted = self.request_position(sim, true);
                    Step::Wait(granted)
                } else {
                    self.state = InternalMoveState::AwaitUnload;
                    let granted = self.request_position(sim, false);
                    Step::Wait(granted)
                }
            }
            Resume::Fired(_) => match self.state {
                InternalMoveState::Init => self.start_travel(sim),
                InternalMoveState::AwaitPreUnload => self.start_travel(sim),
                InternalMoveState::Traveling => self.arrive(sim),
                InternalMoveState::AwaitUnload => {
                    let inside = sim.world.feeding_ops[self.fo].status.inside;
                    if !inside {
                        // Single-stage layout: the unload slot is granted
                        // before driving in.
                        self.start_travel(sim)
                    } else {
                        // Unload slot granted: release the pre-unload slot
                        // if one was held, then settle.
                        let (cell_id, pre_slot, pre_request) = {
                            let operation = &mut sim.world.feeding_ops[self.fo];
                            (
                                operation.cell,
                                operation.pre_unload_position,
                                operation.pre_unload_position_request.take(),
                            )
                        };
                        if let (Some(slot), Some(request)) = (pre_slot, pre_request) {
                            let Sim { sched, world, .. } = sim;
                            world.cells[cell_id].pre_unload_positions[slot]
                                .release(sched, request);
                        }
                        self.finish(sim)
                    }
                }
            },
        }
    }
}

// ============================================================================
// Completion: out of the internal area
// ============================================================================

/// Retire a feeding operation whose picking is done: leave the internal
/// area, free the unload slot, pump the pipeline, and send the AGV back -
/// to the store when cases remain, to the recharge location when the unit
/// load was fully consumed.
pub fn complete_feeding_operation(sim: &mut Sim, fo: FoId) {
    let now = sim.sched.now();
    let (cell_id, unload_slot, unload_request, drained) = {
        let World { feeding_ops, unit_loads, .. } = &mut sim.world;
        let operation = &mut feeding_ops[fo];
        operation.status.done = true;
        (
            operation.cell,
            operation.unload_position,
            operation.unload_position_request.take(),
            unit_loads[operation.unit_load].is_empty(),
        )
    };
    sim.world.cells[cell_id].internal_area.remove(fo, now);
    if let (Some(slot), Some(request)) = (unload_slot, unload_request) {
        let Sim { sched, world, .. } = sim;
        world.cells[cell_id].unload_positions[slot].release(sched, request);
    }
    // De-register from the unit load before it moves on.
    {
        let unit_load = sim.world.feeding_ops[fo].unit_load;
        if let Some(ul) = sim.world.unit_loads.get_mut(unit_load) {
            ul.feeding_operation = None;
        }
    }
    pump_pipeline(sim, cell_id);
    if drained {
        sim.sched.spawn(Box::new(crate::controllers::system::DropTask::new(fo)));
    } else {
        sim.sched.spawn(Box::new(crate::controllers::system::ReturnTask::new(fo)));
    }
}
