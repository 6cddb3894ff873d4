//! AGV fleet dispatch.

use crate::agv::AgvKind;
use crate::sim::Sim;
use crate::types::AgvId;
use crate::world::World;

/// Vehicles of a kind, in arena order.
pub fn agvs_of_kind(world: &World, kind: AgvKind) -> Vec<AgvId> {
    world.agvs.iter().filter(|(_, agv)| agv.kind == kind).map(|(id, _)| id).collect()
}

/// The least busy vehicle of a kind: fewest open grants plus queued
/// requests, arena order breaking ties.
pub fn best_agv(world: &World, kind: AgvKind) -> Option<AgvId> {
    world
        .agvs
        .iter()
        .filter(|(_, agv)| agv.kind == kind)
        .min_by_key(|(_, agv)| agv.pending_work())
        .map(|(id, _)| id)
}

/// A feeding vehicle for a new operation: a vehicle that just went idle at
/// the cell if one is parked, otherwise the least busy of the fleet.
pub fn best_feeding_agv(sim: &mut Sim) -> Option<AgvId> {
    while let Some(agv) = sim.world.system.idle_feeding_agvs.pop() {
        if sim.world.agvs.contains_key(agv) {
            return Some(agv);
        }
    }
    best_agv(&sim.world, AgvKind::Feeding)
}
