//! The simulation facade: scheduler, world, demand, and distances.

use crate::cell;
use crate::controllers::system;
use crate::demand::DemandGenerator;
use crate::distance::DistanceMetric;
use crate::kernel::Scheduler;
use crate::psp;
use crate::server::ServerKind;
use crate::shopfloor::BreakdownTask;
use crate::types::{AgvId, LocationId, ServerId, SimTime};
use crate::world::World;

/// One simulation run: the scheduler driving time, the world holding every
/// entity, and the external collaborators injected explicitly.
pub struct Sim {
    pub sched: Scheduler,
    pub world: World,
    pub demand: Option<Box<dyn DemandGenerator>>,
    pub distance_metric: DistanceMetric,
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl Sim {
    pub fn new() -> Self {
        let mut sched = Scheduler::new();
        let world = World::new(&mut sched);
        Self { sched, world, demand: None, distance_metric: DistanceMetric::Euclidean }
    }

    pub fn now(&self) -> SimTime {
        self.sched.now()
    }

    pub fn distance_between(&self, a: LocationId, b: LocationId) -> f64 {
        self.distance_metric.between(&self.world.locations[a], &self.world.locations[b])
    }

    /// Distance from an AGV's current position to a destination.
    pub fn distance_to(&self, agv: AgvId, destination: LocationId) -> f64 {
        self.distance_between(self.world.agvs[agv].current_location, destination)
    }

    /// Start the standing processes of a configured world: the system
    /// controller loops, the PSP periodic check, every cell's main loop,
    /// and the breakdown generators of faulty servers.
    pub fn start(&mut self) {
        system::start(self);
        psp::start_periodic_check(self);
        let cells: Vec<_> = self.world.cells.keys().collect();
        for cell_id in cells {
            cell::start_main(self, cell_id);
        }
        self.start_breakdown_processes();
    }

    /// Spawn the time-between-failures task of every faulty server.
    pub fn start_breakdown_processes(&mut self) {
        let faulty: Vec<ServerId> = self
            .world
            .servers
            .iter()
            .filter(|(_, server)| matches!(server.kind, ServerKind::Faulty(_)))
            .map(|(id, _)| id)
            .collect();
        for server in faulty {
            self.sched.spawn(Box::new(BreakdownTask { server }));
        }
    }
}
