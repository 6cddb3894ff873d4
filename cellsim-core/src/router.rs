//! Distribution-driven job source for jobshop experiments.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::jobs::{Job, QueuePriority};
use crate::kernel::{Process, Resume, Step, TaskKey};
use crate::psp;
use crate::shopfloor;
use crate::sim::Sim;
use crate::types::ServerId;

/// Where generated jobs go: the pull pool or straight to the shopfloor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterTarget {
    Psp,
    ShopFloor,
}

/// One stock-keeping unit the router can generate.
pub struct SkuProfile {
    pub family: String,
    /// Relative sampling weight.
    pub weight: f64,
    pub routing: Vec<ServerId>,
    /// Service time at a given server of the routing.
    pub service_time: Box<dyn FnMut(ServerId) -> f64>,
    /// Due date = arrival + this allowance.
    pub due_date_allowance: Box<dyn FnMut() -> f64>,
}

/// Generates jobs at sampled inter-arrival times and routes them to the
/// PSP (pull) or the shopfloor (push).
pub struct Router {
    pub inter_arrival: Box<dyn FnMut() -> f64>,
    pub profiles: Vec<SkuProfile>,
    pub target: RouterTarget,
    pub priority_policy: QueuePriority,
    rng: StdRng,
}

impl Router {
    pub fn new(
        inter_arrival: Box<dyn FnMut() -> f64>,
        profiles: Vec<SkuProfile>,
        target: RouterTarget,
        seed: u64,
    ) -> Self {
        assert!(!profiles.is_empty(), "router needs at least one SKU profile");
        Self {
            inter_arrival,
            profiles,
            target,
            priority_policy: QueuePriority::Fifo,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn pick_profile(&mut self) -> usize {
        let total: f64 = self.profiles.iter().map(|p| p.weight).sum();
        let mut target = self.rng.random::<f64>() * total;
        for (idx, profile) in self.profiles.iter().enumerate() {
            target -= profile.weight;
            if target <= 0.0 {
                return idx;
            }
        }
        self.profiles.len() - 1
    }
}

/// Start the router's generation loop.
pub fn start(sim: &mut Sim, router: Router) -> TaskKey {
    sim.sched.spawn(Box::new(RouterTask { router }))
}

struct RouterTask {
    router: Router,
}

impl Process for RouterTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Failed(error) => return Step::Failed(error),
            Resume::Interrupted => return Step::Done,
            Resume::Started => {}
            Resume::Fired(_) => {
                let now = sim.sched.now();
                let idx = self.router.pick_profile();
                let profile = &mut self.router.profiles[idx];
                let routing: Vec<(ServerId, f64)> = profile
                    .routing
                    .iter()
                    .map(|&server| (server, (profile.service_time)(server)))
                    .collect();
                let due_date = now + (profile.due_date_allowance)();
                let job = Job::production(profile.family.clone(), routing, due_date, now)
                    .with_priority(self.router.priority_policy);
                let job_id = sim.world.jobs.insert(job);
                match self.router.target {
                    RouterTarget::Psp => psp::add(sim, job_id),
                    RouterTarget::ShopFloor => shopfloor::add(sim, job_id),
                }
            }
        }
        let delay = (self.router.inter_arrival)().max(0.0);
        Step::Wait(sim.sched.timeout(delay))
    }
}
