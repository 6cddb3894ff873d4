//! Push-adjacent starvation avoidance: bypass the periodic policy when a
//! fresh job's first server sits idle.

use crate::kernel::{Process, Resume, Step};
use crate::psp;
use crate::shopfloor;
use crate::sim::Sim;
use crate::types::{JobId, RawKey};

/// Listens on `psp.new_job`; a job whose first server has an empty queue is
/// released immediately. Composes with LUMS-COR and SLAR without replacing
/// either.
pub struct StarvationAvoidanceTask;

impl Process for StarvationAvoidanceTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Failed(error) => return Step::Failed(error),
            Resume::Interrupted => return Step::Done,
            Resume::Started => {}
            Resume::Fired(payload) => {
                if let Some(raw) = payload.raw() {
                    let job = JobId::from_raw(raw);
                    if sim.world.psp.contains(job) {
                        let first_server_empty = sim.world.jobs[job]
                            .routing
                            .first()
                            .is_some_and(|&(server, _)| sim.world.servers[server].empty());
                        if first_server_empty {
                            psp::remove(sim, Some(job));
                            shopfloor::add(sim, job);
                        }
                    }
                }
            }
        }
        Step::Wait(sim.world.psp.new_job)
    }
}
