//! SLAR: Superfluous Load Avoidance Release (Land & Gaalman, 1998), with
//! the more aggressive one-in-queue starvation extension and the urgent
//! insertion rule.

use crate::kernel::{Process, Resume, Step};
use crate::psp;
use crate::shopfloor;
use crate::sim::Sim;
use crate::types::{JobId, RawKey, ServerId};

/// SLAR configuration. The policy is purely trigger-driven: register
/// [`SlarTrigger`] instead of a periodic release.
#[derive(Debug, Clone, Copy)]
pub struct Slar {
    /// Slack allowance per operation (parameter `k` in the paper).
    pub allowance_factor: f64,
}

impl Default for Slar {
    fn default() -> Self {
        Self { allowance_factor: 2.0 }
    }
}

impl Slar {
    /// Planned slack of `job` at `server`, with servers already passed
    /// sorting last (`None -> 0`).
    fn pst(&self, sim: &Sim, job: JobId, server: ServerId) -> f64 {
        sim.world.jobs[job]
            .planned_slack_at(server, self.allowance_factor, sim.sched.now())
            .unwrap_or(0.0)
    }
}

/// Listens on `job_processing_end` and applies the two SLAR triggers:
///
/// 1. starvation avoidance: the finishing server is empty or has a single
///    queued job - release the pooled job starting there with the lowest
///    planned slack;
/// 2. urgent insertion: every job queued at the server is non-urgent
///    (positive planned slack) - release an urgent pooled job (negative
///    planned slack), shortest first-operation processing time first.
pub struct SlarTrigger {
    pub slar: Slar,
}

impl SlarTrigger {
    fn on_processing_end(&self, sim: &mut Sim, finished: JobId) {
        let Some(server) = sim.world.jobs[finished].previous_server() else {
            return;
        };
        let (is_empty, has_one, queued): (bool, bool, Vec<JobId>) = {
            let state = &sim.world.servers[server];
            (state.empty(), state.queue_len() == 1, state.queueing_jobs().collect())
        };

        let candidate = if is_empty || has_one {
            sim.world
                .psp
                .jobs()
                .filter(|&job| sim.world.jobs[job].starts_at(server))
                .min_by(|&a, &b| {
                    self.slar.pst(sim, a, server).total_cmp(&self.slar.pst(sim, b, server))
                })
        } else if queued.iter().all(|&job| self.slar.pst(sim, job, server) > 0.0) {
            // Insert an urgent job with the shortest processing time at the
            // server, minimizing disruption to the non-urgent queue.
            sim.world
                .psp
                .jobs()
                .filter(|&job| {
                    sim.world.jobs[job].starts_at(server)
                        && self.slar.pst(sim, job, server) < 0.0
                })
                .min_by(|&a, &b| {
                    let time_a = sim.world.jobs[a].routing[0].1;
                    let time_b = sim.world.jobs[b].routing[0].1;
                    time_a.total_cmp(&time_b)
                })
        } else {
            None
        };

        if let Some(job) = candidate {
            psp::remove(sim, Some(job));
            shopfloor::add(sim, job);
        }
    }
}

impl Process for SlarTrigger {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Failed(error) => return Step::Failed(error),
            Resume::Interrupted => return Step::Done,
            Resume::Started => {}
            Resume::Fired(payload) => {
                if let Some(raw) = payload.raw() {
                    self.on_processing_end(sim, JobId::from_raw(raw));
                }
            }
        }
        Step::Wait(sim.world.shopfloor.job_processing_end)
    }
}
