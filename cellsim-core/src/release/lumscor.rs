//! LUMS-COR: workload-norm release with corrected WIP and planned release
//! dates (Land, 2006).

use slotmap::SecondaryMap;

use crate::errors::SimError;
use crate::kernel::{Process, Resume, Step};
use crate::psp;
use crate::release::ReleasePolicy;
use crate::shopfloor::{self, WipStrategy};
use crate::sim::Sim;
use crate::types::{JobId, RawKey, ServerId};

fn validate_strategy(sim: &Sim) -> Result<(), SimError> {
    if sim.world.shopfloor.wip_strategy != WipStrategy::Corrected {
        return Err(SimError::StrategyMismatch);
    }
    Ok(())
}

/// Periodic release: pooled jobs are considered in planned-release-date
/// order and released only while every server on their routing stays at or
/// below its workload norm after the corrected contribution.
pub struct LumsCor {
    /// Workload norm per server; servers without a norm are unconstrained.
    pub wl_norm: SecondaryMap<ServerId, f64>,
    /// Buffer time per operation in the planned release date.
    pub allowance_factor: f64,
}

impl LumsCor {
    pub fn new(wl_norm: SecondaryMap<ServerId, f64>, allowance_factor: f64) -> Self {
        Self { wl_norm, allowance_factor }
    }

    fn fits(&self, sim: &Sim, job: JobId) -> bool {
        let job = &sim.world.jobs[job];
        job.routing.iter().enumerate().all(|(position, &(server, processing))| {
            let wip = sim.world.shopfloor.wip.get(server).copied().unwrap_or(0.0);
            let norm = self.wl_norm.get(server).copied().unwrap_or(f64::INFINITY);
            wip + processing / (position + 1) as f64 <= norm
        })
    }
}

impl ReleasePolicy for LumsCor {
    fn release(&mut self, sim: &mut Sim) -> Result<(), SimError> {
        validate_strategy(sim)?;
        let mut candidates: Vec<JobId> = sim.world.psp.jobs().collect();
        candidates.sort_by(|&a, &b| {
            let prd_a = sim.world.jobs[a].planned_release_date(self.allowance_factor);
            let prd_b = sim.world.jobs[b].planned_release_date(self.allowance_factor);
            prd_a.total_cmp(&prd_b)
        });
        for job in candidates {
            sim.world.jobs[job].release_evaluations += 1;
            if self.fits(sim, job) {
                psp::remove(sim, Some(job));
                shopfloor::add(sim, job);
            }
        }
        Ok(())
    }
}

/// Companion trigger: on every processing end, if the finishing server is
/// empty or down to one queued request, the pooled job starting there with
/// the earliest planned release date is released unconditionally.
pub struct LumsCorStarvationTrigger {
    pub allowance_factor: f64,
}

impl Process for LumsCorStarvationTrigger {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Started => {
                // Fail fast on a misconfigured shopfloor.
                if let Err(error) = validate_strategy(sim) {
                    return Step::Failed(error);
                }
            }
            Resume::Failed(error) => return Step::Failed(error),
            Resume::Fired(payload) => {
                if let Some(raw) = payload.raw() {
                    let finished = JobId::from_raw(raw);
                    if let Some(server) = sim.world.jobs[finished].previous_server() {
                        let starving = {
                            let server = &sim.world.servers[server];
                            server.empty() || server.queue_len() == 1
                        };
                        if starving {
                            let candidate = sim
                                .world
                                .psp
                                .jobs()
                                .filter(|&job| sim.world.jobs[job].starts_at(server))
                                .min_by(|&a, &b| {
                                    let prd_a =
                                        sim.world.jobs[a].planned_release_date(self.allowance_factor);
                                    let prd_b =
                                        sim.world.jobs[b].planned_release_date(self.allowance_factor);
                                    prd_a.total_cmp(&prd_b)
                                });
                            if let Some(job) = candidate {
                                psp::remove(sim, Some(job));
                                shopfloor::add(sim, job);
                            }
                        }
                    }
                }
            }
            Resume::Interrupted => return Step::Done,
        }
        Step::Wait(sim.world.shopfloor.job_processing_end)
    }
}
