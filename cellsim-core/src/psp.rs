//! The pre-shop pool: jobs waiting to be released to the shopfloor.

use std::collections::VecDeque;

use crate::kernel::{EventKey, Payload, Process, Resume, Scheduler, Step};
use crate::release::ReleasePolicy;
use crate::sim::Sim;
use crate::types::{JobId, RawKey, SimTime};

/// FIFO pool of jobs plus a `new_job` signal that succeeds (and resets) on
/// every addition. A periodic task invokes the configured release policy.
pub struct PreShopPool {
    jobs: VecDeque<JobId>,
    /// Succeeds with the job id whenever a job enters the pool.
    pub new_job: EventKey,
    /// Interval of the periodic policy check; `<= 0` disables it.
    pub check_timeout: SimTime,
    pub policy: Option<Box<dyn ReleasePolicy>>,
}

impl PreShopPool {
    pub fn new(sched: &mut Scheduler) -> Self {
        Self { jobs: VecDeque::new(), new_job: sched.event(), check_timeout: 1.0, policy: None }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, job: JobId) -> bool {
        self.jobs.contains(&job)
    }

    pub fn jobs(&self) -> impl Iterator<Item = JobId> + '_ {
        self.jobs.iter().copied()
    }
}

/// Add a job to the pool and fire the `new_job` signal.
pub fn add(sim: &mut Sim, job: JobId) {
    sim.world.psp.jobs.push_back(job);
    #[cfg(feature = "instrument")]
    tracing::info!(
        target: "psp_add",
        sim_time = sim.sched.now(),
        job = job.to_raw(),
        psp_size = sim.world.psp.len(),
    );
    let event = sim.world.psp.new_job;
    sim.sched.succeed(event, Payload::Raw(job.to_raw()));
    sim.world.psp.new_job = sim.sched.event();
}

/// Remove a specific job (or the head of the pool), stamping its PSP exit
/// time. Returns `None` when the job is not pooled (or the pool is empty).
pub fn remove(sim: &mut Sim, job: Option<JobId>) -> Option<JobId> {
    let removed = match job {
        Some(job) => {
            let idx = sim.world.psp.jobs.iter().position(|&pooled| pooled == job)?;
            sim.world.psp.jobs.remove(idx)
        }
        None => sim.world.psp.jobs.pop_front(),
    }?;
    sim.world.jobs[removed].psp_exit_at = Some(sim.sched.now());
    #[cfg(feature = "instrument")]
    tracing::info!(
        target: "psp_release",
        sim_time = sim.sched.now(),
        job = removed.to_raw(),
        psp_size = sim.world.psp.len(),
    );
    Some(removed)
}

/// Start the periodic policy check when a positive interval is configured.
pub fn start_periodic_check(sim: &mut Sim) {
    if sim.world.psp.check_timeout > 0.0 {
        sim.sched.spawn(Box::new(PspCheckTask));
    }
}

/// Every `check_timeout` seconds, hand the pool to the release policy.
struct PspCheckTask;

impl Process for PspCheckTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        if let Resume::Failed(error) = input {
            return Step::Failed(error);
        }
        if !matches!(input, Resume::Started) && !sim.world.psp.is_empty() {
            if let Some(mut policy) = sim.world.psp.policy.take() {
                let outcome = policy.release(sim);
                if sim.world.psp.policy.is_none() {
                    sim.world.psp.policy = Some(policy);
                }
                if let Err(error) = outcome {
                    return Step::Failed(error);
                }
            }
        }
        let interval = sim.world.psp.check_timeout;
        Step::Wait(sim.sched.timeout(interval))
    }
}
