//! The shopfloor: active jobs, WIP accounting, and streaming KPIs.

use slotmap::SecondaryMap;

use crate::kernel::{EventKey, Payload, Process, Resume, Scheduler, Step};
use crate::resources::RequestId;
use crate::server::ServerKind;
use crate::sim::Sim;
use crate::types::{JobId, RawKey, ServerId, SimTime};
use crate::world::World;

/// Due-date window used by the tardy/early/on-time classification.
pub const DUE_DATE_WINDOW: f64 = 7.0;
/// Throughput snapshots close every this many simulated seconds.
const THROUGHPUT_WINDOW: f64 = 60.0;

/// How WIP is accumulated per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipStrategy {
    /// `wip[s] += processing` on add, `-=` on operation exit.
    Standard,
    /// `wip[s] += processing / (position + 1)` on add; on every operation
    /// exit the residual work downstream is rebalanced one position closer.
    Corrected,
}

/// Streaming exponential moving average; alpha defaults to 0.01.
fn ema(current: &mut f64, alpha: f64, sample: f64) {
    *current += alpha * (sample - *current);
}

pub struct ShopFloor {
    pub wip_strategy: WipStrategy,
    pub wip: SecondaryMap<ServerId, f64>,
    pub jobs: Vec<JobId>,
    pub jobs_done: Vec<JobId>,

    pub ema_alpha: f64,
    pub ema_makespan: f64,
    pub ema_tardy_jobs: f64,
    pub ema_early_jobs: f64,
    pub ema_in_window_jobs: f64,
    pub ema_time_in_psp: f64,
    pub ema_time_in_shopfloor: f64,
    pub ema_total_queue_time: f64,

    pub total_time_in_system: f64,
    pub maximum_wip_value: f64,
    pub maximum_shopfloor_jobs: usize,

    last_throughput_snapshot_at: SimTime,
    last_throughput_snapshot_jobs_done: usize,
    pub current_hourly_throughput: usize,

    /// Succeeds with the job id on every per-server exit, then resets.
    pub job_processing_end: EventKey,
    /// Succeeds with the job id on every full completion, then resets.
    pub job_finished: EventKey,
}

impl ShopFloor {
    pub fn new(sched: &mut Scheduler) -> Self {
        Self {
            wip_strategy: WipStrategy::Standard,
            wip: SecondaryMap::new(),
            jobs: Vec::new(),
            jobs_done: Vec::new(),
            ema_alpha: 0.01,
            ema_makespan: 0.0,
            ema_tardy_jobs: 0.0,
            ema_early_jobs: 0.0,
            ema_in_window_jobs: 0.0,
            ema_time_in_psp: 0.0,
            ema_time_in_shopfloor: 0.0,
            ema_total_queue_time: 0.0,
            total_time_in_system: 0.0,
            maximum_wip_value: 0.0,
            maximum_shopfloor_jobs: 0,
            last_throughput_snapshot_at: 0.0,
            last_throughput_snapshot_jobs_done: 0,
            current_hourly_throughput: 0,
            job_processing_end: sched.event(),
            job_finished: sched.event(),
        }
    }

    pub fn set_wip_strategy(&mut self, strategy: WipStrategy) {
        self.wip_strategy = strategy;
    }

    pub fn total_wip(&self) -> f64 {
        self.wip.values().sum()
    }

    pub fn average_time_in_system(&self) -> f64 {
        if self.jobs_done.is_empty() {
            0.0
        } else {
            self.total_time_in_system / self.jobs_done.len() as f64
        }
    }

    fn signal_end_processing(&mut self, sched: &mut Scheduler, job: JobId) {
        let event = self.job_processing_end;
        sched.succeed(event, Payload::Raw(job.to_raw()));
        self.job_processing_end = sched.event();
    }

    fn signal_job_finished(&mut self, sched: &mut Scheduler, job: JobId) {
        let event = self.job_finished;
        sched.succeed(event, Payload::Raw(job.to_raw()));
        self.job_finished = sched.event();
    }

    fn update_throughput_snapshot(&mut self, now: SimTime) {
        if now - self.last_throughput_snapshot_at >= THROUGHPUT_WINDOW {
            let done_now = self.jobs_done.len();
            self.current_hourly_throughput = done_now - self.last_throughput_snapshot_jobs_done;
            self.last_throughput_snapshot_at = now;
            self.last_throughput_snapshot_jobs_done = done_now;
        }
    }
}

/// Add a job to the shopfloor: commit its workload to the WIP map and start
/// its main task.
pub fn add(sim: &mut Sim, job_id: JobId) {
    let now = sim.sched.now();
    {
        let World { shopfloor, jobs, .. } = &mut sim.world;
        let job = &mut jobs[job_id];
        for &(server, _) in &job.routing {
            if !shopfloor.wip.contains_key(server) {
                shopfloor.wip.insert(server, 0.0);
            }
        }
        match shopfloor.wip_strategy {
            WipStrategy::Standard => {
                for &(server, processing) in &job.routing {
                    shopfloor.wip[server] += processing;
                }
            }
            WipStrategy::Corrected => {
                for (position, &(server, processing)) in job.routing.iter().enumerate() {
                    shopfloor.wip[server] += processing / (position + 1) as f64;
                }
            }
        }
        job.psp_exit_at = Some(now);
        shopfloor.jobs.push(job_id);
        shopfloor.maximum_shopfloor_jobs = shopfloor.maximum_shopfloor_jobs.max(shopfloor.jobs.len());
        shopfloor.maximum_wip_value = shopfloor.maximum_wip_value.max(shopfloor.total_wip());
    }
    #[cfg(feature = "instrument")]
    tracing::info!(
        target: "job_released",
        sim_time = now,
        job = job_id.to_raw(),
    );
    sim.sched.spawn(Box::new(JobTask { job: job_id, op: 0, request: None, state: JobState::Init }));
}

// ============================================================================
// Per-job main task
// ============================================================================

enum JobState {
    Init,
    /// Waiting for the server grant of the current operation.
    Acquire,
    /// Holding the server; waiting for the processing timeout (or a
    /// breakdown on faulty servers).
    Process { started: SimTime, remaining: f64 },
    /// Waiting out a repair before resuming with the remaining time.
    Repair { remaining: f64 },
}

/// Runs one job through its routing: for each operation, acquire the
/// server, process, release, update WIP, and emit the processing-end
/// signal; on routing completion update the shopfloor KPIs.
pub struct JobTask {
    job: JobId,
    op: usize,
    request: Option<RequestId>,
    state: JobState,
}

impl JobTask {
    fn start_op(&mut self, sim: &mut Sim) -> Step {
        let task = sim.sched.current_task().expect("job task is running");
        let Sim { sched, world, .. } = sim;
        let (server_id, _) = world.jobs[self.job].routing[self.op];
        let World { servers, jobs, .. } = world;
        let server = &mut servers[server_id];
        let job = &mut jobs[self.job];
        let (request, granted) = server.request_for_job(sched, self.job, job, self.op, true, task);
        self.request = Some(request);
        self.state = JobState::Acquire;
        Step::Wait(granted)
    }

    fn begin_processing(&mut self, sim: &mut Sim, remaining: f64) -> Step {
        let Sim { sched, world, .. } = sim;
        let (server_id, _) = world.jobs[self.job].routing[self.op];
        let server = &mut world.servers[server_id];
        server.note_queue_change(sched.now());
        server.note_utilization(sched.now());
        if let Some(history) = &mut server.processed_jobs {
            if !history.contains(&self.job) {
                history.push(self.job);
            }
        }
        self.state = JobState::Process { started: sched.now(), remaining };
        let processing_done = sched.timeout(remaining);
        let wait = match &server.kind {
            ServerKind::Faulty(faulty) => {
                let breakdown = faulty.breakdown_event;
                sched.any_of(&[processing_done, breakdown])
            }
            _ => processing_done,
        };
        Step::Wait(wait)
    }

    fn handle_breakdown(&mut self, sim: &mut Sim, started: SimTime, remaining: f64) -> Step {
        let Sim { sched, world, .. } = sim;
        let (server_id, _) = world.jobs[self.job].routing[self.op];
        let elapsed = sched.now() - started;
        let left = (remaining - elapsed).max(0.0);
        let ServerKind::Faulty(faulty) = &mut world.servers[server_id].kind else {
            // A stray breakdown payload on a non-faulty server: treat the
            // operation as complete.
            return self.complete_op(sim);
        };
        let repair = (faulty.repair_time)().max(0.0);
        faulty.breakdown_time += repair;
        self.state = JobState::Repair { remaining: left };
        Step::Wait(sched.timeout(repair))
    }

    fn resume_after_repair(&mut self, sim: &mut Sim, remaining: f64) -> Step {
        {
            let Sim { sched, world, .. } = sim;
            let (server_id, _) = world.jobs[self.job].routing[self.op];
            if let ServerKind::Faulty(faulty) = &mut world.servers[server_id].kind {
                // The spent breakdown event is replaced once the repair is
                // over, arming the next failure.
                if !sched.event_exists(faulty.breakdown_event) {
                    faulty.breakdown_event = sched.event();
                }
            }
        }
        self.begin_processing(sim, remaining)
    }

    fn complete_op(&mut self, sim: &mut Sim) -> Step {
        let routing_len;
        {
            let Sim { sched, world, .. } = sim;
            let World { servers, jobs, shopfloor, .. } = world;
            let job = &mut jobs[self.job];
            routing_len = job.routing.len();
            let (server_id, processing) = job.routing[self.op];
            let server = &mut servers[server_id];
            server.worked_time += processing;

            if let Some(request) = self.request.take() {
                server.release_for_job(sched, request, job, self.op);
            }

            shopfloor.wip[server_id] -= processing;
            if shopfloor.wip_strategy == WipStrategy::Corrected {
                // Residual downstream work moves one position closer.
                let remaining: Vec<(ServerId, f64)> =
                    job.remaining_routing().map(|(_, server, processing)| (server, processing)).collect();
                for (position, (downstream, processing)) in remaining.into_iter().enumerate() {
                    shopfloor.wip[downstream] -= processing / (position + 2) as f64;
                    shopfloor.wip[downstream] += processing / (position + 1) as f64;
                }
            }

            if let ServerKind::Inspection { rework_hook, rework_count } = &mut server.kind {
                if job.rework {
                    job.rework = false;
                    *rework_count += 1;
                    if let Some(hook) = rework_hook {
                        hook(job);
                    }
                }
            }

            #[cfg(feature = "instrument")]
            tracing::info!(
                target: "job_processing_end",
                sim_time = sched.now(),
                job = self.job.to_raw(),
                server = server_id.to_raw(),
            );
            shopfloor.signal_end_processing(sched, self.job);
        }

        self.op += 1;
        if self.op < routing_len { self.start_op(sim) } else { self.finish(sim) }
    }

    fn finish(&mut self, sim: &mut Sim) -> Step {
        let Sim { sched, world, .. } = sim;
        let now = sched.now();
        let World { jobs, shopfloor, .. } = world;
        let job = &mut jobs[self.job];
        job.finished_at = Some(now);
        job.done = true;

        shopfloor.jobs.retain(|&active| active != self.job);
        shopfloor.jobs_done.push(self.job);
        if let Some(time_in_system) = job.time_in_shopfloor() {
            shopfloor.total_time_in_system += time_in_system;
        }
        shopfloor.update_throughput_snapshot(now);

        let alpha = shopfloor.ema_alpha;
        let in_window = job.finished_in_window(DUE_DATE_WINDOW).unwrap_or(false);
        let lateness = job.lateness().unwrap_or(0.0);
        let indicator = |condition: bool| if condition { 1.0 } else { 0.0 };
        ema(&mut shopfloor.ema_makespan, alpha, job.makespan(now));
        ema(&mut shopfloor.ema_tardy_jobs, alpha, indicator(!in_window && lateness > 0.0));
        ema(&mut shopfloor.ema_early_jobs, alpha, indicator(!in_window && lateness < 0.0));
        ema(&mut shopfloor.ema_in_window_jobs, alpha, indicator(in_window));
        if let Some(time_in_psp) = job.time_in_psp() {
            ema(&mut shopfloor.ema_time_in_psp, alpha, time_in_psp);
        }
        if let Some(time_in_shopfloor) = job.time_in_shopfloor() {
            ema(&mut shopfloor.ema_time_in_shopfloor, alpha, time_in_shopfloor);
        }
        if let Some(queue_time) = job.total_queue_time() {
            ema(&mut shopfloor.ema_total_queue_time, alpha, queue_time);
        }

        #[cfg(feature = "instrument")]
        tracing::info!(
            target: "job_finished",
            sim_time = now,
            job = self.job.to_raw(),
            makespan = job.makespan(now),
        );
        shopfloor.signal_job_finished(sched, self.job);
        Step::Done
    }
}

impl Process for JobTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        match input {
            Resume::Failed(error) => Step::Failed(error),
            Resume::Interrupted => {
                // Preempted: the grant is gone; re-enter the queue for the
                // current operation with its full service time.
                self.request = None;
                self.start_op(sim)
            }
            Resume::Started => self.start_op(sim),
            Resume::Fired(payload) => match self.state {
                JobState::Init => self.start_op(sim),
                JobState::Acquire => {
                    let (_, processing) = sim.world.jobs[self.job].routing[self.op];
                    self.begin_processing(sim, processing)
                }
                JobState::Process { started, remaining } => match payload {
                    Payload::Time(_) => self.complete_op(sim),
                    _ => self.handle_breakdown(sim, started, remaining),
                },
                JobState::Repair { remaining } => self.resume_after_repair(sim, remaining),
            },
        }
    }
}

// ============================================================================
// Faulty-server breakdown generator
// ============================================================================

/// Succeeds the server's breakdown event at sampled intervals. A breakdown
/// whose event has already been consumed (machine still under repair) is
/// skipped, matching the time-between-failures contract.
pub struct BreakdownTask {
    pub server: ServerId,
}

impl Process for BreakdownTask {
    fn resume(&mut self, sim: &mut Sim, input: Resume) -> Step {
        let Sim { sched, world, .. } = sim;
        let Some(server) = world.servers.get_mut(self.server) else {
            return Step::Done;
        };
        let ServerKind::Faulty(faulty) = &mut server.kind else {
            return Step::Done;
        };
        if !matches!(input, Resume::Started) && sched.event_exists(faulty.breakdown_event) {
            faulty.breakdowns += 1;
            let event = faulty.breakdown_event;
            sched.succeed(event, Payload::None);
            #[cfg(feature = "instrument")]
            tracing::info!(
                target: "server_breakdown",
                sim_time = sched.now(),
                server = self.server.to_raw(),
            );
        }
        let next_failure = (faulty.time_between_failures)().max(0.0);
        Step::Wait(sched.timeout(next_failure))
    }
}
