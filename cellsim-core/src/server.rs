//! Servers: capacity-N workstations with queue and utilization tracking.

use std::collections::BTreeMap;

use crate::jobs::Job;
use crate::kernel::{EventKey, Scheduler, TaskKey};
use crate::resources::{PrioritySemaphore, RequestId};
use crate::types::{History, JobId, RawKey, SimTime};

/// Sampling closure for breakdown and repair intervals.
pub type Distribution = Box<dyn FnMut() -> f64>;

/// Server behavior variants.
pub enum ServerKind {
    Standard,
    /// Breaks down at sampled intervals; repairs consume a sampled delay
    /// before processing resumes with the remaining service time.
    Faulty(FaultyState),
    /// After normal processing, a job flagged for rework goes through the
    /// hook and the flag clears.
    Inspection { rework_hook: Option<Box<dyn FnMut(&mut Job)>>, rework_count: u32 },
}

pub struct FaultyState {
    pub time_between_failures: Distribution,
    pub repair_time: Distribution,
    /// Succeeded by the breakdown task; replaced after each repair.
    pub breakdown_event: EventKey,
    pub breakdowns: u32,
    pub breakdown_time: f64,
}

/// A workstation: a priority semaphore plus bookkeeping.
pub struct Server {
    pub name: String,
    pub sem: PrioritySemaphore,
    pub kind: ServerKind,
    pub worked_time: f64,

    /// Occupancy histogram: queue length -> accumulated time at it.
    queue_history: BTreeMap<usize, f64>,
    last_queue_level: usize,
    last_queue_level_at: SimTime,
    /// Q(t): queue length over time.
    pub qt: History<usize>,
    /// U(t): busy/idle steps over time.
    pub ut: History<u8>,
    /// Jobs processed here, when history retention is on.
    pub processed_jobs: Option<Vec<JobId>>,
}

impl Server {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            sem: PrioritySemaphore::new(capacity),
            kind: ServerKind::Standard,
            worked_time: 0.0,
            queue_history: BTreeMap::new(),
            last_queue_level: 0,
            last_queue_level_at: 0.0,
            qt: Vec::new(),
            ut: vec![(0.0, 0)],
            processed_jobs: None,
        }
    }

    pub fn retain_job_history(mut self) -> Self {
        self.processed_jobs = Some(Vec::new());
        self
    }

    pub fn faulty(
        mut self,
        sched: &mut Scheduler,
        time_between_failures: Distribution,
        repair_time: Distribution,
    ) -> Self {
        self.kind = ServerKind::Faulty(FaultyState {
            time_between_failures,
            repair_time,
            breakdown_event: sched.event(),
            breakdowns: 0,
            breakdown_time: 0.0,
        });
        self
    }

    pub fn inspection(mut self, rework_hook: Box<dyn FnMut(&mut Job)>) -> Self {
        self.kind = ServerKind::Inspection { rework_hook: Some(rework_hook), rework_count: 0 };
        self
    }

    /// True when no request is queued.
    pub fn empty(&self) -> bool {
        self.sem.empty()
    }

    pub fn queue_len(&self) -> usize {
        self.sem.queue_len()
    }

    /// Jobs currently waiting in the queue, in queue order.
    pub fn queueing_jobs(&self) -> impl Iterator<Item = JobId> + '_ {
        self.sem.queued_tags().map(JobId::from_raw)
    }

    /// Time-weighted average queue length since the start of the run.
    pub fn average_queue_length(&self, now: SimTime) -> f64 {
        if now <= 0.0 {
            return 0.0;
        }
        let mut weighted: f64 =
            self.queue_history.iter().map(|(len, time)| *len as f64 * time).sum();
        // Account for the still-open interval at the current level.
        weighted += self.last_queue_level as f64 * (now - self.last_queue_level_at);
        weighted / now
    }

    pub fn utilization_rate(&self, now: SimTime) -> f64 {
        if now <= 0.0 { 0.0 } else { self.worked_time / now }
    }

    pub fn idle_time(&self, now: SimTime) -> f64 {
        now - self.worked_time
    }

    /// Close the occupancy interval at the previous level and open one at
    /// the current queue length. Call on every queue change.
    pub fn note_queue_change(&mut self, now: SimTime) {
        *self.queue_history.entry(self.last_queue_level).or_insert(0.0) +=
            now - self.last_queue_level_at;
        self.last_queue_level_at = now;
        self.last_queue_level = self.sem.queue_len();
        self.qt.push((now, self.last_queue_level));
    }

    /// Record a busy/idle step if the state changed.
    pub fn note_utilization(&mut self, now: SimTime) {
        let busy = u8::from(self.sem.count() >= 1 || self.sem.queue_len() > 0);
        if self.ut.last().is_some_and(|(_, last)| *last == busy) {
            return;
        }
        self.ut.push((now, busy));
    }

    /// Enqueue a priority request for a job. Records the job's entry
    /// timestamp for this operation; the caller yields on the returned
    /// event.
    pub fn request_for_job(
        &mut self,
        sched: &mut Scheduler,
        job_id: JobId,
        job: &mut Job,
        op_index: usize,
        preempt: bool,
        task: TaskKey,
    ) -> (RequestId, EventKey) {
        let (server_id, _) = job.routing[op_index];
        let priority = job.priority(server_id, sched.now());
        job.entry_at[op_index] = Some(sched.now());
        let granted = self.sem.request(sched, priority, preempt, task, job_id.to_raw());
        self.note_queue_change(sched.now());
        self.note_utilization(sched.now());
        granted
    }

    /// Release a granted request, recording the job's exit timestamp.
    pub fn release_for_job(
        &mut self,
        sched: &mut Scheduler,
        request: RequestId,
        job: &mut Job,
        op_index: usize,
    ) {
        job.exit_at[op_index] = Some(sched.now());
        self.sem.release(sched, request);
        self.note_queue_change(sched.now());
        self.note_utilization(sched.now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_histogram_tracks_time_at_each_level() {
        let mut sched = Scheduler::new();
        let mut server = Server::new("s", 1);

        // Two requests at t=0: one grants, one queues.
        server.sem.request(&mut sched, 0.0, false, Default::default(), 1);
        server.sem.request(&mut sched, 0.0, false, Default::default(), 2);
        server.note_queue_change(0.0);
        assert_eq!(server.queue_len(), 1);
        // Average over [0, 10) with one queued request the whole time.
        assert!((server.average_queue_length(10.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn utilization_derives_from_worked_time() {
        let mut server = Server::new("s", 1);
        server.worked_time = 5.0;
        assert_eq!(server.utilization_rate(10.0), 0.5);
        assert_eq!(server.idle_time(10.0), 5.0);
        assert_eq!(server.utilization_rate(0.0), 0.0);
    }
}
