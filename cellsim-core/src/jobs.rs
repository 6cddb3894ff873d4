//! Jobs flowing through the shopfloor.

use serde::{Deserialize, Serialize};

use crate::types::{LocationId, ProductId, ServerId, SimTime};

/// What a job is for. Production jobs run a routing of servers; transport
/// and warehouse jobs reuse the same timing machinery with a single
/// operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobKind {
    Production,
    Transport { origin: LocationId, destination: LocationId },
    Warehouse { product: ProductId, n_cases: u32, op: WarehouseOp },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarehouseOp {
    Pick,
    Put,
}

/// How a job's priority key at a server queue is computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum QueuePriority {
    /// Everyone equal; arrival order decides.
    Fifo,
    /// Remaining slack to the due date, minus remaining processing.
    SlackTime,
    /// Planned slack time at the requested server.
    PlannedSlack { allowance: f64 },
}

/// A job: an ordered routing of `(server, processing_time)` operations, a
/// due date, and complete timing bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub kind: JobKind,
    pub family: String,
    pub routing: Vec<(ServerId, f64)>,
    pub due_date: SimTime,
    pub priority_policy: QueuePriority,

    pub created_at: SimTime,
    pub psp_exit_at: Option<SimTime>,
    pub finished_at: Option<SimTime>,
    /// Entry timestamp per routing operation, set when the server request
    /// is issued.
    pub entry_at: Vec<Option<SimTime>>,
    /// Exit timestamp per routing operation, set on release.
    pub exit_at: Vec<Option<SimTime>>,

    pub rework: bool,
    pub done: bool,
    /// How many times a release policy looked at this job while pooled.
    pub release_evaluations: u32,
}

impl Job {
    pub fn production(
        family: impl Into<String>,
        routing: Vec<(ServerId, f64)>,
        due_date: SimTime,
        created_at: SimTime,
    ) -> Self {
        let ops = routing.len();
        Self {
            kind: JobKind::Production,
            family: family.into(),
            routing,
            due_date,
            priority_policy: QueuePriority::Fifo,
            created_at,
            psp_exit_at: None,
            finished_at: None,
            entry_at: vec![None; ops],
            exit_at: vec![None; ops],
            rework: false,
            done: false,
            release_evaluations: 0,
        }
    }

    pub fn with_priority(mut self, priority_policy: QueuePriority) -> Self {
        self.priority_policy = priority_policy;
        self
    }

    pub fn total_processing(&self) -> f64 {
        self.routing.iter().map(|(_, p)| p).sum()
    }

    /// Routing index of `server`, if it appears in the routing.
    pub fn op_index(&self, server: ServerId) -> Option<usize> {
        self.routing.iter().position(|(s, _)| *s == server)
    }

    pub fn starts_at(&self, server: ServerId) -> bool {
        self.routing.first().is_some_and(|(s, _)| *s == server)
    }

    /// Operations not yet entered, in routing order.
    pub fn remaining_routing(&self) -> impl Iterator<Item = (usize, ServerId, f64)> + '_ {
        self.routing
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.entry_at[*idx].is_none())
            .map(|(idx, (server, processing))| (idx, *server, *processing))
    }

    /// Last server this job exited, if any.
    pub fn previous_server(&self) -> Option<ServerId> {
        self.routing
            .iter()
            .enumerate()
            .rev()
            .find(|(idx, _)| self.exit_at[*idx].is_some())
            .map(|(_, (server, _))| *server)
    }

    /// Next server to visit: the first not yet entered.
    pub fn next_server(&self) -> Option<ServerId> {
        self.remaining_routing().next().map(|(_, server, _)| server)
    }

    pub fn is_in_psp(&self) -> bool {
        self.psp_exit_at.is_none()
    }

    pub fn makespan(&self, now: SimTime) -> f64 {
        self.finished_at.unwrap_or(now) - self.created_at
    }

    pub fn slack_time(&self, now: SimTime) -> f64 {
        self.due_date - now
    }

    pub fn lateness(&self) -> Option<f64> {
        self.finished_at.map(|finished| finished - self.due_date)
    }

    pub fn is_late(&self, now: SimTime) -> bool {
        match self.finished_at {
            Some(finished) => finished > self.due_date,
            None => now > self.due_date,
        }
    }

    pub fn time_in_psp(&self) -> Option<f64> {
        self.psp_exit_at.map(|exit| exit - self.created_at)
    }

    /// Time between entering the first server queue and exiting the last.
    pub fn time_in_shopfloor(&self) -> Option<f64> {
        let first = self.entry_at.first().copied().flatten()?;
        let last = self.exit_at.last().copied().flatten()?;
        self.done.then_some(last - first)
    }

    /// Total waiting across the routing: queue time that is not processing.
    pub fn total_queue_time(&self) -> Option<f64> {
        if !self.done {
            return None;
        }
        let mut total = 0.0;
        for (idx, (_, processing)) in self.routing.iter().enumerate() {
            let entry = self.entry_at[idx]?;
            let exit = self.exit_at[idx]?;
            total += exit - entry - processing;
        }
        Some(total)
    }

    pub fn finished_in_window(&self, window: f64) -> Option<bool> {
        self.finished_at
            .map(|finished| self.due_date - window <= finished && finished <= self.due_date + window)
    }

    /// Due date minus total processing, with a per-operation allowance.
    pub fn planned_release_date(&self, allowance: f64) -> SimTime {
        self.due_date - (self.total_processing() + self.routing.len() as f64 * allowance)
    }

    /// Planned slack time per routing operation, computed from the end of
    /// the routing backwards. `None` once the job has exited that server.
    pub fn planned_slack_times(&self, allowance: f64, now: SimTime) -> Vec<Option<f64>> {
        let mut slack = self.slack_time(now);
        let mut times = vec![None; self.routing.len()];
        for (idx, (_, processing)) in self.routing.iter().enumerate().rev() {
            slack -= processing + allowance;
            times[idx] = Some(slack);
        }
        for (idx, exit) in self.exit_at.iter().enumerate() {
            if exit.is_some() {
                times[idx] = None;
            }
        }
        times
    }

    /// Planned slack at one server; `None` when the server is not in the
    /// routing or already exited.
    pub fn planned_slack_at(&self, server: ServerId, allowance: f64, now: SimTime) -> Option<f64> {
        let idx = self.op_index(server)?;
        self.planned_slack_times(allowance, now)[idx]
    }

    /// Priority key for a server queue request; smaller is more urgent.
    pub fn priority(&self, server: ServerId, now: SimTime) -> f64 {
        match self.priority_policy {
            QueuePriority::Fifo => 0.0,
            QueuePriority::SlackTime => self.slack_time(now) - self.total_processing(),
            QueuePriority::PlannedSlack { allowance } => {
                self.planned_slack_at(server, allowance, now).unwrap_or(0.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn servers(n: usize) -> Vec<ServerId> {
        let mut arena: SlotMap<ServerId, ()> = SlotMap::with_key();
        (0..n).map(|_| arena.insert(())).collect()
    }

    #[test]
    fn planned_release_date_subtracts_processing_and_allowance() {
        let s = servers(2);
        let job = Job::production("a", vec![(s[0], 3.0), (s[1], 4.0)], 100.0, 0.0);
        // 100 - (7 + 2 * 2) = 89
        assert_eq!(job.planned_release_date(2.0), 89.0);
    }

    #[test]
    fn planned_slack_times_accumulate_backwards() {
        let s = servers(2);
        let job = Job::production("a", vec![(s[0], 3.0), (s[1], 4.0)], 20.0, 0.0);
        let pst = job.planned_slack_times(1.0, 0.0);
        // slack = 20; last op: 20 - 5 = 15; first op: 15 - 4 = 11
        assert_eq!(pst, vec![Some(11.0), Some(15.0)]);
    }

    #[test]
    fn planned_slack_is_none_after_exit() {
        let s = servers(2);
        let mut job = Job::production("a", vec![(s[0], 3.0), (s[1], 4.0)], 20.0, 0.0);
        job.entry_at[0] = Some(0.0);
        job.exit_at[0] = Some(3.0);
        let pst = job.planned_slack_times(0.0, 3.0);
        assert_eq!(pst[0], None);
        assert!(pst[1].is_some());
        assert_eq!(job.previous_server(), Some(s[0]));
        assert_eq!(job.next_server(), Some(s[1]));
    }

    #[test]
    fn queue_time_excludes_processing() {
        let s = servers(1);
        let mut job = Job::production("a", vec![(s[0], 5.0)], 10.0, 0.0);
        job.entry_at[0] = Some(2.0);
        job.exit_at[0] = Some(9.0);
        job.done = true;
        job.finished_at = Some(9.0);
        assert_eq!(job.total_queue_time(), Some(2.0));
        assert_eq!(job.makespan(9.0), 9.0);
    }
}
