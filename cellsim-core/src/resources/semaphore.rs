//! Counting semaphore with priorities and preemption.
//!
//! The only mechanism in the crate for exclusive access to a resource:
//! servers, AGVs, robots, cranes, building points and unload positions are
//! all priority semaphores of some capacity. Mutation of a resource's state
//! is confined to the holder of a slot.

use crate::kernel::{Payload, Scheduler, EventKey, TaskKey};
use crate::types::SimTime;

/// Identifies one request against a specific semaphore, from issue to
/// release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

/// A granted slot.
#[derive(Debug, Clone, Copy)]
pub struct Grant {
    pub request: RequestId,
    pub priority: f64,
    pub task: TaskKey,
    /// Opaque caller tag (usually a raw entity key) for bookkeeping.
    pub tag: u64,
    pub since: SimTime,
}

#[derive(Debug)]
struct Pending {
    id: RequestId,
    priority: f64,
    seq: u64,
    task: TaskKey,
    tag: u64,
    event: EventKey,
}

/// Counting semaphore with integer capacity >= 1 and a wait queue sorted on
/// `(priority, request_time)`. Numerically smaller priorities are more
/// urgent; equal priorities are first-come-first-served.
#[derive(Debug)]
pub struct PrioritySemaphore {
    capacity: usize,
    seq: u64,
    users: Vec<Grant>,
    queue: Vec<Pending>,
}

impl PrioritySemaphore {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "semaphore capacity must be >= 1");
        Self { capacity, seq: 0, users: Vec::new(), queue: Vec::new() }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of granted slots.
    pub fn count(&self) -> usize {
        self.users.len()
    }

    /// Number of requests still waiting.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// True when no request is waiting.
    pub fn empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn users(&self) -> &[Grant] {
        &self.users
    }

    /// Tags of the queued requests, in queue order.
    pub fn queued_tags(&self) -> impl Iterator<Item = u64> + '_ {
        self.queue.iter().map(|pending| pending.tag)
    }

    /// Request a slot. The returned event fires when the slot is granted;
    /// the calling task must yield on it before touching the resource.
    ///
    /// With `preempt`, a holder whose priority is numerically larger than
    /// the requester's is interrupted (its task is resumed with a preempted
    /// signal) and the requester takes the slot at once.
    pub fn request(
        &mut self,
        sched: &mut Scheduler,
        priority: f64,
        preempt: bool,
        task: TaskKey,
        tag: u64,
    ) -> (RequestId, EventKey) {
        let id = RequestId(self.seq);
        let seq = self.seq;
        self.seq += 1;
        let event = sched.event();

        if self.users.len() < self.capacity {
            self.users.push(Grant { request: id, priority, task, tag, since: sched.now() });
            sched.succeed(event, Payload::None);
            return (id, event);
        }

        if preempt {
            // Victim: the least urgent holder, latest grant breaking ties.
            let victim = self
                .users
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.priority.total_cmp(&b.priority).then(a.since.total_cmp(&b.since))
                })
                .map(|(idx, grant)| (idx, grant.priority));
            if let Some((idx, victim_priority)) = victim {
                if victim_priority > priority {
                    let evicted = self.users.swap_remove(idx);
                    sched.interrupt(evicted.task);
                    self.users.push(Grant { request: id, priority, task, tag, since: sched.now() });
                    sched.succeed(event, Payload::None);
                    return (id, event);
                }
            }
        }

        let position = self
            .queue
            .iter()
            .position(|pending| pending.priority.total_cmp(&priority).is_gt())
            .unwrap_or(self.queue.len());
        self.queue.insert(position, Pending { id, priority, seq, task, tag, event });
        (id, event)
    }

    /// Free a slot and promote the head of the wait queue, if any. Releasing
    /// a request that was preempted away is a no-op and returns `false`.
    pub fn release(&mut self, sched: &mut Scheduler, request: RequestId) -> bool {
        let Some(idx) = self.users.iter().position(|grant| grant.request == request) else {
            return false;
        };
        self.users.remove(idx);
        if self.users.len() < self.capacity {
            if let Some(next) = (!self.queue.is_empty()).then(|| self.queue.remove(0)) {
                self.users.push(Grant {
                    request: next.id,
                    priority: next.priority,
                    task: next.task,
                    tag: next.tag,
                    since: sched.now(),
                });
                sched.succeed(next.event, Payload::None);
            }
        }
        true
    }

    /// Withdraw a request that is still queued.
    pub fn cancel(&mut self, request: RequestId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|pending| pending.id != request);
        self.queue.len() != before
    }

    /// Whether the request currently holds a slot.
    pub fn holds(&self, request: RequestId) -> bool {
        self.users.iter().any(|grant| grant.request == request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskKey {
        TaskKey::default()
    }

    #[test]
    fn grants_up_to_capacity_then_queues() {
        let mut sched = Scheduler::new();
        let mut sem = PrioritySemaphore::new(2);
        let (a, _) = sem.request(&mut sched, 0.0, false, task(), 1);
        let (b, _) = sem.request(&mut sched, 0.0, false, task(), 2);
        let (c, _) = sem.request(&mut sched, 0.0, false, task(), 3);
        assert!(sem.holds(a));
        assert!(sem.holds(b));
        assert!(!sem.holds(c));
        assert_eq!(sem.queue_len(), 1);
        assert!(!sem.empty());
    }

    #[test]
    fn equal_priorities_are_fifo_and_release_promotes_in_order() {
        let mut sched = Scheduler::new();
        let mut sem = PrioritySemaphore::new(1);
        let (first, _) = sem.request(&mut sched, 1.0, false, task(), 10);
        let (_, _) = sem.request(&mut sched, 1.0, false, task(), 20);
        let (_, _) = sem.request(&mut sched, 1.0, false, task(), 30);
        assert_eq!(sem.queued_tags().collect::<Vec<_>>(), vec![20, 30]);
        sem.release(&mut sched, first);
        assert_eq!(sem.users()[0].tag, 20);
        assert_eq!(sem.queued_tags().collect::<Vec<_>>(), vec![30]);
    }

    #[test]
    fn more_urgent_request_overtakes_the_queue() {
        let mut sched = Scheduler::new();
        let mut sem = PrioritySemaphore::new(1);
        let (holder, _) = sem.request(&mut sched, 0.0, false, task(), 1);
        sem.request(&mut sched, 5.0, false, task(), 2);
        sem.request(&mut sched, 2.0, false, task(), 3);
        assert_eq!(sem.queued_tags().collect::<Vec<_>>(), vec![3, 2]);
        sem.release(&mut sched, holder);
        assert_eq!(sem.users()[0].tag, 3);
    }

    #[test]
    fn preempt_evicts_the_least_urgent_holder() {
        let mut sched = Scheduler::new();
        let mut sem = PrioritySemaphore::new(1);
        let (victim, _) = sem.request(&mut sched, 5.0, false, task(), 1);
        let (urgent, _) = sem.request(&mut sched, 0.0, true, task(), 2);
        assert!(!sem.holds(victim));
        assert!(sem.holds(urgent));
        // Releasing the evicted request must be a no-op.
        assert!(!sem.release(&mut sched, victim));
    }

    #[test]
    fn preempt_does_not_evict_an_equally_urgent_holder() {
        let mut sched = Scheduler::new();
        let mut sem = PrioritySemaphore::new(1);
        let (holder, _) = sem.request(&mut sched, 1.0, true, task(), 1);
        let (second, _) = sem.request(&mut sched, 1.0, true, task(), 2);
        assert!(sem.holds(holder));
        assert!(!sem.holds(second));
        assert_eq!(sem.queue_len(), 1);
    }
}
