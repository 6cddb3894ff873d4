//! Ordered areas with capacity, history and positions.

use crate::errors::SimError;
use crate::resources::{PrioritySemaphore, RequestId};
use crate::types::{History, SimTime};

/// An ordered container modeling a logical region of a picking cell.
/// Appends past capacity fail unless the explicit exceed bypass is used;
/// every mutation records a `(time, size)` sample.
pub struct Area<T> {
    pub name: &'static str,
    pub capacity: usize,
    items: Vec<T>,
    pub history: History<usize>,
    pub last_in: Option<T>,
    pub last_out: Option<T>,
}

impl<T: Copy + PartialEq> Area<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self { name, capacity, items: Vec::new(), history: Vec::new(), last_in: None, last_out: None }
    }

    pub fn unbounded(name: &'static str) -> Self {
        Self::new(name, usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.items.len())
    }

    pub fn contains(&self, item: T) -> bool {
        self.items.contains(&item)
    }

    pub fn first(&self) -> Option<T> {
        self.items.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.items.iter().copied()
    }

    /// Append within capacity; a full area refuses and stays unchanged.
    pub fn append(&mut self, item: T, now: SimTime) -> Result<(), SimError> {
        if self.is_full() {
            return Err(SimError::CapacityExceeded {
                name: self.name.to_string(),
                capacity: self.capacity,
                at: now,
            });
        }
        self.push(item, now);
        Ok(())
    }

    /// Append bypassing the capacity check. Reserved for registering an
    /// already-committed feeding operation with its feeding area.
    pub fn append_exceed(&mut self, item: T, now: SimTime) {
        self.push(item, now);
    }

    fn push(&mut self, item: T, now: SimTime) {
        self.last_in = Some(item);
        self.items.push(item);
        self.history.push((now, self.items.len()));
    }

    /// Remove a specific item; returns whether it was present.
    pub fn remove(&mut self, item: T, now: SimTime) -> bool {
        let Some(idx) = self.items.iter().position(|held| *held == item) else {
            return false;
        };
        self.items.remove(idx);
        self.last_out = Some(item);
        self.history.push((now, self.items.len()));
        true
    }

    pub fn pop(&mut self, now: SimTime) -> Option<T> {
        let item = self.items.pop()?;
        self.last_out = Some(item);
        self.history.push((now, self.items.len()));
        Some(item)
    }
}

/// A physical stop inside the internal area: unload and pre-unload slots
/// are capacity-1 resources AGVs queue on.
pub struct Position {
    pub name: String,
    pub sem: PrioritySemaphore,
}

impl Position {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), sem: PrioritySemaphore::new(1) }
    }

    /// Free when nothing holds or waits on the slot.
    pub fn free(&self) -> bool {
        self.sem.count() == 0 && self.sem.queue_len() == 0
    }

    pub fn release(&mut self, sched: &mut crate::kernel::Scheduler, request: RequestId) {
        self.sem.release(sched, request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_past_capacity_fails_and_leaves_area_unchanged() {
        let mut area: Area<u64> = Area::new("staging", 2);
        area.append(1, 0.0).unwrap();
        area.append(2, 1.0).unwrap();
        let err = area.append(3, 2.0).unwrap_err();
        assert!(matches!(err, SimError::CapacityExceeded { .. }));
        assert_eq!(area.len(), 2);
        assert!(!area.contains(3));
    }

    #[test]
    fn append_exceed_bypasses_capacity() {
        let mut area: Area<u64> = Area::new("feeding", 1);
        area.append(1, 0.0).unwrap();
        area.append_exceed(2, 1.0);
        assert_eq!(area.len(), 2);
        assert_eq!(area.last_in, Some(2));
    }

    #[test]
    fn history_records_every_mutation() {
        let mut area: Area<u64> = Area::unbounded("internal");
        area.append(1, 0.0).unwrap();
        area.append(2, 1.0).unwrap();
        area.remove(1, 2.0);
        assert_eq!(area.history, vec![(0.0, 1), (1.0, 2), (2.0, 1)]);
        assert_eq!(area.last_out, Some(1));
    }
}
