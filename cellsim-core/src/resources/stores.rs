//! Blocking stores: FIFO, filtered, bulk, sequential and keyed.
//!
//! Each store pairs a container with a put side and a get side, both
//! expressed as events. Direct mutation of the item lists from outside is a
//! bug; callers go through `put`/`get` and yield on the returned event.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use crate::errors::SimError;
use crate::kernel::{EventKey, Payload, Scheduler};
use crate::types::RawKey;

type Filter<T> = Box<dyn Fn(&T) -> bool>;

// ============================================================================
// Store - plain bounded FIFO
// ============================================================================

/// FIFO of items. `put` blocks while the store is at capacity, `get` blocks
/// while it is empty.
pub struct Store<T> {
    capacity: usize,
    items: VecDeque<T>,
    put_queue: VecDeque<(EventKey, T)>,
    get_queue: VecDeque<EventKey>,
}

impl<T: RawKey> Default for Store<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T: RawKey> Store<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "store capacity must be >= 1");
        Self {
            capacity,
            items: VecDeque::new(),
            put_queue: VecDeque::new(),
            get_queue: VecDeque::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items currently held.
    pub fn level(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn put(&mut self, sched: &mut Scheduler, item: T) -> EventKey {
        let event = sched.event();
        self.put_queue.push_back((event, item));
        self.pump(sched);
        event
    }

    pub fn get(&mut self, sched: &mut Scheduler) -> EventKey {
        let event = sched.event();
        self.get_queue.push_back(event);
        self.pump(sched);
        event
    }

    fn pump(&mut self, sched: &mut Scheduler) {
        loop {
            let mut progressed = false;
            while self.items.len() < self.capacity {
                let Some((event, item)) = self.put_queue.pop_front() else {
                    break;
                };
                self.items.push_back(item);
                sched.succeed(event, Payload::None);
                progressed = true;
            }
            while !self.items.is_empty() && !self.get_queue.is_empty() {
                let item = self.items.pop_front().expect("store checked non-empty");
                let event = self.get_queue.pop_front().expect("getter checked present");
                sched.succeed(event, Payload::Raw(item.to_raw()));
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }
}

// ============================================================================
// FilterStore - pop the first item matching a predicate
// ============================================================================

/// Like [`Store`], but `get` takes a predicate and pops the first item for
/// which it holds. Getters are served in request order, each against the
/// oldest matching item.
pub struct FilterStore<T> {
    capacity: usize,
    items: VecDeque<T>,
    put_queue: VecDeque<(EventKey, T)>,
    get_queue: VecDeque<(EventKey, Option<Filter<T>>)>,
}

impl<T: RawKey> Default for FilterStore<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T: RawKey> FilterStore<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "store capacity must be >= 1");
        Self {
            capacity,
            items: VecDeque::new(),
            put_queue: VecDeque::new(),
            get_queue: VecDeque::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn level(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn put(&mut self, sched: &mut Scheduler, item: T) -> EventKey {
        let event = sched.event();
        self.put_queue.push_back((event, item));
        self.pump(sched);
        event
    }

    /// Pop the first item, regardless of content.
    pub fn get_any(&mut self, sched: &mut Scheduler) -> EventKey {
        let event = sched.event();
        self.get_queue.push_back((event, None));
        self.pump(sched);
        event
    }

    /// Pop the first item satisfying `filter`; blocks until one appears.
    pub fn get(&mut self, sched: &mut Scheduler, filter: impl Fn(&T) -> bool + 'static) -> EventKey {
        let event = sched.event();
        self.get_queue.push_back((event, Some(Box::new(filter))));
        self.pump(sched);
        event
    }

    fn pump(&mut self, sched: &mut Scheduler) {
        loop {
            let mut progressed = false;
            while self.items.len() < self.capacity {
                let Some((event, item)) = self.put_queue.pop_front() else {
                    break;
                };
                self.items.push_back(item);
                sched.succeed(event, Payload::None);
                progressed = true;
            }
            let mut waiter = 0;
            while waiter < self.get_queue.len() {
                let matched = {
                    let (_, filter) = &self.get_queue[waiter];
                    self.items
                        .iter()
                        .position(|item| filter.as_ref().is_none_or(|f| f(item)))
                };
                if let Some(idx) = matched {
                    let item = self.items.remove(idx).expect("index from position");
                    let (event, _) = self.get_queue.remove(waiter).expect("waiter present");
                    sched.succeed(event, Payload::Raw(item.to_raw()));
                    progressed = true;
                } else {
                    waiter += 1;
                }
            }
            if !progressed {
                break;
            }
        }
    }
}

// ============================================================================
// MultiStore - atomic bulk put, bulk get
// ============================================================================

/// Store that moves batches. `put` places all its items atomically once
/// capacity permits; `get(n)` returns up to `n` items in FIFO order, but
/// never an empty batch - an empty store blocks the getter.
pub struct MultiStore<T> {
    capacity: usize,
    items: VecDeque<T>,
    put_queue: VecDeque<(EventKey, Vec<T>)>,
    get_queue: VecDeque<(EventKey, usize)>,
}

impl<T: RawKey> Default for MultiStore<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T: RawKey> MultiStore<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "store capacity must be >= 1");
        Self {
            capacity,
            items: VecDeque::new(),
            put_queue: VecDeque::new(),
            get_queue: VecDeque::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn level(&self) -> usize {
        self.items.len()
    }

    pub fn put(&mut self, sched: &mut Scheduler, items: Vec<T>) -> EventKey {
        let event = sched.event();
        self.put_queue.push_back((event, items));
        self.pump(sched);
        event
    }

    pub fn get(&mut self, sched: &mut Scheduler, n: usize) -> EventKey {
        let event = sched.event();
        self.get_queue.push_back((event, n.max(1)));
        self.pump(sched);
        event
    }

    fn pump(&mut self, sched: &mut Scheduler) {
        loop {
            let mut progressed = false;
            while let Some((_, batch)) = self.put_queue.front() {
                if self.items.len() + batch.len() > self.capacity {
                    break;
                }
                let (event, batch) = self.put_queue.pop_front().expect("front checked");
                self.items.extend(batch);
                sched.succeed(event, Payload::None);
                progressed = true;
            }
            while !self.items.is_empty() && !self.get_queue.is_empty() {
                let (event, n) = self.get_queue.pop_front().expect("getter checked present");
                let take = n.min(self.items.len());
                let batch: Vec<u64> = self.items.drain(..take).map(RawKey::to_raw).collect();
                sched.succeed(event, Payload::RawMany(batch));
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }
}

// ============================================================================
// SequentialStore - FIFO where only the head is pickable
// ============================================================================

/// FIFO with the pull-ordering contract: `get(filter)` only ever matches the
/// item at the head. A getter whose filter rejects the current head stays
/// blocked until the head changes. Structured as a head slot of one fed by a
/// backlog holding the remaining capacity.
pub struct SequentialStore<T> {
    capacity: usize,
    head: Option<T>,
    backlog: VecDeque<T>,
    put_queue: VecDeque<(EventKey, T)>,
    get_queue: VecDeque<(EventKey, Option<Filter<T>>)>,
}

impl<T: RawKey> Default for SequentialStore<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T: RawKey> SequentialStore<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "sequential store capacity must be >= 1");
        Self {
            capacity,
            head: None,
            backlog: VecDeque::new(),
            put_queue: VecDeque::new(),
            get_queue: VecDeque::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn level(&self) -> usize {
        usize::from(self.head.is_some()) + self.backlog.len()
    }

    /// Items in pick order, head first.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.head.iter().chain(self.backlog.iter())
    }

    pub fn put(&mut self, sched: &mut Scheduler, item: T) -> EventKey {
        let event = sched.event();
        self.put_queue.push_back((event, item));
        self.pump(sched);
        event
    }

    /// Pop the head once `filter` accepts it.
    pub fn get(&mut self, sched: &mut Scheduler, filter: impl Fn(&T) -> bool + 'static) -> EventKey {
        let event = sched.event();
        self.get_queue.push_back((event, Some(Box::new(filter))));
        self.pump(sched);
        event
    }

    /// Pop the head unconditionally (blocking while empty).
    pub fn get_any(&mut self, sched: &mut Scheduler) -> EventKey {
        let event = sched.event();
        self.get_queue.push_back((event, None));
        self.pump(sched);
        event
    }

    fn pump(&mut self, sched: &mut Scheduler) {
        loop {
            let mut progressed = false;
            // Admit parked puts while there is capacity.
            while self.level() < self.capacity {
                let Some((event, item)) = self.put_queue.pop_front() else {
                    break;
                };
                if self.head.is_none() && self.backlog.is_empty() {
                    self.head = Some(item);
                } else {
                    self.backlog.push_back(item);
                }
                sched.succeed(event, Payload::None);
                progressed = true;
            }
            // Refill the head from the backlog.
            if self.head.is_none() {
                if let Some(next) = self.backlog.pop_front() {
                    self.head = Some(next);
                    progressed = true;
                }
            }
            // Serve getters, oldest first, against the head only.
            if let Some(head) = self.head {
                let matched = self
                    .get_queue
                    .iter()
                    .position(|(_, filter)| filter.as_ref().is_none_or(|f| f(&head)));
                if let Some(idx) = matched {
                    let (event, _) = self.get_queue.remove(idx).expect("index from position");
                    self.head = None;
                    sched.succeed(event, Payload::Raw(head.to_raw()));
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }
}

// ============================================================================
// HashStore - keyed put/get
// ============================================================================

/// Keyed store. `get(k)` blocks until key `k` is present; `get_or_fail`
/// fails the returned event immediately when the key is missing.
pub struct HashStore<K, V> {
    capacity: usize,
    items: HashMap<K, V>,
    waiters: Vec<(K, EventKey)>,
}

impl<K: Eq + Hash + Copy, V: RawKey> Default for HashStore<K, V> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<K: Eq + Hash + Copy, V: RawKey> HashStore<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "store capacity must be >= 1");
        Self { capacity, items: HashMap::new(), waiters: Vec::new() }
    }

    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn level(&self) -> usize {
        self.items.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.items.contains_key(key)
    }

    /// Insert under `key`, waking the oldest getter waiting on it. Putting
    /// past capacity is an error rather than a blocking operation.
    pub fn put(&mut self, sched: &mut Scheduler, key: K, value: V) -> Result<EventKey, SimError> {
        if self.items.len() >= self.capacity && !self.items.contains_key(&key) {
            return Err(SimError::CapacityExceeded {
                name: "hash store".to_string(),
                capacity: self.capacity,
                at: sched.now(),
            });
        }
        self.items.insert(key, value);
        let event = sched.event();
        sched.succeed(event, Payload::None);
        self.pump(sched);
        Ok(event)
    }

    /// Block until `key` is present, then remove and return it.
    pub fn get(&mut self, sched: &mut Scheduler, key: K) -> EventKey {
        let event = sched.event();
        self.waiters.push((key, event));
        self.pump(sched);
        event
    }

    /// Like `get`, but fails with [`SimError::NotFound`] at once when the
    /// key is absent.
    pub fn get_or_fail(&mut self, sched: &mut Scheduler, key: K) -> EventKey {
        let event = sched.event();
        if self.items.contains_key(&key) {
            self.waiters.push((key, event));
            self.pump(sched);
        } else {
            sched.fail(event, SimError::NotFound);
        }
        event
    }

    fn pump(&mut self, sched: &mut Scheduler) {
        let mut idx = 0;
        while idx < self.waiters.len() {
            let key = self.waiters[idx].0;
            if let Some(value) = self.items.remove(&key) {
                let (_, event) = self.waiters.remove(idx);
                sched.succeed(event, Payload::Raw(value.to_raw()));
            } else {
                idx += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::new_key_type;

    new_key_type! {
        struct ItemKey;
    }

    fn keys(n: usize) -> Vec<ItemKey> {
        let mut arena = slotmap::SlotMap::<ItemKey, u32>::with_key();
        (0..n).map(|i| arena.insert(i as u32)).collect()
    }

    #[test]
    fn store_put_then_get_round_trips() {
        let mut sched = Scheduler::new();
        let mut store = Store::new(1);
        let items = keys(1);
        store.put(&mut sched, items[0]);
        assert_eq!(store.level(), 1);
        // The get is served immediately: the item leaves the store.
        store.get(&mut sched);
        assert_eq!(store.level(), 0);
    }

    #[test]
    fn store_capacity_one_parks_the_second_put() {
        let mut sched = Scheduler::new();
        let mut store = Store::new(1);
        let items = keys(2);
        store.put(&mut sched, items[0]);
        store.put(&mut sched, items[1]);
        assert_eq!(store.level(), 1);
        store.get(&mut sched);
        // Space freed: the parked put is admitted.
        assert_eq!(store.level(), 1);
    }

    #[test]
    fn filter_store_serves_the_first_matching_item() {
        let mut sched = Scheduler::new();
        let mut store = FilterStore::unbounded();
        let items = keys(3);
        for &item in &items {
            store.put(&mut sched, item);
        }
        let wanted = items[1];
        store.get(&mut sched, move |item: &ItemKey| *item == wanted);
        assert_eq!(store.level(), 2);
        assert!(!store.items().any(|item| *item == wanted));
    }

    #[test]
    fn multi_store_get_blocks_on_empty_and_truncates_on_short() {
        let mut sched = Scheduler::new();
        let mut store = MultiStore::unbounded();
        // Empty store: the getter must stay parked, not receive [].
        store.get(&mut sched, 3);
        assert_eq!(store.level(), 0);
        let items = keys(2);
        store.put(&mut sched, items.clone());
        // Two of the three requested items were available and delivered.
        assert_eq!(store.level(), 0);
    }

    #[test]
    fn multi_store_put_is_atomic() {
        let mut sched = Scheduler::new();
        let mut store = MultiStore::new(3);
        let items = keys(5);
        store.put(&mut sched, items[..2].to_vec());
        store.put(&mut sched, items[2..].to_vec());
        // The second batch (3 items) does not fit next to the first (2).
        assert_eq!(store.level(), 2);
        store.get(&mut sched, 2);
        assert_eq!(store.level(), 3);
    }

    #[test]
    fn sequential_store_only_matches_the_head() {
        let mut sched = Scheduler::new();
        let mut store = SequentialStore::unbounded();
        let items = keys(2);
        store.put(&mut sched, items[0]);
        store.put(&mut sched, items[1]);
        let second = items[1];
        // A getter for the second item must not bypass the head.
        store.get(&mut sched, move |item: &ItemKey| *item == second);
        assert_eq!(store.level(), 2);
        store.get_any(&mut sched);
        // Head popped; the parked filtered getter now matches the new head.
        assert_eq!(store.level(), 0);
    }

    #[test]
    fn hash_store_blocks_until_key_present() {
        let mut sched = Scheduler::new();
        let mut store: HashStore<u32, ItemKey> = HashStore::unbounded();
        let items = keys(1);
        store.get(&mut sched, 7);
        assert_eq!(store.level(), 0);
        store.put(&mut sched, 7, items[0]).unwrap();
        // The parked getter consumed the entry right away.
        assert_eq!(store.level(), 0);
    }

    #[test]
    fn hash_store_get_or_fail_fails_fast() {
        let mut sched = Scheduler::new();
        let mut store: HashStore<u32, ItemKey> = HashStore::unbounded();
        let event = store.get_or_fail(&mut sched, 9);
        // The event was failed synchronously and is queued to dispatch.
        assert!(sched.event_exists(event));
    }
}
