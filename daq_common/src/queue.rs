//! Bounded thread-safe FIFO with a compile-time overflow policy.
//!
//! The single-process counterpart of a shared-memory segment: producers
//! hand items over to consumers, and what happens when the queue is full is
//! decided by the policy type parameter.
//!
//! | policy | full queue on enqueue | outcome |
//! |---|---|---|
//! | [`FailIfFull`] | item is handed back | `Err(QueueFull(item))` |
//! | [`KeepNewest`] | oldest items evicted | number evicted |
//! | [`RejectNewest`] | new item dropped | number dropped (0 or 1) |

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

/// Wait on `condvar` until `deadline`, or without limit when there is none.
///
/// Returns `true` if the deadline passed.
pub(crate) fn wait_until_deadline<T>(
    condvar: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: Option<Instant>,
) -> bool {
    match deadline {
        Some(deadline) => condvar.wait_until(guard, deadline).timed_out(),
        None => {
            condvar.wait(guard);
            false
        }
    }
}

/// Returned by [`FailIfFull`] queues when no room is left; carries the item back.
pub struct QueueFull<T>(pub T);

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

impl<T> fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is full")
    }
}

impl<T> std::error::Error for QueueFull<T> {}

/// Overflow behaviour of a [`ConcurrentQueue`].
pub trait EnqueuePolicy<T> {
    /// What an enqueue reports.
    type Outcome;

    /// Insert `item` into `items`, never growing past `capacity`.
    fn insert(items: &mut VecDeque<T>, capacity: usize, item: T) -> Self::Outcome;
}

/// Refuse the new item when full.
#[derive(Debug)]
pub enum FailIfFull {}

/// Evict from the head until the new item fits.
#[derive(Debug)]
pub enum KeepNewest {}

/// Drop the new item when full.
#[derive(Debug)]
pub enum RejectNewest {}

impl<T> EnqueuePolicy<T> for FailIfFull {
    type Outcome = Result<(), QueueFull<T>>;

    fn insert(items: &mut VecDeque<T>, capacity: usize, item: T) -> Self::Outcome {
        if items.len() >= capacity {
            return Err(QueueFull(item));
        }
        items.push_back(item);
        Ok(())
    }
}

impl<T> EnqueuePolicy<T> for KeepNewest {
    type Outcome = usize;

    fn insert(items: &mut VecDeque<T>, capacity: usize, item: T) -> Self::Outcome {
        let mut evicted = 0;
        while items.len() >= capacity && items.pop_front().is_some() {
            evicted += 1;
        }
        items.push_back(item);
        evicted
    }
}

impl<T> EnqueuePolicy<T> for RejectNewest {
    type Outcome = usize;

    fn insert(items: &mut VecDeque<T>, capacity: usize, item: T) -> Self::Outcome {
        if items.len() >= capacity {
            return 1;
        }
        items.push_back(item);
        0
    }
}

struct State<T> {
    items: VecDeque<T>,
    capacity: usize,
}

/// Bounded FIFO shared between threads.
pub struct ConcurrentQueue<T, P: EnqueuePolicy<T> = FailIfFull> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    _policy: PhantomData<fn() -> P>,
}

impl<T, P: EnqueuePolicy<T>> ConcurrentQueue<T, P> {
    /// Create a queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                capacity,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            _policy: PhantomData,
        }
    }

    /// Enqueue without waiting; the policy decides what happens when full.
    pub fn enqueue_nowait(&self, item: T) -> P::Outcome {
        let mut state = self.state.lock();
        let capacity = state.capacity;
        let outcome = P::insert(&mut state.items, capacity, item);
        drop(state);
        self.not_empty.notify_one();
        outcome
    }

    /// Wait up to `timeout` for room, then enqueue under the policy.
    pub fn enqueue_wait(&self, item: T, timeout: Duration) -> P::Outcome {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while state.items.len() >= state.capacity {
            if wait_until_deadline(&self.not_full, &mut state, deadline) {
                break;
            }
        }
        let capacity = state.capacity;
        let outcome = P::insert(&mut state.items, capacity, item);
        drop(state);
        self.not_empty.notify_one();
        outcome
    }

    /// Take the oldest item if there is one.
    pub fn dequeue_nowait(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Block until an item is available.
    pub fn dequeue_wait(&self) -> T {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return item;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Wait up to `timeout` for an item.
    pub fn dequeue_timed_wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if wait_until_deadline(&self.not_empty, &mut state, deadline) {
                let item = state.items.pop_front();
                if item.is_some() {
                    drop(state);
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether no item is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Whether the queue is at capacity.
    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.items.len() >= state.capacity
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Change the capacity; refused (returns `false`) unless the queue is empty.
    pub fn set_capacity(&self, capacity: usize) -> bool {
        let mut state = self.state.lock();
        if !state.items.is_empty() {
            return false;
        }
        state.capacity = capacity.max(1);
        drop(state);
        self.not_full.notify_all();
        true
    }

    /// Drop every queued item, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.items.len();
        state.items.clear();
        drop(state);
        self.not_full.notify_all();
        removed
    }
}

impl<T, P: EnqueuePolicy<T>> fmt::Debug for ConcurrentQueue<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConcurrentQueue")
            .field("len", &state.items.len())
            .field("capacity", &state.capacity)
            .finish()
    }
}
