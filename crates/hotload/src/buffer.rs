//! Double-buffered storage with reference-counted retirement.
//!
//! [`SwapBuffer`] holds at most two versions of a value: the active one,
//! which new borrows land on, and the previous one, which stays alive until
//! every reader that borrowed it has let go.
//!
//! # Protocol
//!
//! - [`publish`](SwapBuffer::publish) writes the *inactive* slot, then flips
//!   the active index. The flip is the single moment new borrows start
//!   seeing the new version.
//! - [`borrow`](SwapBuffer::borrow) increments the borrower count of the
//!   active handle while holding that slot's read lock.
//! - A retirement watch polls the displaced handle and clears its slot once
//!   the borrower count reaches zero, re-checking under the slot's write lock.
//! - A publish onto a slot whose previous handle still has borrowers fails
//!   with [`Error::SlotBusy`] without touching anything.
//!
//! Writers only ever lock the inactive slot, so readers of the active
//! version never wait on a publish.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::Error;
use crate::settings::DEFAULT_RETIRE_INTERVAL;

/// Sentinel for "nothing published yet".
const NO_SLOT: usize = usize::MAX;

/// A published value paired with its borrower count.
pub struct Handle<T> {
    value: T,
    borrowers: AtomicUsize,
    epoch: u64,
}

impl<T> Handle<T> {
    const fn new(value: T, epoch: u64) -> Self {
        Self {
            value,
            borrowers: AtomicUsize::new(0),
            epoch,
        }
    }

    /// The wrapped value.
    pub const fn get(&self) -> &T {
        &self.value
    }

    /// Number of outstanding borrows.
    pub fn borrowers(&self) -> usize {
        self.borrowers.load(Ordering::Acquire)
    }

    /// Publish epoch this handle was created at (starts at 1).
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    fn acquire(&self) {
        self.borrowers.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the borrower count, floored at zero.
    ///
    /// Returns `false` if the count was already zero.
    pub(crate) fn release(&self) -> bool {
        self.borrowers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("value", &self.value)
            .field("borrowers", &self.borrowers())
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// A scoped borrow of the active handle.
///
/// The borrow is released when the lease is dropped or passed to
/// [`SwapBuffer::release`].
pub struct Lease<T> {
    handle: Arc<Handle<T>>,
}

impl<T> Lease<T> {
    /// The underlying handle.
    #[must_use]
    pub fn handle(&self) -> &Handle<T> {
        &self.handle
    }

    /// Publish epoch of the borrowed version.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.handle.epoch
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.handle.value
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl<T: fmt::Debug> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lease").field(&*self.handle).finish()
    }
}

/// Observed state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Nothing stored.
    Empty,

    /// The slot new borrows land on.
    Active {
        /// Outstanding borrows.
        borrowers: usize,
    },

    /// A displaced handle waiting for its borrowers to drain.
    Retiring {
        /// Outstanding borrows.
        borrowers: usize,
    },
}

struct Slots<T> {
    slots: [RwLock<Option<Arc<Handle<T>>>>; 2],
    active: AtomicUsize,
    epoch: AtomicU64,
    /// Serializes publishers.
    publish: Mutex<()>,
    retire_interval: Duration,
}

/// Two-slot container that swaps values under concurrent readers.
///
/// Cloning a `SwapBuffer` yields another handle to the same slots.
///
/// # Example
///
/// ```ignore
/// let buffer = SwapBuffer::new();
/// buffer.publish(rules_v1)?;
///
/// let lease = buffer.borrow().expect("published");
/// evaluate(&lease, request);
/// drop(lease);
///
/// buffer.publish(rules_v2)?;
/// ```
pub struct SwapBuffer<T> {
    inner: Arc<Slots<T>>,
}

impl<T> SwapBuffer<T> {
    /// Create an empty buffer with the default retirement poll interval.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retire_interval(DEFAULT_RETIRE_INTERVAL)
    }

    /// Create an empty buffer that polls retiring handles every `interval`.
    #[must_use]
    pub fn with_retire_interval(interval: Duration) -> Self {
        Self {
            inner: Arc::new(Slots {
                slots: [RwLock::new(None), RwLock::new(None)],
                active: AtomicUsize::new(NO_SLOT),
                epoch: AtomicU64::new(0),
                publish: Mutex::new(()),
                retire_interval: interval,
            }),
        }
    }

    /// Borrow the active version.
    ///
    /// Returns `None` if nothing has been published. The version stays alive
    /// and its slot stays reserved until the lease is dropped.
    #[must_use]
    pub fn borrow(&self) -> Option<Lease<T>> {
        loop {
            let idx = self.inner.active.load(Ordering::Acquire);
            if idx == NO_SLOT {
                return None;
            }

            let slot = self.inner.slots[idx].read();
            if let Some(handle) = slot.as_ref()
                && self.inner.active.load(Ordering::Acquire) == idx
            {
                handle.acquire();
                return Some(Lease {
                    handle: Arc::clone(handle),
                });
            }
            // A publish moved the active index between the two loads
        }
    }

    /// Release a borrow. Equivalent to dropping the lease.
    pub fn release(&self, lease: Lease<T>) {
        drop(lease);
    }

    /// Index of the active slot, if anything was published.
    #[must_use]
    pub fn active_slot(&self) -> Option<usize> {
        match self.inner.active.load(Ordering::Acquire) {
            NO_SLOT => None,
            idx => Some(idx),
        }
    }

    /// Observe the state of slot `idx` (0 or 1).
    ///
    /// # Panics
    ///
    /// Panics if `idx` is not 0 or 1.
    #[must_use]
    pub fn slot_state(&self, idx: usize) -> SlotState {
        let slot = self.inner.slots[idx].read();
        match slot.as_ref() {
            None => SlotState::Empty,

            Some(handle) if self.active_slot() == Some(idx) => SlotState::Active {
                borrowers: handle.borrowers(),
            },

            Some(handle) => SlotState::Retiring {
                borrowers: handle.borrowers(),
            },
        }
    }

    /// Number of successful publishes so far.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Acquire)
    }

    /// Returns `true` if nothing has been published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active_slot().is_none()
    }

    /// Interval at which retiring handles are polled.
    #[must_use]
    pub fn retire_interval(&self) -> Duration {
        self.inner.retire_interval
    }
}

impl<T: Send + Sync + 'static> SwapBuffer<T> {
    /// Publish a new version and make it the active one.
    ///
    /// Returns the new epoch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotBusy`] if the slot the new version would occupy
    /// still holds a borrowed handle from an earlier publish. Nothing is
    /// changed in that case.
    pub fn publish(&self, value: T) -> Result<u64, Error> {
        let _publish = self.inner.publish.lock();

        let current = self.inner.active.load(Ordering::Acquire);
        let target = if current == NO_SLOT { 0 } else { 1 - current };
        let epoch = self.inner.epoch.load(Ordering::Acquire) + 1;

        {
            let mut slot = self.inner.slots[target].write();
            if let Some(previous) = slot.as_ref() {
                let borrowers = previous.borrowers();
                if borrowers != 0 {
                    debug!(slot = target, borrowers, "publish refused, slot still draining");
                    return Err(Error::slot_busy(target, borrowers));
                }
            }
            *slot = Some(Arc::new(Handle::new(value, epoch)));
        }

        self.inner.active.store(target, Ordering::Release);
        self.inner.epoch.store(epoch, Ordering::Release);
        trace!(slot = target, epoch, "published");

        if current != NO_SLOT {
            let displaced = self.inner.slots[current].read().clone();
            if let Some(handle) = displaced {
                self.retire(current, handle);
            }
        }

        Ok(epoch)
    }

    /// Start the retirement watch for a displaced handle.
    fn retire(&self, idx: usize, handle: Arc<Handle<T>>) {
        let inner = Arc::clone(&self.inner);
        let epoch = handle.epoch;
        let spawned = thread::Builder::new()
            .name("hotload-retire".to_string())
            .spawn(move || retirement_watch(&inner, idx, &handle));

        // A handle left in place is overwritten by the next publish once
        // its borrowers drain, so a missing watch only delays the clear.
        if let Err(e) = spawned {
            warn!(slot = idx, epoch, error = %e, "failed to spawn retirement watch");
        }
    }
}

/// Poll a displaced handle until it can be cleared or was overwritten.
fn retirement_watch<T>(inner: &Slots<T>, idx: usize, handle: &Arc<Handle<T>>) {
    loop {
        {
            let mut slot = inner.slots[idx].write();
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, handle) => {
                    if handle.borrowers() == 0 {
                        *slot = None;
                        trace!(slot = idx, epoch = handle.epoch, "retired");
                        return;
                    }
                }

                // Overwritten by a later publish
                _ => return,
            }
        }
        thread::sleep(inner.retire_interval);
    }
}

impl<T> Clone for SwapBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for SwapBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Manual Debug impl to avoid requiring T: Debug
impl<T> fmt::Debug for SwapBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapBuffer")
            .field("active", &self.active_slot())
            .field("slots", &[self.slot_state(0), self.slot_state(1)])
            .field("epoch", &self.epoch())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fast_buffer<T>() -> SwapBuffer<T> {
        SwapBuffer::with_retire_interval(Duration::from_millis(5))
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_empty_buffer() {
        let buffer: SwapBuffer<u32> = SwapBuffer::new();
        assert!(buffer.is_empty());
        assert!(buffer.borrow().is_none());
        assert_eq!(buffer.active_slot(), None);
        assert_eq!(buffer.epoch(), 0);
        assert_eq!(buffer.slot_state(0), SlotState::Empty);
        assert_eq!(buffer.slot_state(1), SlotState::Empty);
    }

    #[test]
    fn test_first_publish_lands_in_slot_zero() {
        let buffer = fast_buffer();
        assert_eq!(buffer.publish("a").unwrap(), 1);
        assert_eq!(buffer.active_slot(), Some(0));
        assert_eq!(*buffer.borrow().unwrap(), "a");
        assert_eq!(buffer.slot_state(0), SlotState::Active { borrowers: 0 });
    }

    #[test]
    fn test_publish_alternates_slots() {
        let buffer = fast_buffer();
        buffer.publish(1).unwrap();
        buffer.publish(2).unwrap();
        assert_eq!(buffer.active_slot(), Some(1));
        buffer.publish(3).unwrap();
        assert_eq!(buffer.active_slot(), Some(0));
        assert_eq!(*buffer.borrow().unwrap(), 3);
        assert_eq!(buffer.epoch(), 3);
    }

    #[test]
    fn test_publish_without_borrowers_always_succeeds() {
        let buffer = fast_buffer();
        for i in 0..10 {
            buffer.publish(i).unwrap();
        }
        assert_eq!(*buffer.borrow().unwrap(), 9);
    }

    #[test]
    fn test_borrow_counts() {
        let buffer = fast_buffer();
        buffer.publish(7).unwrap();

        let a = buffer.borrow().unwrap();
        let b = buffer.borrow().unwrap();
        assert_eq!(a.handle().borrowers(), 2);
        assert_eq!(buffer.slot_state(0), SlotState::Active { borrowers: 2 });

        buffer.release(a);
        assert_eq!(b.handle().borrowers(), 1);
        drop(b);
        assert_eq!(buffer.slot_state(0), SlotState::Active { borrowers: 0 });
    }

    #[test]
    fn test_release_floors_at_zero() {
        let handle = Handle::new((), 1);
        handle.acquire();
        assert!(handle.release());
        // Duplicate release is a no-op
        assert!(!handle.release());
        assert!(!handle.release());
        assert_eq!(handle.borrowers(), 0);
    }

    #[test]
    fn test_publish_busy_while_borrowed() {
        let buffer = fast_buffer();
        buffer.publish("a").unwrap();
        let held = buffer.borrow().unwrap();
        buffer.publish("b").unwrap();

        // Slot 0 still holds "a" with one borrower
        let err = buffer.publish("c").unwrap_err();
        assert!(matches!(err, Error::SlotBusy { slot: 0, borrowers: 1 }));
        assert_eq!(*buffer.borrow().unwrap(), "b");
        assert_eq!(buffer.active_slot(), Some(1));
        assert_eq!(buffer.epoch(), 2);

        drop(held);
        assert!(wait_for(|| buffer.publish("c").is_ok()));
        assert_eq!(*buffer.borrow().unwrap(), "c");
    }

    #[test]
    fn test_retirement_after_release() {
        let buffer = fast_buffer();
        buffer.publish(String::from("a")).unwrap();
        let held = buffer.borrow().unwrap();

        buffer.publish(String::from("b")).unwrap();
        assert_eq!(buffer.active_slot(), Some(1));

        // The old version stays reachable to its holder
        assert_eq!(held.as_str(), "a");
        thread::sleep(Duration::from_millis(30));
        assert_eq!(buffer.slot_state(0), SlotState::Retiring { borrowers: 1 });

        drop(held);
        assert!(wait_for(|| buffer.slot_state(0) == SlotState::Empty));
        assert_eq!(buffer.slot_state(1), SlotState::Active { borrowers: 0 });
    }

    #[test]
    fn test_lease_reports_epoch() {
        let buffer = fast_buffer();
        buffer.publish(1).unwrap();
        let first = buffer.borrow().unwrap();
        buffer.publish(2).unwrap();
        let second = buffer.borrow().unwrap();
        assert_eq!(first.epoch(), 1);
        assert_eq!(second.epoch(), 2);
    }

    #[test]
    fn test_no_torn_reads() {
        // Each version is a pair of equal halves; a torn read would mix them
        let buffer = fast_buffer();
        buffer.publish((0u64, 0u64)).unwrap();

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..5_000 {
                        let lease = buffer.borrow().unwrap();
                        assert_eq!(lease.0, lease.1);
                        assert!(lease.epoch() >= last);
                        last = lease.epoch();
                    }
                })
            })
            .collect();

        let mut published = 0u64;
        for i in 1..=200u64 {
            if buffer.publish((i, i)).is_ok() {
                published += 1;
            }
            thread::yield_now();
        }

        for reader in readers {
            reader.join().unwrap();
        }
        assert!(published > 0);
        assert_eq!(buffer.epoch(), published + 1);
    }

    #[test]
    fn test_debug_output() {
        let buffer = fast_buffer();
        buffer.publish(1).unwrap();
        let debug = format!("{buffer:?}");
        assert!(debug.contains("SwapBuffer"));
        assert!(debug.contains("epoch: 1"));
    }
}
