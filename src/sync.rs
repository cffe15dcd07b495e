// Synchronization glue: spin locks for short sections, a scheduler-mediated
// condition variable for blocking rendezvous.
use crossbeam_queue::SegQueue;
use spin::{Mutex, MutexGuard};

use crate::scheduler::{Scheduler, UnitId};

/// Lock for short, non-blocking critical sections. Never held across a park.
pub type SpinLock<T> = Mutex<T>;

/// Condition variable whose waiters give up their execution unit.
///
/// Waiters enqueue themselves while still holding the associated lock, so a
/// signaller that mutates state under the same lock and then signals can not
/// slip between the predicate check and the park.
pub struct Condvar {
    waiters: SegQueue<UnitId>,
}

impl Condvar {
    pub fn new() -> Self {
        Self { waiters: SegQueue::new() }
    }

    /// Release `guard`, park until signalled, then re-acquire `lock`.
    ///
    /// Wakeups may be spurious; callers loop on their predicate.
    pub fn wait<'a, T>(
        &self,
        sched: &dyn Scheduler,
        lock: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
    ) -> MutexGuard<'a, T> {
        self.waiters.push(sched.current());
        drop(guard);
        sched.park();
        lock.lock()
    }

    /// Wake one waiter, if any.
    pub fn signal(&self, sched: &dyn Scheduler) {
        if let Some(unit) = self.waiters.pop() {
            sched.unpark(unit);
        }
    }

    /// Wake every waiter queued so far.
    pub fn broadcast(&self, sched: &dyn Scheduler) {
        while let Some(unit) = self.waiters.pop() {
            sched.unpark(unit);
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
