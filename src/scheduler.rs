// src/scheduler.rs
//
// The thread scheduler is not part of this core. The lifecycle manager only
// needs to start execution units, find out which one is running, and park or
// unpark them; the kernel supplies an implementation of `Scheduler`.
use alloc::boxed::Box;
use core::fmt;

/// Identifies one schedulable execution unit (a kernel thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Body run by a freshly started execution unit.
pub type UnitEntry = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    OutOfMemory,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SpawnError::OutOfMemory => write!(f, "no memory for a new execution unit"),
        }
    }
}

pub trait Scheduler: Send + Sync {
    /// The unit executing the caller.
    fn current(&self) -> UnitId;

    /// Create a unit that runs `entry` once it is first scheduled.
    fn spawn(&self, name: &str, entry: UnitEntry) -> Result<UnitId, SpawnError>;

    /// Suspend the caller until `unpark` is called for it.
    ///
    /// An `unpark` delivered before the caller parks is not lost: the next
    /// `park` returns immediately. Callers must tolerate spurious returns.
    fn park(&self);

    /// Make `unit` runnable again.
    fn unpark(&self, unit: UnitId);

    /// Terminate the calling unit (`thread_exit`).
    fn exit_current(&self) -> !;
}
