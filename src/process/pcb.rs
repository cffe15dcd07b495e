// Process Control Block (PCB) for the process lifecycle manager
use alloc::collections::BTreeSet;
use alloc::string::String;
use core::fmt;
use spin::{Mutex, MutexGuard};

use crate::loader::ExecError;
use crate::memory::addrspace::{AddressSpace, VmError};
use crate::scheduler::Scheduler;
use crate::sync::Condvar;

/// Process ID type
pub type ProcessId = u32;

/// Process state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running, // Has an execution unit
    Zombie,  // Exited, exit code not yet collected by the parent
    Reaped,  // Record destroyed; nothing can observe it any more
}

/// Parent/child links. Only pids are stored: the process table owns records.
#[derive(Debug, Clone, Default)]
pub struct Family {
    /// Lookup-only back reference.
    pub parent: Option<ProcessId>,
    pub children: BTreeSet<ProcessId>,
    /// Children that exited and wait to be collected.
    pub zombies: BTreeSet<ProcessId>,
}

#[derive(Debug, Clone, Copy)]
struct ExitStatus {
    state: ProcessState,
    exit_code: i32,
}

/// Process Control Block (PCB) - Core process management structure
pub struct ProcessControlBlock {
    pub pid: ProcessId,
    pub name: String,
    addrspace: Mutex<Option<AddressSpace>>,
    /// Mutated only while the process table lock is held.
    family: Mutex<Family>,
    status: Mutex<ExitStatus>,
    exited: Condvar,
}

impl ProcessControlBlock {
    pub fn new(pid: ProcessId, name: String) -> Self {
        Self {
            pid,
            name,
            addrspace: Mutex::new(None),
            family: Mutex::new(Family::default()),
            status: Mutex::new(ExitStatus { state: ProcessState::Running, exit_code: 0 }),
            exited: Condvar::new(),
        }
    }

    pub fn state(&self) -> ProcessState {
        self.status.lock().state
    }

    pub fn exit_code(&self) -> Option<i32> {
        let status = self.status.lock();
        match status.state {
            ProcessState::Running => None,
            _ => Some(status.exit_code),
        }
    }

    /// Replace the address space, returning the previous one.
    pub fn set_addrspace(&self, aspace: Option<AddressSpace>) -> Option<AddressSpace> {
        core::mem::replace(&mut *self.addrspace.lock(), aspace)
    }

    pub fn has_addrspace(&self) -> bool {
        self.addrspace.lock().is_some()
    }

    /// Run `f` on the address space. The lock is a spin lock: `f` must not
    /// block.
    pub fn with_addrspace<R>(&self, f: impl FnOnce(Option<&AddressSpace>) -> R) -> R {
        f(self.addrspace.lock().as_ref())
    }

    pub fn family(&self) -> Family {
        self.family.lock().clone()
    }

    pub(crate) fn family_mut(&self) -> MutexGuard<'_, Family> {
        self.family.lock()
    }

    /// Record the exit code and wake anyone in `wait_for_exit`.
    pub(crate) fn become_zombie(&self, exit_code: i32, sched: &dyn Scheduler) {
        let mut status = self.status.lock();
        status.state = ProcessState::Zombie;
        status.exit_code = exit_code;
        self.exited.broadcast(sched);
        drop(status);
    }

    pub(crate) fn mark_reaped(&self) {
        self.status.lock().state = ProcessState::Reaped;
    }

    /// Block until this process is a zombie, then return its exit code.
    pub(crate) fn wait_for_exit(&self, sched: &dyn Scheduler) -> i32 {
        let mut status = self.status.lock();
        while status.state == ProcessState::Running {
            status = self.exited.wait(sched, &self.status, status);
        }
        status.exit_code
    }
}

impl fmt::Debug for ProcessControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProcessControlBlock")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("family", &*self.family.lock())
            .finish()
    }
}

/// Process management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    TooManyProcesses,
    OutOfMemory,
    NoSuchProcess,
    NotAChild,
    InvalidOptions,
    NoCurrentProcess,
    InvalidPath,
    NotExecutable,
    ArgListTooLong,
    InvalidArgument,
    BadAddress,
    TooManyRegions,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessError::TooManyProcesses => write!(f, "Too many processes"),
            ProcessError::OutOfMemory => write!(f, "Out of memory"),
            ProcessError::NoSuchProcess => write!(f, "No such process"),
            ProcessError::NotAChild => write!(f, "Not a child of the caller"),
            ProcessError::InvalidOptions => write!(f, "Invalid options"),
            ProcessError::NoCurrentProcess => write!(f, "No current process"),
            ProcessError::InvalidPath => write!(f, "Invalid path"),
            ProcessError::NotExecutable => write!(f, "Not an executable"),
            ProcessError::ArgListTooLong => write!(f, "Argument list too long"),
            ProcessError::InvalidArgument => write!(f, "Invalid argument"),
            ProcessError::BadAddress => write!(f, "Bad address"),
            ProcessError::TooManyRegions => write!(f, "Too many regions"),
        }
    }
}

impl From<VmError> for ProcessError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::OutOfMemory => ProcessError::OutOfMemory,
            VmError::TooManyRegions => ProcessError::TooManyRegions,
            VmError::BadAddress(_) => ProcessError::BadAddress,
        }
    }
}

impl From<ExecError> for ProcessError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::NotFound => ProcessError::InvalidPath,
            ExecError::NotExecutable => ProcessError::NotExecutable,
            ExecError::Vm(e) => e.into(),
        }
    }
}
