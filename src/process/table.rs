// Process table: pid allocation, pid -> record lookup, and which execution
// unit belongs to which process.
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, warn};
use spin::{Mutex, MutexGuard};

use crate::config::{PID_MAX, PID_MIN};
use crate::process::pcb::{ProcessControlBlock, ProcessError, ProcessId, ProcessState};
use crate::scheduler::UnitId;

const PID_SLOTS: usize = (PID_MAX - PID_MIN + 1) as usize;

/// Next-fit allocator over the pid domain.
pub struct PidAllocator {
    in_use: [bool; PID_SLOTS],
    next: usize,
}

impl PidAllocator {
    pub const fn new() -> Self {
        Self { in_use: [false; PID_SLOTS], next: 0 }
    }

    pub fn allocate(&mut self) -> Option<ProcessId> {
        for step in 0..PID_SLOTS {
            let slot = (self.next + step) % PID_SLOTS;
            if !self.in_use[slot] {
                self.in_use[slot] = true;
                self.next = (slot + 1) % PID_SLOTS;
                return Some(PID_MIN + slot as ProcessId);
            }
        }
        None
    }

    pub fn release(&mut self, pid: ProcessId) {
        let slot = (pid - PID_MIN) as usize;
        assert!(self.in_use[slot], "releasing unused pid {}", pid);
        self.in_use[slot] = false;
    }

    pub fn in_use(&self) -> usize {
        self.in_use.iter().filter(|&&used| used).count()
    }
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn pid_in_range(pid: ProcessId) -> bool {
    (PID_MIN..=PID_MAX).contains(&pid)
}

pub struct TableInner {
    pids: PidAllocator,
    processes: BTreeMap<ProcessId, Arc<ProcessControlBlock>>,
    units: BTreeMap<UnitId, ProcessId>,
}

impl TableInner {
    pub fn get(&self, pid: ProcessId) -> Option<Arc<ProcessControlBlock>> {
        self.processes.get(&pid).cloned()
    }

    pub fn detach(&mut self, unit: UnitId) -> Option<ProcessId> {
        self.units.remove(&unit)
    }

    /// Drop the record and recycle its pid.
    pub fn destroy(&mut self, pid: ProcessId) {
        if let Some(pcb) = self.processes.remove(&pid) {
            debug_assert!(!pcb.has_addrspace(), "destroying pid {} with a live address space", pid);
            pcb.mark_reaped();
            self.pids.release(pid);
            self.units.retain(|_, owner| *owner != pid);
            debug!("[PROC] pid {} destroyed", pid);
        }
    }
}

/// All process records. Holding the table lock is what serializes changes
/// to the parent/child graph.
pub struct ProcessTable {
    inner: Mutex<TableInner>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                pids: PidAllocator::new(),
                processes: BTreeMap::new(),
                units: BTreeMap::new(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock()
    }

    /// Allocate a pid and an empty record for it.
    pub fn create(&self, name: &str) -> Result<Arc<ProcessControlBlock>, ProcessError> {
        let mut inner = self.inner.lock();
        let pid = match inner.pids.allocate() {
            Some(pid) => pid,
            None => {
                warn!("[PROC] out of pids creating {}", name);
                return Err(ProcessError::TooManyProcesses);
            }
        };
        let pcb = Arc::new(ProcessControlBlock::new(pid, String::from(name)));
        inner.processes.insert(pid, pcb.clone());
        Ok(pcb)
    }

    pub fn get(&self, pid: ProcessId) -> Option<Arc<ProcessControlBlock>> {
        self.inner.lock().get(pid)
    }

    pub fn destroy(&self, pid: ProcessId) {
        self.inner.lock().destroy(pid);
    }

    /// Bind an execution unit to a process.
    pub fn attach(&self, unit: UnitId, pid: ProcessId) {
        self.inner.lock().units.insert(unit, pid);
    }

    pub fn detach(&self, unit: UnitId) -> Option<ProcessId> {
        self.inner.lock().detach(unit)
    }

    /// The process `unit` runs for.
    pub fn process_of(&self, unit: UnitId) -> Option<Arc<ProcessControlBlock>> {
        let inner = self.inner.lock();
        inner.units.get(&unit).and_then(|pid| inner.get(*pid))
    }

    pub fn count(&self) -> usize {
        self.inner.lock().processes.len()
    }

    pub fn list(&self) -> Vec<(ProcessId, String, ProcessState)> {
        self.inner
            .lock()
            .processes
            .values()
            .map(|pcb| (pcb.pid, pcb.name.clone(), pcb.state()))
            .collect()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
