// Kernel wiring: the memory and process services plus the collaborators they
// run on, and the single global instance the trap handlers reach.
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::fmt;
use log::info;
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::VirtAddr;

use crate::config::MachineConfig;
use crate::interrupts;
use crate::loader::ExecLoader;
use crate::process::context::{TrapFrame, UserEntry};
use crate::process::pcb::{ProcessError, ProcessId, ProcessState};
use crate::scheduler::Scheduler;
use crate::services::memory_service::{FaultError, FaultKind, MemoryService};
use crate::services::process_service::ProcessService;
use crate::syscalls;

static KERNEL: OnceCell<Arc<Kernel>> = OnceCell::uninit();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    AlreadyInstalled,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::AlreadyInstalled => write!(f, "kernel already installed"),
        }
    }
}

pub struct Kernel {
    memory: Arc<MemoryService>,
    processes: Arc<ProcessService>,
}

impl Kernel {
    /// Bring up memory management and an empty process table.
    pub fn new(
        config: MachineConfig,
        sched: Arc<dyn Scheduler>,
        loader: Arc<dyn ExecLoader>,
        user: Arc<dyn UserEntry>,
    ) -> Arc<Kernel> {
        let memory = Arc::new(MemoryService::new(config));
        memory.bootstrap();
        let processes = Arc::new(ProcessService::new(memory.clone(), sched, loader, user));
        info!("[PROC] kernel ready");
        Arc::new(Kernel { memory, processes })
    }

    pub fn memory(&self) -> &Arc<MemoryService> {
        &self.memory
    }

    pub fn processes(&self) -> &Arc<ProcessService> {
        &self.processes
    }

    /// Start the first user program.
    pub fn run_program(&self, path: &str, argv: &[&str]) -> Result<ProcessId, ProcessError> {
        self.processes.run_program(path, argv)
    }

    /// TLB miss or protection fault taken by the calling unit.
    pub fn vm_fault(&self, kind: FaultKind, address: VirtAddr) -> Result<(), FaultError> {
        let proc = self.processes.current().ok_or(FaultError::NoAddressSpace)?;
        proc.with_addrspace(|aspace| match aspace {
            Some(aspace) => self.memory.vm_fault(kind, address, aspace),
            None => Err(FaultError::NoAddressSpace),
        })
    }

    /// Page-fault trap entry.
    pub fn handle_page_fault(&self, address: VirtAddr, error_code: PageFaultErrorCode) -> Result<(), FaultError> {
        self.vm_fault(interrupts::fault_kind(error_code), address)
    }

    /// Run the syscall in `frame` and store its encoded result in `rax`.
    pub fn dispatch(&self, frame: &mut TrapFrame) {
        let result = syscalls::handle_syscall(self, frame);
        frame.set_return(result.into());
    }

    pub fn process_count(&self) -> usize {
        self.processes.process_count()
    }

    pub fn list_processes(&self) -> Vec<(ProcessId, String, ProcessState)> {
        self.processes.list_processes()
    }
}

/// Make `kernel` the instance trap entry points use.
pub fn install(kernel: Arc<Kernel>) -> Result<(), KernelError> {
    KERNEL.try_init_once(|| kernel).map_err(|_| KernelError::AlreadyInstalled)
}

pub fn kernel() -> Option<&'static Arc<Kernel>> {
    KERNEL.get()
}
