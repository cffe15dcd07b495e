// Process Management Service: fork, exec, exit, wait and the process graph
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::convert::Infallible;
use log::{debug, info, warn};

use crate::loader::ExecLoader;
use crate::memory::addrspace::AddressSpace;
use crate::process::args;
use crate::process::context::{TrapFrame, UserEntry, UserStart};
use crate::process::pcb::{ProcessControlBlock, ProcessError, ProcessId, ProcessState};
use crate::process::table::{pid_in_range, ProcessTable};
use crate::scheduler::Scheduler;
use crate::services::memory_service::MemoryService;

/// Process Service - owns the process table and drives the lifecycle
pub struct ProcessService {
    memory: Arc<MemoryService>,
    table: ProcessTable,
    sched: Arc<dyn Scheduler>,
    loader: Arc<dyn ExecLoader>,
    user: Arc<dyn UserEntry>,
}

impl ProcessService {
    pub fn new(
        memory: Arc<MemoryService>,
        sched: Arc<dyn Scheduler>,
        loader: Arc<dyn ExecLoader>,
        user: Arc<dyn UserEntry>,
    ) -> Self {
        Self { memory, table: ProcessTable::new(), sched, loader, user }
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.sched
    }

    /// The process the calling execution unit belongs to.
    pub fn current(&self) -> Option<Arc<ProcessControlBlock>> {
        self.table.process_of(self.sched.current())
    }

    fn current_or_err(&self) -> Result<Arc<ProcessControlBlock>, ProcessError> {
        self.current().ok_or(ProcessError::NoCurrentProcess)
    }

    pub fn getpid(&self) -> Result<ProcessId, ProcessError> {
        Ok(self.current_or_err()?.pid)
    }

    /// Duplicate the calling process. The child resumes at `frame` with a
    /// return value of 0; the parent gets the child's pid.
    pub fn fork(self: &Arc<Self>, frame: &TrapFrame) -> Result<ProcessId, ProcessError> {
        let parent = self.current_or_err()?;
        let child = self.table.create(&parent.name)?;

        // kernel-only processes have nothing to duplicate
        let copied = parent.with_addrspace(|aspace| aspace.map(AddressSpace::copy));
        let aspace = match copied {
            Some(Ok(aspace)) => aspace,
            Some(Err(e)) => {
                warn!("[PROC] fork of pid {} failed copying memory: {}", parent.pid, e);
                self.table.destroy(child.pid);
                return Err(e.into());
            }
            None => {
                self.table.destroy(child.pid);
                return Err(ProcessError::NoCurrentProcess);
            }
        };
        child.set_addrspace(Some(aspace));

        {
            let _graph = self.table.lock();
            child.family_mut().parent = Some(parent.pid);
            parent.family_mut().children.insert(child.pid);
        }

        let frame = Box::new(frame.for_child());
        let this = self.clone();
        let pid = child.pid;
        let entry = Box::new(move || {
            this.enter_forked_process(pid, *frame);
        });
        if let Err(e) = self.sched.spawn(&child.name, entry) {
            warn!("[PROC] fork of pid {} failed starting a unit: {}", parent.pid, e);
            let mut graph = self.table.lock();
            parent.family_mut().children.remove(&pid);
            drop(child.set_addrspace(None));
            graph.destroy(pid);
            return Err(ProcessError::OutOfMemory);
        }

        info!("[PROC] pid {} forked pid {}", parent.pid, pid);
        Ok(pid)
    }

    fn enter_forked_process(&self, pid: ProcessId, frame: TrapFrame) -> ! {
        self.table.attach(self.sched.current(), pid);
        let child = match self.table.get(pid) {
            Some(child) => child,
            None => panic!("forked pid {} destroyed before it ran", pid),
        };
        child.with_addrspace(|aspace| match aspace {
            Some(aspace) => aspace.activate(),
            None => panic!("pid {} resuming without an address space", pid),
        });
        debug!("[PROC] pid {} entering user mode at {:#x}", pid, frame.rip);
        self.user.enter_forked_process(frame)
    }

    /// Open `path`, load it into a fresh address space and lay out `argv`
    /// on its stack. Nothing outside the returned address space changes.
    fn build_image(&self, path: &str, argv: &[&str]) -> Result<(AddressSpace, UserStart), ProcessError> {
        if path.is_empty() || path.contains('\0') {
            return Err(ProcessError::InvalidPath);
        }
        args::validate(argv)?;

        let image = self.loader.open(path)?;
        let mut aspace = AddressSpace::new(self.memory.clone());
        let entry = image.load(&mut aspace)?;
        let stack = aspace.define_stack();
        let layout = args::copy_args(&aspace, stack, argv)?;

        let start = UserStart { argc: layout.argc, argv: layout.argv, stack: layout.argv, entry };
        Ok((aspace, start))
    }

    /// Replace the caller's program. Only returns on failure, in which case
    /// the caller's address space is untouched.
    pub fn execv(&self, path: &str, argv: &[&str]) -> Result<Infallible, ProcessError> {
        let proc = self.current_or_err()?;
        let (aspace, start) = match self.build_image(path, argv) {
            Ok(built) => built,
            Err(e) => {
                debug!("[PROC] pid {} exec {} failed: {}", proc.pid, path, e);
                return Err(e);
            }
        };

        if let Some(old) = proc.set_addrspace(Some(aspace)) {
            old.deactivate();
            old.destroy();
        }
        proc.with_addrspace(|aspace| {
            if let Some(aspace) = aspace {
                aspace.activate();
            }
        });
        info!("[PROC] pid {} exec {} argc {}", proc.pid, path, start.argc);
        self.user.enter_new_process(start)
    }

    /// Start `path` as a new parentless process on its own execution unit.
    pub fn run_program(self: &Arc<Self>, path: &str, argv: &[&str]) -> Result<ProcessId, ProcessError> {
        let proc = self.table.create(path)?;
        let (aspace, start) = match self.build_image(path, argv) {
            Ok(built) => built,
            Err(e) => {
                self.table.destroy(proc.pid);
                return Err(e);
            }
        };
        proc.set_addrspace(Some(aspace));

        let this = self.clone();
        let pid = proc.pid;
        let entry = Box::new(move || {
            this.enter_new_process(pid, start);
        });
        if let Err(e) = self.sched.spawn(path, entry) {
            warn!("[PROC] runprogram {} failed starting a unit: {}", path, e);
            drop(proc.set_addrspace(None));
            self.table.destroy(pid);
            return Err(ProcessError::OutOfMemory);
        }
        info!("[PROC] pid {} running {}", pid, path);
        Ok(pid)
    }

    fn enter_new_process(&self, pid: ProcessId, start: UserStart) -> ! {
        self.table.attach(self.sched.current(), pid);
        if let Some(proc) = self.table.get(pid) {
            proc.with_addrspace(|aspace| {
                if let Some(aspace) = aspace {
                    aspace.activate();
                }
            });
        }
        self.user.enter_new_process(start)
    }

    /// Terminate the calling process with `exit_code`.
    pub fn exit(&self, exit_code: i32) -> ! {
        let unit = self.sched.current();
        let proc = match self.table.process_of(unit) {
            Some(proc) => proc,
            None => panic!("exit from {} which runs no process", unit),
        };

        if let Some(aspace) = proc.set_addrspace(None) {
            aspace.deactivate();
            aspace.destroy();
        }

        {
            let mut graph = self.table.lock();
            graph.detach(unit);

            let (parent, children, zombies) = {
                let mut family = proc.family_mut();
                (
                    family.parent,
                    core::mem::take(&mut family.children),
                    core::mem::take(&mut family.zombies),
                )
            };
            for pid in children.difference(&zombies) {
                if let Some(child) = graph.get(*pid) {
                    child.family_mut().parent = None;
                }
            }
            for pid in zombies {
                graph.destroy(pid);
            }

            match parent.and_then(|ppid| graph.get(ppid)) {
                Some(parent) => {
                    proc.become_zombie(exit_code, &*self.sched);
                    parent.family_mut().zombies.insert(proc.pid);
                    info!("[PROC] pid {} exited with {}, parent {}", proc.pid, exit_code, parent.pid);
                }
                None => {
                    graph.destroy(proc.pid);
                    info!("[PROC] pid {} exited with {}, no parent", proc.pid, exit_code);
                }
            }
        }

        self.sched.exit_current()
    }

    /// Wait for child `pid` to exit and collect its exit code.
    pub fn waitpid(&self, pid: ProcessId, options: u32) -> Result<(ProcessId, i32), ProcessError> {
        let me = self.current_or_err()?;
        if options != 0 {
            return Err(ProcessError::InvalidOptions);
        }
        if !pid_in_range(pid) {
            return Err(ProcessError::NoSuchProcess);
        }

        let child = {
            let graph = self.table.lock();
            if !me.family().children.contains(&pid) {
                return Err(ProcessError::NotAChild);
            }
            graph.get(pid).ok_or(ProcessError::NoSuchProcess)?
        };

        let exit_code = child.wait_for_exit(&*self.sched);

        {
            let mut graph = self.table.lock();
            {
                let mut family = me.family_mut();
                family.children.remove(&pid);
                family.zombies.remove(&pid);
            }
            graph.destroy(pid);
        }
        debug!("[PROC] pid {} reaped pid {} ({})", me.pid, pid, exit_code);
        Ok((pid, exit_code))
    }

    pub fn list_processes(&self) -> Vec<(ProcessId, String, ProcessState)> {
        self.table.list()
    }

    pub fn process_count(&self) -> usize {
        self.table.count()
    }

    pub fn children(&self, pid: ProcessId) -> Option<Vec<ProcessId>> {
        self.table.get(pid).map(|p| p.family().children.into_iter().collect())
    }

    pub fn zombies(&self, pid: ProcessId) -> Option<Vec<ProcessId>> {
        self.table.get(pid).map(|p| p.family().zombies.into_iter().collect())
    }
}
