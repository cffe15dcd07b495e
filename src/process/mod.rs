// Process Management Module
pub mod args;
pub mod context;
pub mod pcb;
pub mod table;

pub use context::{TrapFrame, UserEntry, UserStart};
pub use pcb::{Family, ProcessControlBlock, ProcessError, ProcessId, ProcessState};
pub use table::{PidAllocator, ProcessTable};
