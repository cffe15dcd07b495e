// Kernel services
pub mod memory_service;
pub mod process_service;

pub use memory_service::{FaultError, FaultKind, MemoryService};
pub use process_service::ProcessService;
