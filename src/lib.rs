// emvm: virtual memory and process lifecycle core for a teaching kernel
#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod config;
pub mod interrupts;
pub mod kernel;
pub mod loader;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod services;
pub mod sync;
pub mod syscalls;

#[cfg(test)]
mod tests;

pub use kernel::Kernel;
