// Physical memory, frames, address spaces and the TLB
pub mod addrspace;
pub mod frame;
pub mod ram;
pub mod tlb;

pub use addrspace::{AddressSpace, Permissions, Region, Segment, VmError};
pub use frame::{Frame, FrameAllocator, FrameError, FrameStats};
pub use ram::Ram;
pub use tlb::{Tlb, TlbEntry, TlbShootdown};
