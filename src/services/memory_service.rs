// Memory Management Service: physical memory, frames, and the TLB fault path
use core::fmt;
use log::{debug, info};
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{MachineConfig, KERNEL_DIRECT_MAP, PAGE_SIZE};
use crate::interrupts;
use crate::memory::addrspace::{AddressSpace, Segment};
use crate::memory::frame::{FrameAllocator, FrameError};
use crate::memory::ram::Ram;
use crate::memory::tlb::{Tlb, TlbEntry, TlbShootdown};

/// What the faulting access tried to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    /// Write through a TLB entry that is not dirty.
    ReadOnly,
}

/// Faults the VM can not resolve. The caller decides what happens to the
/// faulting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// Write to a read-only page.
    ReadOnly(VirtAddr),
    /// Address outside every region and the stack.
    Segmentation(VirtAddr),
    /// No current process or no address space.
    NoAddressSpace,
}

impl FaultError {
    /// Errno-style code reported to the fault dispatcher (EFAULT).
    pub fn code(&self) -> u64 {
        crate::syscalls::SyscallError::BadAddress.code()
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FaultError::ReadOnly(va) => write!(f, "write to read-only page {:#x}", va.as_u64()),
            FaultError::Segmentation(va) => write!(f, "segmentation fault at {:#x}", va.as_u64()),
            FaultError::NoAddressSpace => write!(f, "fault with no address space"),
        }
    }
}

/// Memory Service - owns RAM, the frame allocator and this core's TLB
pub struct MemoryService {
    ram: Ram,
    frames: FrameAllocator,
    tlb: Tlb,
}

impl MemoryService {
    pub fn new(config: MachineConfig) -> Self {
        let ram = Ram::new(config);
        let (low, top) = ram.getsize();
        Self {
            frames: FrameAllocator::new(low, top),
            ram,
            tlb: Tlb::new(),
        }
    }

    /// Build the frame table. Until this runs allocation is a bump pointer.
    pub fn bootstrap(&self) {
        self.frames.bootstrap();
        let stats = self.frames.stats();
        info!("[VM] bootstrap complete, {} frames free", stats.free);
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// Allocate `npages` contiguous pages for kernel use, returning their
    /// direct-mapped kernel address.
    pub fn alloc_kpages(&self, npages: usize) -> Option<VirtAddr> {
        self.frames.allocate(npages).map(paddr_to_kvaddr)
    }

    /// Free pages from `alloc_kpages`. Addresses outside the direct map are
    /// rejected without touching the frame table.
    pub fn free_kpages(&self, kvaddr: VirtAddr) -> Result<usize, FrameError> {
        match kvaddr_to_paddr(kvaddr) {
            Some(paddr) => self.frames.free(paddr),
            None => Err(FrameError::OutOfRange(PhysAddr::new(kvaddr.as_u64() & PHYS_ADDR_MASK))),
        }
    }

    /// Resolve a TLB miss at `fault_address` in `aspace`.
    pub fn vm_fault(&self, kind: FaultKind, fault_address: VirtAddr, aspace: &AddressSpace) -> Result<(), FaultError> {
        let vpage = fault_address.align_down(PAGE_SIZE);
        debug!("[VM] fault: {:?} at {:#x}", kind, vpage.as_u64());

        // pages are only ever read-only because the code region is
        if kind == FaultKind::ReadOnly {
            return Err(FaultError::ReadOnly(vpage));
        }

        let (segment, paddr) = aspace.translate(vpage).ok_or(FaultError::Segmentation(vpage))?;
        assert!(paddr.is_aligned(PAGE_SIZE), "translation of {:#x} not page aligned", vpage.as_u64());

        let dirty = !(segment == Segment::Code && aspace.is_load_complete());
        let slot = interrupts::without_interrupts(|| self.tlb.install(TlbEntry::new(vpage, paddr, dirty)));
        debug!("[VM] {:#x} -> {:#x} in slot {}", vpage.as_u64(), paddr.as_u64(), slot);
        Ok(())
    }

    pub fn tlb_shootdown(&self, request: &TlbShootdown) -> ! {
        self.tlb.shootdown(request)
    }

    pub fn tlb_shootdown_all(&self) -> ! {
        self.tlb.shootdown_all()
    }
}

/// Physical addresses are at most 52 bits wide.
const PHYS_ADDR_MASK: u64 = (1 << 52) - 1;

pub fn paddr_to_kvaddr(paddr: PhysAddr) -> VirtAddr {
    VirtAddr::new(KERNEL_DIRECT_MAP + paddr.as_u64())
}

pub fn kvaddr_to_paddr(kvaddr: VirtAddr) -> Option<PhysAddr> {
    let offset = kvaddr.as_u64().checked_sub(KERNEL_DIRECT_MAP)?;
    PhysAddr::try_new(offset).ok()
}
