// Per-process address spaces
//
// An address space has at most two regions (code first, then data) and a
// fixed 12-page stack ending at `USERSTACK`. Each is backed by one
// physically contiguous run of frames, so translation is a base plus an
// offset. Backing frames go back to the allocator when the address space is
// dropped.

use alloc::sync::Arc;
use core::fmt;
use log::{debug, warn};
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{PAGE_SIZE, STACK_PAGES, USERSTACK, USERSTACK_BASE};
use crate::interrupts;
use crate::services::memory_service::MemoryService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfMemory,
    TooManyRegions,
    /// The address is not inside any region or the stack.
    BadAddress(VirtAddr),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "Out of memory"),
            VmError::TooManyRegions => write!(f, "Too many regions"),
            VmError::BadAddress(va) => write!(f, "Bad user address {:#x}", va.as_u64()),
        }
    }
}

/// Requested access rights. Recorded, not enforced per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    pub const RX: Permissions = Permissions { read: true, write: false, execute: true };
    pub const RW: Permissions = Permissions { read: true, write: true, execute: false };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub vbase: VirtAddr,
    pub npages: usize,
    pub perms: Permissions,
    /// First frame of the backing run, once `prepare_load` has run.
    pub pbase: Option<PhysAddr>,
}

impl Region {
    pub fn vtop(&self) -> VirtAddr {
        self.vbase + self.npages as u64 * PAGE_SIZE
    }

    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        vaddr >= self.vbase && vaddr < self.vtop()
    }

    fn size(&self) -> usize {
        self.npages * PAGE_SIZE as usize
    }
}

/// Which part of the address space an address fell in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Code,
    Data,
    Stack,
}

pub struct AddressSpace {
    mem: Arc<MemoryService>,
    regions: [Option<Region>; 2],
    stack: Option<PhysAddr>,
    load_complete: bool,
}

impl AddressSpace {
    pub fn new(mem: Arc<MemoryService>) -> Self {
        Self {
            mem,
            regions: [None, None],
            stack: None,
            load_complete: false,
        }
    }

    /// Define the next region. The base is rounded down and the end rounded
    /// up to page boundaries. A third region is refused.
    pub fn define_region(&mut self, vaddr: VirtAddr, size: u64, perms: Permissions) -> Result<(), VmError> {
        let size = size + (vaddr.as_u64() & (PAGE_SIZE - 1));
        let vbase = vaddr.align_down(PAGE_SIZE);
        let npages = ((size + PAGE_SIZE - 1) / PAGE_SIZE) as usize;

        let slot = match self.regions.iter_mut().find(|r| r.is_none()) {
            Some(slot) => slot,
            None => {
                warn!("[VM] too many regions");
                return Err(VmError::TooManyRegions);
            }
        };
        *slot = Some(Region { vbase, npages, perms, pbase: None });
        debug!("[VM] region {:#x} +{} page(s) {:?}", vbase.as_u64(), npages, perms);
        Ok(())
    }

    /// Back every defined region and the stack with zeroed frames.
    ///
    /// Stops at the first allocation that fails; frames obtained before that
    /// stay with the address space and are released when it is dropped.
    pub fn prepare_load(&mut self) -> Result<(), VmError> {
        assert!(
            self.regions.iter().flatten().all(|r| r.pbase.is_none()) && self.stack.is_none(),
            "prepare_load on an address space that already has memory"
        );
        for region in self.regions.iter_mut().flatten() {
            if region.npages == 0 {
                continue;
            }
            let pbase = self.mem.frames().allocate(region.npages).ok_or(VmError::OutOfMemory)?;
            region.pbase = Some(pbase);
            self.mem.ram().zero(pbase, region.size());
        }
        let stack = self.mem.frames().allocate(STACK_PAGES).ok_or(VmError::OutOfMemory)?;
        self.stack = Some(stack);
        self.mem.ram().zero(stack, STACK_PAGES * PAGE_SIZE as usize);
        Ok(())
    }

    /// The image is in place; the code region becomes read-only.
    pub fn complete_load(&mut self) {
        self.load_complete = true;
    }

    /// Initial user stack pointer.
    pub fn define_stack(&self) -> VirtAddr {
        assert!(self.stack.is_some(), "define_stack before prepare_load");
        VirtAddr::new(USERSTACK)
    }

    /// Duplicate this address space into freshly allocated frames.
    pub fn copy(&self) -> Result<AddressSpace, VmError> {
        let mut new = AddressSpace::new(self.mem.clone());
        for (slot, old) in new.regions.iter_mut().zip(self.regions.iter()) {
            *slot = old.map(|r| Region { pbase: None, ..r });
        }
        // a partially backed copy is released when `new` drops
        new.prepare_load()?;

        let ram = self.mem.ram();
        for (dst, src) in new.regions.iter().zip(self.regions.iter()) {
            if let (Some(dst), Some(src)) = (dst, src) {
                if let (Some(to), Some(from)) = (dst.pbase, src.pbase) {
                    ram.copy(to, from, src.size());
                }
            }
        }
        if let (Some(to), Some(from)) = (new.stack, self.stack) {
            ram.copy(to, from, STACK_PAGES * PAGE_SIZE as usize);
        }
        Ok(new)
    }

    /// Make this the address space the TLB translates for.
    pub fn activate(&self) {
        let tlb = self.mem.tlb();
        interrupts::without_interrupts(|| tlb.invalidate_all());
    }

    pub fn deactivate(&self) {}

    /// Release all backing frames.
    pub fn destroy(self) {
        drop(self);
    }

    /// Classify `vaddr` against region 1, region 2, then the stack window,
    /// and translate it. Panics if the matching part has no backing yet.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<(Segment, PhysAddr)> {
        for (region, segment) in self.regions.iter().zip([Segment::Code, Segment::Data]) {
            if let Some(region) = region {
                if region.contains(vaddr) {
                    let pbase = match region.pbase {
                        Some(pbase) => pbase,
                        None => panic!("region at {:#x} has no backing", region.vbase.as_u64()),
                    };
                    return Some((segment, pbase + (vaddr - region.vbase)));
                }
            }
        }
        if vaddr.as_u64() >= USERSTACK_BASE && vaddr.as_u64() < USERSTACK {
            let stack = match self.stack {
                Some(stack) => stack,
                None => panic!("stack has no backing"),
            };
            return Some((Segment::Stack, stack + (vaddr.as_u64() - USERSTACK_BASE)));
        }
        None
    }

    /// Copy `data` into user memory starting at `vaddr`.
    pub fn copyout(&self, vaddr: VirtAddr, data: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < data.len() {
            let va = vaddr + done as u64;
            let chunk = page_chunk(va, data.len() - done);
            let (_, pa) = self.translate(va).ok_or(VmError::BadAddress(va))?;
            self.mem.ram().write(pa, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copy user memory starting at `vaddr` into `buf`.
    pub fn copyin(&self, vaddr: VirtAddr, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let va = vaddr + done as u64;
            let chunk = page_chunk(va, buf.len() - done);
            let (_, pa) = self.translate(va).ok_or(VmError::BadAddress(va))?;
            self.mem.ram().read(pa, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    pub fn region(&self, index: usize) -> Option<&Region> {
        self.regions.get(index).and_then(|r| r.as_ref())
    }

    pub fn stack_pbase(&self) -> Option<PhysAddr> {
        self.stack
    }

    pub fn is_load_complete(&self) -> bool {
        self.load_complete
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let frames = self.mem.frames();
        let backings = self.regions.iter().flatten().filter_map(|r| r.pbase).chain(self.stack);
        for pbase in backings {
            if let Err(e) = frames.free(pbase) {
                panic!("address space backing corrupted: {}", e);
            }
        }
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("regions", &self.regions)
            .field("stack", &self.stack)
            .field("load_complete", &self.load_complete)
            .finish()
    }
}

/// Bytes from `va` to the end of its page, capped at `remaining`.
fn page_chunk(va: VirtAddr, remaining: usize) -> usize {
    let to_page_end = (PAGE_SIZE - (va.as_u64() & (PAGE_SIZE - 1))) as usize;
    to_page_end.min(remaining)
}
