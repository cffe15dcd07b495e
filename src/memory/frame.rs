// Physical frame allocator
//
// Before `bootstrap` the allocator is a bump pointer over free RAM and never
// reclaims anything. `bootstrap` carves a frame table out of the bottom of
// the remaining memory; from then on every page after the table is tracked
// individually and runs of pages can be freed again.
//
// A used frame records its 1-based position within its run rather than the
// run length. `free` discovers the end of a run by walking forward while the
// positions keep counting up by one.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::mem;
use core::num::NonZeroU32;
use log::{debug, info, warn};
use spin::Mutex;
use x86_64::PhysAddr;

use crate::config::{round_up, PAGE_SIZE};

/// Bookkeeping for one physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Free,
    /// Position of this frame within its allocation, starting at 1.
    Used(NonZeroU32),
}

impl Frame {
    fn position(self) -> u32 {
        match self {
            Frame::Free => 0,
            Frame::Used(pos) => pos.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The address is below, above, or inside the frame table itself.
    OutOfRange(PhysAddr),
    Unaligned(PhysAddr),
    /// The frame is free or sits in the middle of a run.
    NotAllocationBase(PhysAddr),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::OutOfRange(pa) => write!(f, "physical address {:#x} is not managed", pa.as_u64()),
            FrameError::Unaligned(pa) => write!(f, "physical address {:#x} is not page aligned", pa.as_u64()),
            FrameError::NotAllocationBase(pa) => {
                write!(f, "physical address {:#x} does not start an allocation", pa.as_u64())
            }
        }
    }
}

/// Frame counts, as reported by `FrameAllocator::stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
}

struct FrameTable {
    /// Physical address of `frames[0]`.
    low: PhysAddr,
    frames: Vec<Frame>,
}

impl FrameTable {
    /// Lay the table over `[low, top)`: the table's own pages come first and
    /// are not tracked.
    fn new(low: PhysAddr, top: PhysAddr) -> Self {
        let all_pages = (top.as_u64() - low.as_u64()) / PAGE_SIZE;
        let table_bytes = round_up(all_pages * mem::size_of::<Frame>() as u64, PAGE_SIZE);
        let low = low + table_bytes;
        let entries = (top.as_u64() - low.as_u64()) / PAGE_SIZE;
        Self {
            low,
            frames: vec![Frame::Free; entries as usize],
        }
    }

    fn addr_of(&self, index: usize) -> PhysAddr {
        self.low + index as u64 * PAGE_SIZE
    }

    fn index_of(&self, paddr: PhysAddr) -> Result<usize, FrameError> {
        if !paddr.is_aligned(PAGE_SIZE) {
            return Err(FrameError::Unaligned(paddr));
        }
        if paddr < self.low {
            return Err(FrameError::OutOfRange(paddr));
        }
        let index = ((paddr.as_u64() - self.low.as_u64()) / PAGE_SIZE) as usize;
        if index >= self.frames.len() {
            return Err(FrameError::OutOfRange(paddr));
        }
        Ok(index)
    }

    /// First fit: the lowest run of `npages` free frames.
    fn find_run(&self, npages: usize) -> Option<usize> {
        let mut start = 0;
        let mut count = 0;
        for (i, frame) in self.frames.iter().enumerate() {
            if *frame == Frame::Free {
                if count == 0 {
                    start = i;
                }
                count += 1;
                if count == npages {
                    return Some(start);
                }
            } else {
                count = 0;
            }
        }
        None
    }

    fn allocate(&mut self, npages: usize) -> Option<PhysAddr> {
        let start = self.find_run(npages)?;
        for (offset, frame) in self.frames[start..start + npages].iter_mut().enumerate() {
            *frame = Frame::Used(position(offset + 1));
        }
        Some(self.addr_of(start))
    }

    fn free(&mut self, paddr: PhysAddr) -> Result<usize, FrameError> {
        let start = self.index_of(paddr)?;
        if self.frames[start].position() != 1 {
            return Err(FrameError::NotAllocationBase(paddr));
        }
        let mut index = start;
        loop {
            let current = self.frames[index].position();
            self.frames[index] = Frame::Free;
            index += 1;
            if index == self.frames.len() || self.frames[index].position() != current + 1 {
                break;
            }
        }
        Ok(index - start)
    }

    fn stats(&self) -> FrameStats {
        let free = self.frames.iter().filter(|f| **f == Frame::Free).count();
        FrameStats {
            total: self.frames.len(),
            free,
            used: self.frames.len() - free,
        }
    }
}

fn position(pos: usize) -> NonZeroU32 {
    match u32::try_from(pos).ok().and_then(NonZeroU32::new) {
        Some(pos) => pos,
        None => panic!("invalid run position {}", pos),
    }
}

enum AllocatorState {
    /// Bump allocation between `cursor` and `top`.
    PreBoot { cursor: PhysAddr, top: PhysAddr },
    Ready(FrameTable),
}

pub struct FrameAllocator {
    state: Mutex<AllocatorState>,
}

impl FrameAllocator {
    /// Start in the bump phase over `[low, top)`.
    pub fn new(low: PhysAddr, top: PhysAddr) -> Self {
        assert!(low.is_aligned(PAGE_SIZE) && top.is_aligned(PAGE_SIZE));
        Self {
            state: Mutex::new(AllocatorState::PreBoot { cursor: low, top }),
        }
    }

    /// Switch to the frame table. Whatever the bump phase handed out stays
    /// allocated forever.
    pub fn bootstrap(&self) {
        let mut state = self.state.lock();
        let (cursor, top) = match *state {
            AllocatorState::PreBoot { cursor, top } => (cursor, top),
            AllocatorState::Ready(_) => panic!("frame allocator bootstrapped twice"),
        };
        let table = FrameTable::new(cursor, top);
        info!(
            "[VM] frame table: {} frames from {:#x}, table at {:#x}",
            table.frames.len(),
            table.low.as_u64(),
            cursor.as_u64()
        );
        *state = AllocatorState::Ready(table);
    }

    pub fn is_bootstrapped(&self) -> bool {
        matches!(*self.state.lock(), AllocatorState::Ready(_))
    }

    /// Allocate `npages` physically contiguous pages. Returns the base
    /// address of the run, or `None` if no run that long is free.
    pub fn allocate(&self, npages: usize) -> Option<PhysAddr> {
        if npages == 0 {
            return None;
        }
        let mut state = self.state.lock();
        let paddr = match &mut *state {
            AllocatorState::PreBoot { cursor, top } => {
                let size = npages as u64 * PAGE_SIZE;
                if cursor.as_u64() + size > top.as_u64() {
                    None
                } else {
                    let paddr = *cursor;
                    *cursor = paddr + size;
                    Some(paddr)
                }
            }
            AllocatorState::Ready(table) => table.allocate(npages),
        };
        match paddr {
            Some(pa) => debug!("[VM] allocated {} page(s) at {:#x}", npages, pa.as_u64()),
            None => warn!("[VM] not enough memory for {} contiguous page(s)", npages),
        }
        paddr
    }

    /// Release the run starting at `paddr`, returning how many frames were
    /// freed. Memory taken before bootstrap is leaked and reports zero.
    pub fn free(&self, paddr: PhysAddr) -> Result<usize, FrameError> {
        let mut state = self.state.lock();
        match &mut *state {
            AllocatorState::PreBoot { .. } => Ok(0),
            AllocatorState::Ready(table) => {
                let freed = table.free(paddr)?;
                debug!("[VM] freed {} page(s) at {:#x}", freed, paddr.as_u64());
                Ok(freed)
            }
        }
    }

    /// Table state of the frame holding `paddr`, if it is tracked.
    pub fn frame(&self, paddr: PhysAddr) -> Option<Frame> {
        match &*self.state.lock() {
            AllocatorState::PreBoot { .. } => None,
            AllocatorState::Ready(table) => {
                let index = table.index_of(paddr.align_down(PAGE_SIZE)).ok()?;
                Some(table.frames[index])
            }
        }
    }

    pub fn stats(&self) -> FrameStats {
        match &*self.state.lock() {
            AllocatorState::PreBoot { cursor, top } => {
                let free = ((top.as_u64() - cursor.as_u64()) / PAGE_SIZE) as usize;
                FrameStats { total: free, free, used: 0 }
            }
            AllocatorState::Ready(table) => table.stats(),
        }
    }
}
