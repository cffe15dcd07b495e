// Software-managed translation cache.
//
// Modelled on a MIPS-style TLB: a fixed set of slots that the kernel fills on
// every miss. All writes must happen with interrupts masked on this core.
use alloc::vec::Vec;
use log::{debug, error};
use spin::Mutex;
use volatile::Volatile;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{NUM_TLB, PAGE_SIZE, TLB_WIRED};
use crate::interrupts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub vpage: VirtAddr,
    pub pframe: PhysAddr,
    pub valid: bool,
    /// Writes are allowed only through dirty entries.
    pub dirty: bool,
}

impl TlbEntry {
    pub fn new(vpage: VirtAddr, pframe: PhysAddr, dirty: bool) -> Self {
        Self { vpage, pframe, valid: true, dirty }
    }

    /// The entry `activate` leaves in slot `index`.
    pub fn invalid(index: usize) -> Self {
        Self {
            vpage: VirtAddr::new(0x8_0000_0000 + index as u64 * PAGE_SIZE),
            pframe: PhysAddr::new(0),
            valid: false,
            dirty: false,
        }
    }
}

/// Cross-core invalidation request. This VM never services one.
#[derive(Debug, Clone, Copy)]
pub struct TlbShootdown {
    pub vaddr: VirtAddr,
}

struct Slots {
    entries: Vec<Volatile<TlbEntry>>,
    /// Stand-in for the hardware random register.
    random: usize,
}

pub struct Tlb {
    slots: Mutex<Slots>,
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: (0..NUM_TLB).map(|i| Volatile::new(TlbEntry::invalid(i))).collect(),
                random: NUM_TLB - 1,
            }),
        }
    }

    pub fn read(&self, index: usize) -> TlbEntry {
        self.slots.lock().entries[index].read()
    }

    pub fn write(&self, entry: TlbEntry, index: usize) {
        assert_masked();
        self.slots.lock().entries[index].write(entry);
    }

    /// Put `entry` in a slot picked by the random register.
    pub fn write_random(&self, entry: TlbEntry) -> usize {
        assert_masked();
        let mut slots = self.slots.lock();
        let index = slots.random;
        slots.random = if index == TLB_WIRED { NUM_TLB - 1 } else { index - 1 };
        slots.entries[index].write(entry);
        index
    }

    /// Fill the first invalid slot, or a random one if every slot is valid.
    /// Returns the slot used.
    pub fn install(&self, entry: TlbEntry) -> usize {
        assert_masked();
        let mut slots = self.slots.lock();
        if let Some(index) = slots.entries.iter().position(|e| !e.read().valid) {
            slots.entries[index].write(entry);
            return index;
        }
        drop(slots);
        let index = self.write_random(entry);
        debug!("[VM] TLB full, replaced slot {}", index);
        index
    }

    /// Slot holding a valid translation for the page containing `vaddr`.
    pub fn probe(&self, vaddr: VirtAddr) -> Option<usize> {
        let vpage = vaddr.align_down(PAGE_SIZE);
        self.slots
            .lock()
            .entries
            .iter()
            .position(|e| {
                let e = e.read();
                e.valid && e.vpage == vpage
            })
    }

    pub fn invalidate_all(&self) {
        assert_masked();
        let mut slots = self.slots.lock();
        for (i, slot) in slots.entries.iter_mut().enumerate() {
            slot.write(TlbEntry::invalid(i));
        }
    }

    pub fn valid_count(&self) -> usize {
        self.slots.lock().entries.iter().filter(|e| e.read().valid).count()
    }

    pub fn shootdown(&self, request: &TlbShootdown) -> ! {
        error!("[VM] TLB shootdown requested for {:#x}", request.vaddr.as_u64());
        panic!("vm tried to do tlb shootdown?!");
    }

    pub fn shootdown_all(&self) -> ! {
        error!("[VM] TLB shootdown of all entries requested");
        panic!("vm tried to do tlb shootdown?!");
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

fn assert_masked() {
    assert!(!interrupts::are_enabled(), "TLB modified with interrupts enabled");
}
