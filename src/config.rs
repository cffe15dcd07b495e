// Machine and kernel configuration for the VM / process core
use x86_64::structures::paging::{PageSize, Size4KiB};

/// Hardware page size in bytes.
pub const PAGE_SIZE: u64 = Size4KiB::SIZE;

/// Mask selecting the page frame bits of an address.
pub const PAGE_FRAME: u64 = !(PAGE_SIZE - 1);

/// Every user stack is this many pages (48 KiB).
pub const STACK_PAGES: usize = 12;

/// Top of the user stack; the stack grows down from here.
pub const USERSTACK: u64 = 0x8000_0000;

/// Lowest address of the user stack window.
pub const USERSTACK_BASE: u64 = USERSTACK - STACK_PAGES as u64 * PAGE_SIZE;

/// Number of slots in the translation cache.
pub const NUM_TLB: usize = 64;

/// Slots below this index are never chosen by random replacement.
pub const TLB_WIRED: usize = 8;

/// Process ids live in `[PID_MIN, PID_MAX]`.
pub const PID_MIN: u32 = 1;
pub const PID_MAX: u32 = 64;

/// Upper bound on the bytes an argument vector may occupy on the new stack.
pub const ARG_MAX: usize = 16 * 1024;

/// Width of a pointer in the user calling convention.
pub const USER_PTR_SIZE: u64 = 4;

/// Kernel virtual addresses map physical memory at this offset.
pub const KERNEL_DIRECT_MAP: u64 = 0xFFFF_8000_0000_0000;

/// Size of the simulated machine and how much of it the kernel image owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    pub ram_size: u64,
    pub kernel_reserved: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size: 4 * 1024 * 1024,  // 4 MiB of RAM
            kernel_reserved: 64 * 1024, // kernel image + boot data
        }
    }
}

impl MachineConfig {
    pub fn with_ram_size(mut self, bytes: u64) -> Self {
        self.ram_size = bytes;
        self
    }

    pub fn with_kernel_reserved(mut self, bytes: u64) -> Self {
        self.kernel_reserved = bytes;
        self
    }

    /// Both sizes are rounded to whole pages; the kernel always keeps at
    /// least page 0 so that physical address zero is never handed out.
    pub fn normalized(self) -> Self {
        let reserved = round_up(self.kernel_reserved.max(PAGE_SIZE), PAGE_SIZE);
        let ram = self.ram_size & PAGE_FRAME;
        assert!(ram > reserved, "machine has no memory past the kernel image");
        Self { ram_size: ram, kernel_reserved: reserved }
    }
}

#[inline]
pub const fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Number of pages needed to hold `bytes`.
#[inline]
pub const fn pages_for(bytes: u64) -> usize {
    (round_up(bytes, PAGE_SIZE) / PAGE_SIZE) as usize
}
