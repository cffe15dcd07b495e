// Physical RAM of the simulated machine.
//
// Kernel code reaches physical memory through the direct map; here that is a
// byte array indexed by physical address.
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::PhysAddr;

use crate::config::MachineConfig;

pub struct Ram {
    bytes: Mutex<Vec<u8>>,
    /// First address past the kernel image.
    firstfree: PhysAddr,
    top: PhysAddr,
}

impl Ram {
    pub fn new(config: MachineConfig) -> Self {
        let config = config.normalized();
        Self {
            bytes: Mutex::new(vec![0; config.ram_size as usize]),
            firstfree: PhysAddr::new(config.kernel_reserved),
            top: PhysAddr::new(config.ram_size),
        }
    }

    /// `(firstfree, top)` of memory the kernel image does not occupy.
    pub fn getsize(&self) -> (PhysAddr, PhysAddr) {
        (self.firstfree, self.top)
    }

    pub fn zero(&self, paddr: PhysAddr, len: usize) {
        let start = self.index(paddr, len);
        self.bytes.lock()[start..start + len].fill(0);
    }

    pub fn copy(&self, dst: PhysAddr, src: PhysAddr, len: usize) {
        let from = self.index(src, len);
        let to = self.index(dst, len);
        self.bytes.lock().copy_within(from..from + len, to);
    }

    pub fn read(&self, paddr: PhysAddr, buf: &mut [u8]) {
        let start = self.index(paddr, buf.len());
        buf.copy_from_slice(&self.bytes.lock()[start..start + buf.len()]);
    }

    pub fn write(&self, paddr: PhysAddr, data: &[u8]) {
        let start = self.index(paddr, data.len());
        self.bytes.lock()[start..start + data.len()].copy_from_slice(data);
    }

    fn index(&self, paddr: PhysAddr, len: usize) -> usize {
        let end = paddr.as_u64() + len as u64;
        assert!(
            end <= self.top.as_u64(),
            "physical access {:#x}+{:#x} past end of RAM",
            paddr.as_u64(),
            len
        );
        paddr.as_u64() as usize
    }
}
