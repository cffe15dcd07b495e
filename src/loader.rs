// Executable images and the lookup service exec opens them through.
//
// The file system and the on-disk executable format belong to collaborators.
// `ImageStore` is a small in-memory image table: flat segment images copied
// into an address space at fixed virtual addresses.
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use log::debug;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::memory::addrspace::{AddressSpace, Permissions, VmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    NotFound,
    NotExecutable,
    Vm(VmError),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::NotFound => write!(f, "No such executable"),
            ExecError::NotExecutable => write!(f, "Not an executable image"),
            ExecError::Vm(e) => write!(f, "Loading failed: {}", e),
        }
    }
}

impl From<VmError> for ExecError {
    fn from(err: VmError) -> Self {
        ExecError::Vm(err)
    }
}

/// An opened program image.
pub trait Executable: Send {
    /// Define regions in `aspace`, back them, fill them, and return the
    /// entry point.
    fn load(&self, aspace: &mut AddressSpace) -> Result<VirtAddr, ExecError>;
}

pub trait ExecLoader: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn Executable>, ExecError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatSegment {
    pub vaddr: VirtAddr,
    /// Size in memory; the tail past `bytes` stays zero.
    pub memsize: u64,
    pub perms: Permissions,
    pub bytes: Vec<u8>,
}

/// A program as a list of segments plus an entry point. The first segment
/// is the code region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatImage {
    pub entry: VirtAddr,
    pub segments: Vec<FlatSegment>,
}

impl FlatImage {
    pub fn new(entry: VirtAddr) -> Self {
        Self { entry, segments: Vec::new() }
    }

    pub fn segment(mut self, vaddr: VirtAddr, memsize: u64, perms: Permissions, bytes: &[u8]) -> Self {
        self.segments.push(FlatSegment { vaddr, memsize, perms, bytes: bytes.to_vec() });
        self
    }

    fn is_well_formed(&self) -> bool {
        !self.segments.is_empty()
            && self.segments.iter().all(|s| s.bytes.len() as u64 <= s.memsize)
            && self.segments.iter().any(|s| self.entry >= s.vaddr && self.entry < s.vaddr + s.memsize)
    }
}

impl Executable for Arc<FlatImage> {
    fn load(&self, aspace: &mut AddressSpace) -> Result<VirtAddr, ExecError> {
        for segment in &self.segments {
            aspace.define_region(segment.vaddr, segment.memsize, segment.perms)?;
        }
        aspace.prepare_load()?;
        for segment in &self.segments {
            aspace.copyout(segment.vaddr, &segment.bytes)?;
        }
        aspace.complete_load();
        Ok(self.entry)
    }
}

/// Path -> image table.
pub struct ImageStore {
    images: Mutex<BTreeMap<String, Arc<FlatImage>>>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self { images: Mutex::new(BTreeMap::new()) }
    }

    pub fn install(&self, path: &str, image: FlatImage) {
        self.images.lock().insert(String::from(path), Arc::new(image));
    }

    pub fn remove(&self, path: &str) -> bool {
        self.images.lock().remove(path).is_some()
    }
}

impl Default for ImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecLoader for ImageStore {
    fn open(&self, path: &str) -> Result<Box<dyn Executable>, ExecError> {
        let image = self.images.lock().get(path).cloned().ok_or(ExecError::NotFound)?;
        if !image.is_well_formed() {
            return Err(ExecError::NotExecutable);
        }
        debug!("[PROC] opened {} ({} segments)", path, image.segments.len());
        Ok(Box::new(image))
    }
}
