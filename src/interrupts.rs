// src/interrupts.rs
//
// Interrupt priority handling for the VM core. TLB edits run with interrupts
// masked on the current core; nothing here is a cross-core lock.
use x86_64::structures::idt::PageFaultErrorCode;

use crate::services::memory_service::FaultKind;

/// Interrupts stay masked until this guard drops (`splhigh` / `splx`).
#[must_use = "interrupts are unmasked again as soon as the guard is dropped"]
pub struct SplGuard {
    was_enabled: bool,
}

/// Mask interrupts on the current core.
pub fn splhigh() -> SplGuard {
    let was_enabled = are_enabled();
    disable();
    depth::enter();
    SplGuard { was_enabled }
}

impl Drop for SplGuard {
    fn drop(&mut self) {
        let depth = depth::leave();
        assert!(depth > 0, "splx without matching splhigh");
        if self.was_enabled && depth == 1 {
            enable();
        }
    }
}

/// Run `f` with interrupts masked, restoring the previous level afterwards.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _spl = splhigh();
    f()
}

/// Whether interrupts are currently enabled on this core.
pub fn are_enabled() -> bool {
    hw::are_enabled() && depth::current() == 0
}

fn disable() {
    hw::disable();
}

fn enable() {
    hw::enable();
}

/// Nesting depth of masked sections on the current core.
#[cfg(not(test))]
mod depth {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static MASK_DEPTH: AtomicUsize = AtomicUsize::new(0);

    pub fn enter() {
        MASK_DEPTH.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the depth before leaving.
    pub fn leave() -> usize {
        MASK_DEPTH.fetch_sub(1, Ordering::AcqRel)
    }

    pub fn current() -> usize {
        MASK_DEPTH.load(Ordering::Acquire)
    }
}


#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod hw {
    use x86_64::instructions::interrupts;

    pub fn are_enabled() -> bool {
        interrupts::are_enabled()
    }

    pub fn disable() {
        interrupts::disable();
    }

    pub fn enable() {
        interrupts::enable();
    }
}

// Hosted builds have no interrupt flag to flip; the depth counter alone
// models the masked state.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod hw {
    pub fn are_enabled() -> bool {
        true
    }

    pub fn disable() {}

    pub fn enable() {}
}

/// Decode a page-fault error code into the fault kind the VM understands.
pub fn fault_kind(error_code: PageFaultErrorCode) -> FaultKind {
    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let present = error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);
    match (present, write) {
        (true, true) => FaultKind::ReadOnly,
        (false, true) => FaultKind::Write,
        _ => FaultKind::Read,
    }
}
