// Argument vector marshalling for exec.
//
// Layout below the stack top, highest address first:
//   argv[argc-1] .. argv[0] strings, each NUL terminated, padded to 4 bytes
//   NULL pointer
//   argv[argc-1] .. argv[0] pointers, 4 bytes each
// The new stack pointer and `argv` both point at the argv[0] pointer.
use alloc::vec;
use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::config::{round_up, ARG_MAX, USER_PTR_SIZE};
use crate::memory::addrspace::AddressSpace;
use crate::process::pcb::ProcessError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgvLayout {
    pub argc: usize,
    /// Lowest address used; also the initial stack pointer.
    pub argv: VirtAddr,
    /// Bytes to place at `argv`, running up to the old stack top.
    pub image: Vec<u8>,
}

fn string_footprint(arg: &str) -> u64 {
    round_up(arg.len() as u64 + 1, USER_PTR_SIZE)
}

/// Reject argument vectors that can not be marshalled.
pub fn validate(argv: &[&str]) -> Result<(), ProcessError> {
    if argv.iter().any(|arg| arg.as_bytes().contains(&0)) {
        return Err(ProcessError::InvalidArgument);
    }
    let strings: u64 = argv.iter().map(|arg| string_footprint(arg)).sum();
    let pointers = (argv.len() as u64 + 1) * USER_PTR_SIZE;
    if strings + pointers > ARG_MAX as u64 {
        return Err(ProcessError::ArgListTooLong);
    }
    Ok(())
}

/// Lay out `argv` below `stack_top`.
pub fn build(stack_top: VirtAddr, argv: &[&str]) -> Result<ArgvLayout, ProcessError> {
    validate(argv)?;

    let strings: u64 = argv.iter().map(|arg| string_footprint(arg)).sum();
    let pointers = (argv.len() as u64 + 1) * USER_PTR_SIZE;
    let base = stack_top - (strings + pointers);
    let mut image = vec![0u8; (strings + pointers) as usize];

    // strings, last argument highest
    let mut cursor = stack_top;
    let mut addrs = vec![VirtAddr::zero(); argv.len()];
    for (i, arg) in argv.iter().enumerate().rev() {
        cursor -= string_footprint(arg);
        let offset = (cursor - base) as usize;
        image[offset..offset + arg.len()].copy_from_slice(arg.as_bytes());
        addrs[i] = cursor;
    }

    // pointer array; the NULL terminator is already zero
    for (i, addr) in addrs.iter().enumerate() {
        let offset = i * USER_PTR_SIZE as usize;
        let word = addr.as_u64() as u32;
        image[offset..offset + USER_PTR_SIZE as usize].copy_from_slice(&word.to_le_bytes());
    }

    Ok(ArgvLayout { argc: argv.len(), argv: base, image })
}

/// Build the layout and copy it onto the user stack of `aspace`.
pub fn copy_args(aspace: &AddressSpace, stack_top: VirtAddr, argv: &[&str]) -> Result<ArgvLayout, ProcessError> {
    let layout = build(stack_top, argv)?;
    aspace.copyout(layout.argv, &layout.image)?;
    Ok(layout)
}
