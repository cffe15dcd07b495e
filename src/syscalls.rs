// src/syscalls.rs
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use lazy_static::lazy_static;
use log::{debug, warn};
use x86_64::VirtAddr;

use crate::config::{ARG_MAX, USER_PTR_SIZE};
use crate::kernel::{self, Kernel};
use crate::memory::addrspace::{AddressSpace, VmError};
use crate::process::context::TrapFrame;
use crate::process::pcb::{ProcessError, ProcessId};

/// Longest path exec accepts, terminator included.
pub const PATH_MAX: usize = 1024;

/// System call numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u64)]
pub enum SyscallNumber {
    Fork = 0,
    Execv = 2,
    Exit = 3,
    Waitpid = 4,
    Getpid = 5,
}

impl TryFrom<u64> for SyscallNumber {
    type Error = SyscallError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SyscallNumber::Fork),
            2 => Ok(SyscallNumber::Execv),
            3 => Ok(SyscallNumber::Exit),
            4 => Ok(SyscallNumber::Waitpid),
            5 => Ok(SyscallNumber::Getpid),
            _ => Err(SyscallError::InvalidSyscall),
        }
    }
}

/// System call arguments (up to 6 arguments in x86_64)
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs {
    pub arg0: u64,  // rdi
    pub arg1: u64,  // rsi
    pub arg2: u64,  // rdx
    pub arg3: u64,  // r10
    pub arg4: u64,  // r8
    pub arg5: u64,  // r9
}

impl SyscallArgs {
    pub fn from_frame(frame: &TrapFrame) -> Self {
        Self {
            arg0: frame.rdi,
            arg1: frame.rsi,
            arg2: frame.rdx,
            arg3: frame.r10,
            arg4: frame.r8,
            arg5: frame.r9,
        }
    }
}

/// System call result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallResult {
    Success(u64),
    Error(SyscallError),
}

/// System call errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall,
    InvalidArgument,
    OutOfMemory,
    TooManyProcesses,
    NoSuchProcess,
    NotAChild,
    InvalidOptions,
    NoCurrentProcess,
    BadAddress,
    InvalidPath,
    NotExecutable,
    ArgListTooLong,
    TooManyRegions,
}

impl SyscallError {
    /// Errno value reported to user space.
    pub fn code(&self) -> u64 {
        match self {
            SyscallError::InvalidSyscall => 1,   // ENOSYS
            SyscallError::TooManyRegions => 2,   // EUNIMP
            SyscallError::OutOfMemory => 3,      // ENOMEM
            SyscallError::BadAddress => 6,       // EFAULT
            SyscallError::InvalidArgument => 8,  // EINVAL
            SyscallError::InvalidOptions => 8,   // EINVAL
            SyscallError::TooManyProcesses => 11, // EMPROC
            SyscallError::NotExecutable => 13,   // ENOEXEC
            SyscallError::ArgListTooLong => 14,  // E2BIG
            SyscallError::NoSuchProcess => 15,   // ESRCH
            SyscallError::NoCurrentProcess => 15, // ESRCH
            SyscallError::NotAChild => 16,       // ECHILD
            SyscallError::InvalidPath => 19,     // ENOENT
        }
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyscallError::InvalidSyscall => write!(f, "Invalid syscall number"),
            SyscallError::InvalidArgument => write!(f, "Invalid argument"),
            SyscallError::OutOfMemory => write!(f, "Out of memory"),
            SyscallError::TooManyProcesses => write!(f, "Too many processes"),
            SyscallError::NoSuchProcess => write!(f, "No such process"),
            SyscallError::NotAChild => write!(f, "Not a child"),
            SyscallError::InvalidOptions => write!(f, "Invalid options"),
            SyscallError::NoCurrentProcess => write!(f, "No current process"),
            SyscallError::BadAddress => write!(f, "Bad address"),
            SyscallError::InvalidPath => write!(f, "Invalid path"),
            SyscallError::NotExecutable => write!(f, "Not executable"),
            SyscallError::ArgListTooLong => write!(f, "Argument list too long"),
            SyscallError::TooManyRegions => write!(f, "Too many regions"),
        }
    }
}

impl From<ProcessError> for SyscallError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::TooManyProcesses => SyscallError::TooManyProcesses,
            ProcessError::OutOfMemory => SyscallError::OutOfMemory,
            ProcessError::NoSuchProcess => SyscallError::NoSuchProcess,
            ProcessError::NotAChild => SyscallError::NotAChild,
            ProcessError::InvalidOptions => SyscallError::InvalidOptions,
            ProcessError::NoCurrentProcess => SyscallError::NoCurrentProcess,
            ProcessError::InvalidPath => SyscallError::InvalidPath,
            ProcessError::NotExecutable => SyscallError::NotExecutable,
            ProcessError::ArgListTooLong => SyscallError::ArgListTooLong,
            ProcessError::InvalidArgument => SyscallError::InvalidArgument,
            ProcessError::BadAddress => SyscallError::BadAddress,
            ProcessError::TooManyRegions => SyscallError::TooManyRegions,
        }
    }
}

impl From<VmError> for SyscallError {
    fn from(err: VmError) -> Self {
        ProcessError::from(err).into()
    }
}

impl<T: Into<u64>> From<Result<T, SyscallError>> for SyscallResult {
    fn from(result: Result<T, SyscallError>) -> Self {
        match result {
            Ok(value) => SyscallResult::Success(value.into()),
            Err(err) => SyscallResult::Error(err),
        }
    }
}

/// Convert syscall result to u64 for return value
impl From<SyscallResult> for u64 {
    fn from(result: SyscallResult) -> u64 {
        match result {
            SyscallResult::Success(value) => value,
            SyscallResult::Error(err) => {
                // Use high bit to indicate error
                0x8000_0000_0000_0000 | err.code()
            }
        }
    }
}

/// System call handler function type
pub type SyscallHandler = fn(&Kernel, &TrapFrame, SyscallArgs) -> SyscallResult;

lazy_static! {
    static ref SYSCALL_TABLE: BTreeMap<SyscallNumber, SyscallHandler> = {
        let mut table: BTreeMap<SyscallNumber, SyscallHandler> = BTreeMap::new();
        table.insert(SyscallNumber::Fork, syscall_fork);
        table.insert(SyscallNumber::Execv, syscall_execv);
        table.insert(SyscallNumber::Exit, syscall_exit);
        table.insert(SyscallNumber::Waitpid, syscall_waitpid);
        table.insert(SyscallNumber::Getpid, syscall_getpid);
        table
    };
}

/// Handle a system call. The number is in `rax`, arguments in the usual
/// argument registers.
pub fn handle_syscall(kernel: &Kernel, frame: &TrapFrame) -> SyscallResult {
    let number = match SyscallNumber::try_from(frame.rax) {
        Ok(number) => number,
        Err(e) => {
            warn!("[SYSCALL] unknown syscall {}", frame.rax);
            return SyscallResult::Error(e);
        }
    };
    let args = SyscallArgs::from_frame(frame);
    debug!("[SYSCALL] {:?} {:?}", number, args);
    match SYSCALL_TABLE.get(&number) {
        Some(handler) => handler(kernel, frame, args),
        None => SyscallResult::Error(SyscallError::InvalidSyscall),
    }
}

/// Trap-level entry: run the syscall in `frame` against the installed
/// kernel and store the encoded result in `rax`.
pub fn syscall_entry(frame: &mut TrapFrame) {
    let result = match kernel::kernel() {
        Some(kernel) => handle_syscall(kernel, frame),
        None => SyscallResult::Error(SyscallError::NoCurrentProcess),
    };
    frame.set_return(result.into());
}

// Individual syscall implementations
pub fn syscall_fork(kernel: &Kernel, frame: &TrapFrame, _args: SyscallArgs) -> SyscallResult {
    kernel.processes().fork(frame).map(u64::from).map_err(SyscallError::from).into()
}

pub fn syscall_execv(kernel: &Kernel, _frame: &TrapFrame, args: SyscallArgs) -> SyscallResult {
    let (path, argv) = match with_user_memory(kernel, |aspace| {
        let path = copyin_str(aspace, VirtAddr::try_new(args.arg0).map_err(|_| SyscallError::BadAddress)?, PATH_MAX)
            .map_err(|e| if e == SyscallError::ArgListTooLong { SyscallError::InvalidPath } else { e })?;
        let argv = copyin_argv(aspace, args.arg1)?;
        Ok((path, argv))
    }) {
        Ok(decoded) => decoded,
        Err(e) => return SyscallResult::Error(e),
    };

    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    match kernel.processes().execv(&path, &argv) {
        Ok(never) => match never {},
        Err(e) => SyscallResult::Error(e.into()),
    }
}

pub fn syscall_exit(kernel: &Kernel, _frame: &TrapFrame, args: SyscallArgs) -> SyscallResult {
    kernel.processes().exit(args.arg0 as i32)
}

/// Status word `waitpid` stores for a child that called exit: the code in
/// the upper bits, the low two bits zero.
pub fn wait_exit_status(exit_code: i32) -> i32 {
    exit_code << 2
}

pub fn syscall_waitpid(kernel: &Kernel, _frame: &TrapFrame, args: SyscallArgs) -> SyscallResult {
    let pid = match ProcessId::try_from(args.arg0) {
        Ok(pid) => pid,
        Err(_) => return SyscallResult::Error(SyscallError::NoSuchProcess),
    };
    let status = args.arg1;
    let options = args.arg2 as u32;

    let (pid, exit_code) = match kernel.processes().waitpid(pid, options) {
        Ok(reaped) => reaped,
        Err(e) => return SyscallResult::Error(e.into()),
    };
    if status != 0 {
        let stored = with_user_memory(kernel, |aspace| {
            let va = VirtAddr::try_new(status).map_err(|_| SyscallError::BadAddress)?;
            Ok(aspace.copyout(va, &wait_exit_status(exit_code).to_le_bytes())?)
        });
        if let Err(e) = stored {
            return SyscallResult::Error(e);
        }
    }
    SyscallResult::Success(u64::from(pid))
}

pub fn syscall_getpid(kernel: &Kernel, _frame: &TrapFrame, _args: SyscallArgs) -> SyscallResult {
    kernel.processes().getpid().map(u64::from).map_err(SyscallError::from).into()
}

fn with_user_memory<R>(
    kernel: &Kernel,
    f: impl FnOnce(&AddressSpace) -> Result<R, SyscallError>,
) -> Result<R, SyscallError> {
    let proc = kernel.processes().current().ok_or(SyscallError::NoCurrentProcess)?;
    proc.with_addrspace(|aspace| match aspace {
        Some(aspace) => f(aspace),
        None => Err(SyscallError::BadAddress),
    })
}

/// Read a NUL-terminated string of at most `max` bytes, terminator included.
fn copyin_str(aspace: &AddressSpace, vaddr: VirtAddr, max: usize) -> Result<String, SyscallError> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if bytes.len() >= max {
            return Err(SyscallError::ArgListTooLong);
        }
        aspace.copyin(vaddr + bytes.len() as u64, &mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    String::from_utf8(bytes).map_err(|_| SyscallError::InvalidArgument)
}

/// Read a NULL-terminated array of user pointers and the strings they name.
fn copyin_argv(aspace: &AddressSpace, argv: u64) -> Result<Vec<String>, SyscallError> {
    if argv == 0 {
        return Err(SyscallError::BadAddress);
    }
    let mut args = Vec::new();
    let mut total = 0usize;
    loop {
        let slot = VirtAddr::try_new(argv + args.len() as u64 * USER_PTR_SIZE).map_err(|_| SyscallError::BadAddress)?;
        let mut word = [0u8; USER_PTR_SIZE as usize];
        aspace.copyin(slot, &mut word)?;
        let ptr = u32::from_le_bytes(word);
        if ptr == 0 {
            break;
        }
        let remaining = ARG_MAX.saturating_sub(total);
        let arg = copyin_str(aspace, VirtAddr::new(u64::from(ptr)), remaining)?;
        total += arg.len() + 1 + USER_PTR_SIZE as usize;
        args.push(arg);
    }
    Ok(args)
}
