// Saved user context and the return-to-user path
use x86_64::VirtAddr;

/// User registers captured at syscall entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64, // Syscall number in, return value out
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,    // Instruction pointer
    pub rflags: u64, // CPU flags
    pub cs: u64,
    pub ss: u64,
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self {
            rax: 0, rbx: 0, rcx: 0, rdx: 0,
            rsi: 0, rdi: 0, rbp: 0, rsp: 0,
            r8: 0, r9: 0, r10: 0, r11: 0,
            r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0, rflags: 0x202, // RFLAGS with interrupt flag set
            cs: 0x1b, ss: 0x23,   // Ring 3 selectors
        }
    }
}

impl TrapFrame {
    /// Copy of this frame as the child of a fork sees it: fork returns 0.
    pub fn for_child(&self) -> TrapFrame {
        let mut child = *self;
        child.set_return(0);
        child
    }

    pub fn set_return(&mut self, value: u64) {
        self.rax = value;
    }
}

/// Arguments for a freshly exec'd program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStart {
    pub argc: usize,
    pub argv: VirtAddr,
    pub stack: VirtAddr,
    pub entry: VirtAddr,
}

/// Drop to user mode. Neither call returns to the kernel caller.
pub trait UserEntry: Send + Sync {
    /// Resume a forked child at `frame`.
    fn enter_forked_process(&self, frame: TrapFrame) -> !;

    /// Start a program at its entry point.
    fn enter_new_process(&self, start: UserStart) -> !;
}
