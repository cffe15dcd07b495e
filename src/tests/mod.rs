
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::Mutex as StdMutex;
use x86_64::VirtAddr;

use crate::config::{PAGE_SIZE, PID_MAX, USERSTACK};
use crate::process::context::TrapFrame;
use crate::process::pcb::{ProcessError, ProcessId};
use crate::services::memory_service::{FaultError, FaultKind};
use crate::syscalls::{wait_exit_status, SyscallError, SyscallNumber, SyscallResult};
use harness::{eventually, fork_frame, peek, poke, Gate, Machine, CODE_BASE, DATA_BASE};

const CHILD_RIP: u64 = CODE_BASE + 0x800;

type Log<T> = Arc<StdMutex<Vec<T>>>;

fn log<T>() -> Log<T> {
    Arc::new(StdMutex::new(Vec::new()))
}

#[test]
fn fork_exit_wait_returns_child_exit_code() {
    let m = Machine::new();
    let baseline = m.kernel.memory().frames().stats().used;
    let seen: Log<(Result<(ProcessId, i32), ProcessError>, ProcessId)> = log();

    m.on_fork(CHILD_RIP, |k, frame| {
        assert_eq!(frame.rax, 0);
        k.processes().exit(7);
    });
    let s = seen.clone();
    m.program("/bin/parent", move |k, _| {
        let child = k.processes().fork(&fork_frame(CHILD_RIP)).unwrap();
        s.lock().unwrap().push((k.processes().waitpid(child, 0), child));
    });
    let parent = m.run("/bin/parent", &["parent"]);
    m.settle();

    let seen = seen.lock().unwrap();
    let (result, child) = seen[0];
    assert_ne!(child, parent);
    assert_eq!(result, Ok((child, 7)));
    assert_eq!(m.kernel.process_count(), 0);
    assert_eq!(m.kernel.memory().frames().stats().used, baseline);
}

#[test]
fn child_writes_do_not_reach_parent_memory() {
    let m = Machine::new();
    let after: Log<Vec<u8>> = log();

    m.on_fork(CHILD_RIP, |k, _| {
        assert_eq!(peek(k, DATA_BASE, 6), b"parent");
        poke(k, DATA_BASE, b"child!");
        poke(k, USERSTACK - 16, b"smash");
    });
    let a = after.clone();
    m.program("/bin/iso", move |k, _| {
        poke(k, DATA_BASE, b"parent");
        poke(k, USERSTACK - 16, b"stack");
        let child = k.processes().fork(&fork_frame(CHILD_RIP)).unwrap();
        assert_eq!(k.processes().waitpid(child, 0), Ok((child, 0)));
        a.lock().unwrap().push(peek(k, DATA_BASE, 6));
        a.lock().unwrap().push(peek(k, USERSTACK - 16, 5));
    });
    m.run("/bin/iso", &[]);
    m.settle();

    let after = after.lock().unwrap();
    assert_eq!(after[0], b"parent");
    assert_eq!(after[1], b"stack");
}

#[test]
fn wait_blocks_until_the_child_exits() {
    let m = Machine::new();
    let gate = Gate::new();
    let order: Log<&'static str> = log();

    let (g, o) = (gate.clone(), order.clone());
    m.on_fork(CHILD_RIP, move |k, _| {
        g.wait();
        o.lock().unwrap().push("child exit");
        k.processes().exit(3);
    });
    let o = order.clone();
    m.program("/bin/waiter", move |k, _| {
        let child = k.processes().fork(&fork_frame(CHILD_RIP)).unwrap();
        let reaped = k.processes().waitpid(child, 0);
        o.lock().unwrap().push("wait returned");
        assert_eq!(reaped, Ok((child, 3)));
    });
    m.run("/bin/waiter", &[]);

    // parent is blocked in waitpid
    assert!(eventually(|| m.kernel.process_count() == 2));
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert!(order.lock().unwrap().is_empty());
    gate.open();
    m.settle();
    assert_eq!(*order.lock().unwrap(), ["child exit", "wait returned"]);
}

#[test]
fn zombie_waits_in_parent_set_until_reaped() {
    let m = Machine::new();
    let gate = Gate::new();
    let checks: Log<(Vec<ProcessId>, Vec<ProcessId>)> = log();

    m.on_fork(CHILD_RIP, |k, _| k.processes().exit(11));
    let (g, c) = (gate.clone(), checks.clone());
    m.program("/bin/reaper", move |k, _| {
        let me = k.processes().getpid().unwrap();
        let child = k.processes().fork(&fork_frame(CHILD_RIP)).unwrap();
        assert!(eventually(|| k.processes().zombies(me) == Some(alloc::vec![child])));
        g.wait();
        assert_eq!(k.processes().waitpid(child, 0), Ok((child, 11)));
        c.lock().unwrap().push((k.processes().children(me).unwrap(), k.processes().zombies(me).unwrap()));
        // the record is gone: a second wait finds no such child
        assert_eq!(k.processes().waitpid(child, 0), Err(ProcessError::NotAChild));
    });
    m.run("/bin/reaper", &[]);
    assert!(eventually(|| m.kernel.list_processes().iter().any(|(_, _, s)| *s == crate::process::ProcessState::Zombie)));
    gate.open();
    m.settle();
    assert_eq!(checks.lock().unwrap()[0], (Vec::new(), Vec::new()));
}

#[test]
fn orphans_are_destroyed_without_becoming_zombies() {
    let m = Machine::new();
    let gate = Gate::new();
    let parent_seen: Log<Option<ProcessId>> = log();
    let child_pid: Log<ProcessId> = log();

    let (g, p) = (gate.clone(), parent_seen.clone());
    m.on_fork(CHILD_RIP, move |k, _| {
        g.wait();
        p.lock().unwrap().push(k.processes().current().unwrap().family().parent);
        k.processes().exit(5);
    });
    let c = child_pid.clone();
    m.program("/bin/orphaner", move |k, _| {
        c.lock().unwrap().push(k.processes().fork(&fork_frame(CHILD_RIP)).unwrap());
        k.processes().exit(0);
    });
    let parent = m.run("/bin/orphaner", &[]);

    assert!(eventually(|| m.kernel.processes().table().get(parent).is_none()));
    assert_eq!(m.kernel.process_count(), 1);
    gate.open();
    m.settle();

    assert_eq!(*parent_seen.lock().unwrap(), [None]);
    assert_eq!(m.kernel.process_count(), 0);
    assert!(m.kernel.processes().table().get(child_pid.lock().unwrap()[0]).is_none());
}

#[test]
fn exiting_parent_discards_unreaped_zombies() {
    let m = Machine::new();
    let baseline = m.kernel.memory().frames().stats().used;

    m.on_fork(CHILD_RIP, |k, _| k.processes().exit(1));
    m.program("/bin/careless", move |k, _| {
        let me = k.processes().getpid().unwrap();
        let child = k.processes().fork(&fork_frame(CHILD_RIP)).unwrap();
        assert!(eventually(|| k.processes().zombies(me) == Some(alloc::vec![child])));
    });
    m.run("/bin/careless", &[]);
    m.settle();

    assert_eq!(m.kernel.process_count(), 0);
    assert_eq!(m.kernel.memory().frames().stats().used, baseline);
}

#[test]
fn wait_argument_errors() {
    let m = Machine::new();
    let results: Log<Result<(ProcessId, i32), ProcessError>> = log();

    let r = results.clone();
    m.program("/bin/picky", move |k, _| {
        let me = k.processes().getpid().unwrap();
        let mut r = r.lock().unwrap();
        r.push(k.processes().waitpid(0, 0));
        r.push(k.processes().waitpid(PID_MAX + 1, 0));
        r.push(k.processes().waitpid(me, 1));
        r.push(k.processes().waitpid(me, 0));
        r.push(k.processes().waitpid(PID_MAX, 0));
    });
    m.run("/bin/picky", &[]);
    m.settle();

    assert_eq!(
        *results.lock().unwrap(),
        [
            Err(ProcessError::NoSuchProcess),
            Err(ProcessError::NoSuchProcess),
            Err(ProcessError::InvalidOptions),
            Err(ProcessError::NotAChild),
            Err(ProcessError::NotAChild),
        ]
    );
}

#[test]
fn waiting_on_another_process_child_is_refused() {
    let m = Machine::new();
    let gate = Gate::new();
    let result: Log<Result<(ProcessId, i32), ProcessError>> = log();

    let g = gate.clone();
    m.program("/bin/sleeper", move |_, _| g.wait());
    let r = result.clone();
    m.program("/bin/nosy", move |k, _| {
        let victim = k.processes().list_processes().iter().find(|(_, name, _)| name == "/bin/sleeper").unwrap().0;
        r.lock().unwrap().push(k.processes().waitpid(victim, 0));
    });
    m.run("/bin/sleeper", &[]);
    m.run("/bin/nosy", &[]);
    assert!(eventually(|| result.lock().unwrap().len() == 1));
    gate.open();
    m.settle();
    assert_eq!(result.lock().unwrap()[0], Err(ProcessError::NotAChild));
}

#[test]
fn fork_runs_out_of_pids() {
    let m = Machine::new();
    let gate = Gate::new();
    let outcome: Log<(usize, Result<ProcessId, ProcessError>)> = log();

    let g = gate.clone();
    m.on_fork(CHILD_RIP, move |_, _| g.wait());
    let (g, o) = (gate.clone(), outcome.clone());
    m.program("/bin/forker", move |k, _| {
        let mut children = Vec::new();
        let failure = loop {
            match k.processes().fork(&fork_frame(CHILD_RIP)) {
                Ok(pid) => children.push(pid),
                Err(e) => break e,
            }
        };
        o.lock().unwrap().push((children.len(), Err(failure)));
        g.open();
        for child in children {
            assert_eq!(k.processes().waitpid(child, 0), Ok((child, 0)));
        }
    });
    m.run("/bin/forker", &[]);
    m.settle();

    assert_eq!(outcome.lock().unwrap()[0], (PID_MAX as usize - 1, Err(ProcessError::TooManyProcesses)));
    assert_eq!(m.kernel.process_count(), 0);
}

#[test]
fn fork_out_of_memory_unwinds_the_child() {
    // 23 free frames: one 14-frame image fits, a copy of it does not
    let m = Machine::with_config(crate::config::MachineConfig::default().with_ram_size(40 * PAGE_SIZE));
    let result: Log<(Result<ProcessId, ProcessError>, usize, Vec<u8>)> = log();

    let r = result.clone();
    m.program("/bin/big", move |k, _| {
        let me = k.processes().getpid().unwrap();
        poke(k, DATA_BASE, b"intact");
        let before = k.memory().frames().stats().used;
        let forked = k.processes().fork(&fork_frame(CHILD_RIP));
        assert_eq!(k.memory().frames().stats().used, before);
        assert!(k.processes().children(me).unwrap().is_empty());
        r.lock().unwrap().push((forked, k.process_count(), peek(k, DATA_BASE, 6)));
    });
    m.run("/bin/big", &[]);
    m.settle();

    let result = result.lock().unwrap();
    assert_eq!(result[0].0, Err(ProcessError::OutOfMemory));
    assert_eq!(result[0].1, 1);
    assert_eq!(result[0].2, b"intact");
}

#[test]
fn fork_fails_cleanly_when_no_unit_can_start() {
    let m = Machine::new();
    let gate = Gate::new();
    let result: Log<(Result<ProcessId, ProcessError>, usize)> = log();

    let (g, r) = (gate.clone(), result.clone());
    m.program("/bin/lonely", move |k, _| {
        g.wait();
        let used = k.memory().frames().stats().used;
        let forked = k.processes().fork(&fork_frame(CHILD_RIP));
        assert_eq!(k.memory().frames().stats().used, used);
        r.lock().unwrap().push((forked, k.process_count()));
    });
    m.run("/bin/lonely", &[]);
    m.sched.limit_spawns(0);
    gate.open();
    m.settle();
    assert_eq!(result.lock().unwrap()[0], (Err(ProcessError::OutOfMemory), 1));
}

#[test]
fn exec_lays_out_arguments_on_the_new_stack() {
    let m = Machine::new();
    let seen: Log<(usize, Vec<String>, u64)> = log();

    let s = seen.clone();
    m.program("/bin/echo", move |k, start| {
        let mut args = Vec::new();
        for i in 0..start.argc {
            let ptr = peek(k, start.argv.as_u64() + 4 * i as u64, 4);
            let addr = u32::from_le_bytes([ptr[0], ptr[1], ptr[2], ptr[3]]) as u64;
            let mut bytes = Vec::new();
            loop {
                let b = peek(k, addr + bytes.len() as u64, 1)[0];
                if b == 0 {
                    break;
                }
                bytes.push(b);
            }
            args.push(String::from_utf8(bytes).unwrap());
        }
        let terminator = peek(k, start.argv.as_u64() + 4 * start.argc as u64, 4);
        assert_eq!(terminator, [0, 0, 0, 0]);
        s.lock().unwrap().push((start.argc, args, start.stack.as_u64()));
    });
    m.program("/bin/sh", |k, _| {
        match k.processes().execv("/bin/echo", &["echo", "hello", "world!"]) {
            Ok(never) => match never {},
            Err(e) => panic!("exec failed: {}", e),
        }
    });
    m.run("/bin/sh", &[]);
    m.settle();

    let seen = seen.lock().unwrap();
    let (argc, args, stack) = &seen[0];
    assert_eq!(*argc, 3);
    assert_eq!(*args, ["echo", "hello", "world!"]);
    // "world!\0" 8 + "hello\0" 8 + "echo\0" 8 + 4 pointers
    assert_eq!(*stack, USERSTACK - 24 - 16);
    let start = m.user.starts().into_iter().find(|s| s.argc == 3).unwrap();
    assert_eq!(start.argv, start.stack);
}

#[test]
fn failed_exec_keeps_the_old_program() {
    let m = Machine::new();
    let results: Log<(ProcessError, Vec<u8>)> = log();

    let r = results.clone();
    m.program("/bin/stubborn", move |k, _| {
        poke(k, DATA_BASE, b"marker");
        let used = k.memory().frames().stats().used;
        for (path, argv) in [("/bin/missing", &["x"][..]), ("", &[][..]), ("/bin/stubborn", &["a\0b"][..])] {
            let err = match k.processes().execv(path, argv) {
                Ok(never) => match never {},
                Err(e) => e,
            };
            assert_eq!(k.memory().frames().stats().used, used);
            r.lock().unwrap().push((err, peek(k, DATA_BASE, 6)));
        }
    });
    m.run("/bin/stubborn", &[]);
    m.settle();

    let results = results.lock().unwrap();
    let errors: Vec<_> = results.iter().map(|(e, _)| *e).collect();
    assert_eq!(errors, [ProcessError::InvalidPath, ProcessError::InvalidPath, ProcessError::InvalidArgument]);
    assert!(results.iter().all(|(_, data)| data == b"marker"));
}

#[test]
fn successful_exec_releases_the_old_address_space() {
    let m = Machine::new();
    let usage: Log<usize> = log();
    let baseline = m.kernel.memory().frames().stats().used;

    let u = usage.clone();
    m.program("/bin/next", move |k, _| {
        u.lock().unwrap().push(k.memory().frames().stats().used);
    });
    let u = usage.clone();
    m.program("/bin/first", move |k, _| {
        u.lock().unwrap().push(k.memory().frames().stats().used);
        match k.processes().execv("/bin/next", &["next"]) {
            Ok(never) => match never {},
            Err(e) => panic!("exec failed: {}", e),
        }
    });
    m.run("/bin/first", &[]);
    m.settle();

    // one code page, one data page and the stack per image
    let image = 2 + crate::config::STACK_PAGES;
    assert_eq!(*usage.lock().unwrap(), [baseline + image, baseline + image]);
    assert_eq!(m.kernel.memory().frames().stats().used, baseline);
}

#[test]
fn run_program_reports_load_failures_synchronously() {
    let m = Machine::new();
    assert_eq!(m.kernel.run_program("/bin/none", &[]), Err(ProcessError::InvalidPath));
    assert_eq!(m.kernel.process_count(), 0);
}

#[test]
fn faults_resolve_through_the_current_process() {
    let m = Machine::new();
    let results: Log<Result<(), FaultError>> = log();

    let r = results.clone();
    m.program("/bin/touch", move |k, _| {
        let mut r = r.lock().unwrap();
        r.push(k.vm_fault(FaultKind::Read, VirtAddr::new(CODE_BASE + 0x10)));
        r.push(k.vm_fault(FaultKind::Write, VirtAddr::new(DATA_BASE + 8)));
        r.push(k.vm_fault(FaultKind::Write, VirtAddr::new(USERSTACK - 1)));
        r.push(k.vm_fault(FaultKind::Read, VirtAddr::new(0x60_0000)));
        r.push(k.vm_fault(FaultKind::ReadOnly, VirtAddr::new(CODE_BASE)));
        assert!(k.memory().tlb().probe(VirtAddr::new(DATA_BASE)).is_some());
        assert!(k.memory().tlb().probe(VirtAddr::new(0x60_0000)).is_none());
    });
    m.run("/bin/touch", &[]);
    m.settle();

    assert_eq!(
        *results.lock().unwrap(),
        [
            Ok(()),
            Ok(()),
            Ok(()),
            Err(FaultError::Segmentation(VirtAddr::new(0x60_0000))),
            Err(FaultError::ReadOnly(VirtAddr::new(CODE_BASE))),
        ]
    );
    // a unit with no process gets EFAULT
    assert_eq!(m.kernel.vm_fault(FaultKind::Read, VirtAddr::new(CODE_BASE)), Err(FaultError::NoAddressSpace));
    assert_eq!(FaultError::NoAddressSpace.code(), SyscallError::BadAddress.code());
}

#[test]
fn syscalls_dispatch_through_the_trap_frame() {
    let m = Machine::new();
    let results: Log<u64> = log();

    m.on_fork(CHILD_RIP, |k, _| {
        let mut frame = TrapFrame { rax: SyscallNumber::Exit as u64, rdi: 9, ..TrapFrame::default() };
        k.dispatch(&mut frame);
        unreachable!("exit returned");
    });
    let r = results.clone();
    m.program("/bin/raw", move |k, _| {
        let mut getpid = TrapFrame { rax: SyscallNumber::Getpid as u64, ..TrapFrame::default() };
        k.dispatch(&mut getpid);

        let mut fork = TrapFrame { rax: SyscallNumber::Fork as u64, ..fork_frame(CHILD_RIP) };
        k.dispatch(&mut fork);
        let child = fork.rax;

        let status = DATA_BASE + 0x100;
        let mut wait = TrapFrame {
            rax: SyscallNumber::Waitpid as u64,
            rdi: child,
            rsi: status,
            rdx: 0,
            ..TrapFrame::default()
        };
        k.dispatch(&mut wait);
        let code = peek(k, status, 4);

        let mut bogus = TrapFrame { rax: 42, ..TrapFrame::default() };
        k.dispatch(&mut bogus);

        let mut r = r.lock().unwrap();
        r.push(getpid.rax);
        r.push(child);
        r.push(wait.rax);
        r.push(u32::from_le_bytes([code[0], code[1], code[2], code[3]]) as u64);
        r.push(bogus.rax);
    });
    let pid = m.run("/bin/raw", &[]);
    m.settle();

    let results = results.lock().unwrap();
    assert_eq!(results[0], pid as u64);
    assert_eq!(results[2], results[1]);
    assert_eq!(results[3], wait_exit_status(9) as u64);
    assert_eq!(results[4], u64::from(SyscallResult::Error(SyscallError::InvalidSyscall)));
}

#[test]
fn execv_syscall_reads_path_and_argv_from_user_memory() {
    let m = Machine::new();
    let seen: Log<usize> = log();
    let failed: Log<u64> = log();

    let s = seen.clone();
    m.program("/bin/target", move |_, start| s.lock().unwrap().push(start.argc));
    let f = failed.clone();
    m.program("/bin/launcher", move |k, _| {
        // bad path pointer first
        let mut bad = TrapFrame { rax: SyscallNumber::Execv as u64, rdi: 0x60_0000, rsi: DATA_BASE, ..TrapFrame::default() };
        k.dispatch(&mut bad);
        f.lock().unwrap().push(bad.rax);

        poke(k, DATA_BASE + 0x100, b"/bin/target\0");
        poke(k, DATA_BASE + 0x200, b"target\0");
        poke(k, DATA_BASE + 0x210, b"-v\0");
        let mut argv = Vec::new();
        for ptr in [DATA_BASE + 0x200, DATA_BASE + 0x210, 0] {
            argv.extend_from_slice(&(ptr as u32).to_le_bytes());
        }
        poke(k, DATA_BASE, &argv);
        let mut exec = TrapFrame { rax: SyscallNumber::Execv as u64, rdi: DATA_BASE + 0x100, rsi: DATA_BASE, ..TrapFrame::default() };
        k.dispatch(&mut exec);
        unreachable!("execv returned {:#x}", exec.rax);
    });
    m.run("/bin/launcher", &[]);
    m.settle();

    assert_eq!(failed.lock().unwrap()[0], u64::from(SyscallResult::Error(SyscallError::BadAddress)));
    assert_eq!(*seen.lock().unwrap(), [2]);
}

#[test]
fn kernel_installs_once() {
    let first = Machine::new();
    let second = Machine::new();
    // other tests never install, so the first install here wins
    assert!(crate::kernel::install(first.kernel.clone()).is_ok());
    assert_eq!(
        crate::kernel::install(second.kernel.clone()),
        Err(crate::kernel::KernelError::AlreadyInstalled)
    );
    assert!(Arc::ptr_eq(crate::kernel::kernel().unwrap(), &first.kernel));

    let mut frame = TrapFrame { rax: SyscallNumber::Getpid as u64, ..TrapFrame::default() };
    crate::syscalls::syscall_entry(&mut frame);
    assert_eq!(frame.rax, u64::from(SyscallResult::Error(SyscallError::NoCurrentProcess)));
}
