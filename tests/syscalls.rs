//! Exception dispatch and the syscall surface, driven through decoded
//! events exactly as the machine's run loop would deliver them.

use std::sync::Arc;

use minnow::fs::FsError;
use minnow::kern::scheduler;
use minnow::kern::thread::{self, ThreadBuilder};
use minnow::types::{ARG1_REG, ARG2_REG, ARG3_REG, NEXT_PC_REG, PAGE_SIZE, PC_REG, RETVAL_REG};
use minnow::user::exception::{self, Event, Outcome};
use minnow::user::syscall::{
    self, copy_out, read_user_byte, Syscall, SC_CREATE, SC_OPEN, SC_READ, SC_WRITE,
};
use minnow::vm::addr_space::AddressSpace;
use minnow::{Kernel, KernelOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Give the calling thread a 4-page user image to hold strings and
/// buffers.
fn attach_user_memory(kernel: &Arc<Kernel>) -> Arc<AddressSpace> {
    let image = vec![0u8; 4 * PAGE_SIZE];
    let space = AddressSpace::new(kernel, "prog", &image).unwrap();
    thread::set_space(kernel, Some(space.clone()));
    space
}

fn issue(kernel: &Arc<Kernel>, code: i32, a1: i32, a2: i32, a3: i32) -> Outcome {
    kernel.machine.write_register(RETVAL_REG, code);
    kernel.machine.write_register(ARG1_REG, a1);
    kernel.machine.write_register(ARG2_REG, a2);
    kernel.machine.write_register(ARG3_REG, a3);
    let event = exception::decode_syscall(kernel);
    let outcome = exception::handle(kernel, event);
    if outcome == Outcome::AdvancePc {
        exception::apply(kernel, outcome);
    }
    outcome
}

#[test]
fn file_syscalls_round_trip() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let _space = attach_user_memory(&kernel);

    kernel.machine.write_register(PC_REG, 0);
    kernel.machine.write_register(NEXT_PC_REG, 4);

    // Lay the path and payload into user memory.
    copy_out(&kernel, 0, b"/data\0").unwrap();
    copy_out(&kernel, 64, b"hello").unwrap();

    assert_eq!(issue(&kernel, SC_CREATE, 0, 0, 0), Outcome::AdvancePc);
    assert_eq!(kernel.machine.read_register(PC_REG), 4);
    assert!(kernel.file_system.open(&kernel, "/data").is_ok());

    assert_eq!(issue(&kernel, SC_OPEN, 0, 0, 0), Outcome::AdvancePc);
    let fd = kernel.machine.read_register(RETVAL_REG);
    assert!(fd >= 2, "open returned descriptor {fd}");

    assert_eq!(issue(&kernel, SC_WRITE, 64, 5, fd), Outcome::AdvancePc);

    // Reopen to rewind, then read back through the syscall path.
    assert_eq!(issue(&kernel, SC_OPEN, 0, 0, 0), Outcome::AdvancePc);
    let fd2 = kernel.machine.read_register(RETVAL_REG);
    assert_eq!(issue(&kernel, SC_READ, 128, 5, fd2), Outcome::AdvancePc);
    assert_eq!(kernel.machine.read_register(RETVAL_REG), 5);
    for (i, &expected) in b"hello".iter().enumerate() {
        assert_eq!(read_user_byte(&kernel, 128 + i).unwrap(), expected);
    }

    assert_eq!(
        exception::handle(&kernel, Event::Syscall(Syscall::Close { fd: fd as u32 })),
        Outcome::AdvancePc
    );
    assert!(kernel.files.get(fd as u32).is_none());
}

#[test]
fn open_of_a_missing_file_returns_a_null_descriptor() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let _space = attach_user_memory(&kernel);
    copy_out(&kernel, 0, b"/absent\0").unwrap();
    assert_eq!(issue(&kernel, SC_OPEN, 0, 0, 0), Outcome::AdvancePc);
    assert_eq!(kernel.machine.read_register(RETVAL_REG), 0);
}

#[test]
fn exec_spawns_a_thread_with_a_fresh_space() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let _space = attach_user_memory(&kernel);

    // The "executable" is just an image on disk.
    kernel.file_system.create(&kernel, "/prog", Some(256)).unwrap();
    let exec = kernel.file_system.open(&kernel, "/prog").unwrap();
    exec.write(&kernel, &[0x42u8; 256]);

    copy_out(&kernel, 0, b"/prog\0").unwrap();
    assert_eq!(issue(&kernel, syscall::SC_EXEC, 0, 0, 0), Outcome::AdvancePc);
    let child_tid = kernel.machine.read_register(RETVAL_REG);
    assert!(child_tid > 0);

    // Join the child through the syscall surface.
    assert_eq!(
        issue(&kernel, syscall::SC_JOIN, child_tid, 0, 0),
        Outcome::AdvancePc
    );
    // The child tore its image down on the way out.
    assert_eq!(
        kernel
            .file_system
            .open(&kernel, &format!("/vm_{child_tid}"))
            .unwrap_err(),
        FsError::NotFound
    );
}

#[test]
fn fork_reuses_the_parent_executable() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());

    kernel.file_system.create(&kernel, "/prog", Some(128)).unwrap();
    let exec = kernel.file_system.open(&kernel, "/prog").unwrap();
    exec.write(&kernel, &[0x17u8; 128]);

    let space = AddressSpace::new(&kernel, "/prog", &[0x17u8; 128]).unwrap();
    thread::set_space(&kernel, Some(space));

    assert_eq!(
        exception::handle(&kernel, Event::Syscall(Syscall::Fork { func_addr: 64 })),
        Outcome::AdvancePc
    );
    // Wait for the forked thread to run and finish.
    let mut spins = 0;
    while scheduler::ts(&kernel).len() > 1 && spins < 100 {
        thread::yield_now(&kernel);
        spins += 1;
    }
    assert_eq!(scheduler::ts(&kernel).len(), 1, "fork child never finished");
}

#[test]
fn exit_tears_down_the_address_space() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let owner = kernel.clone();
    let child = ThreadBuilder::new("user proc").spawn(&kernel, move |k| {
        let image = vec![7u8; 2 * PAGE_SIZE];
        let space = AddressSpace::new(k, "prog", &image).unwrap();
        let swap = space.swap_path.clone();
        thread::set_space(k, Some(space));
        assert!(k.file_system.open(k, &swap).is_ok());

        let outcome = exception::handle(&owner, Event::Syscall(Syscall::Exit { code: 3 }));
        assert_eq!(outcome, Outcome::Terminate(3));
        // The image and swap file are gone before the thread finishes.
        assert!(thread::current_space(k).is_none());
        assert_eq!(k.file_system.open(k, &swap).unwrap_err(), FsError::NotFound);
    });
    thread::join(&kernel, &child);
    assert_eq!(kernel.vm.free_frames(), kernel.machine.num_phys_pages());
}

#[test]
fn page_fault_events_resolve_and_retry() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let _space = attach_user_memory(&kernel);

    // A cold address misses the TLB.
    let vaddr = 3 * PAGE_SIZE;
    let err = kernel.machine.read_mem(&kernel, vaddr, 1).unwrap_err();
    assert_eq!(
        err,
        minnow::machine::MachineException::PageFault { vaddr }
    );
    assert_eq!(
        exception::handle(&kernel, Event::PageFault { vaddr }),
        Outcome::Reschedule
    );
    assert_eq!(kernel.machine.read_mem(&kernel, vaddr, 1).unwrap(), 0);
}

#[test]
fn unexpected_exceptions_are_fatal() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    assert!(matches!(
        exception::handle(&kernel, Event::ArithmeticError),
        Outcome::Fatal(_)
    ));
    assert!(matches!(
        exception::handle(&kernel, Event::IllegalInstruction),
        Outcome::Fatal(_)
    ));
    assert_eq!(
        exception::handle(&kernel, Event::Syscall(Syscall::Halt)),
        Outcome::Terminate(0)
    );
}

#[test]
fn yield_syscall_advances_pc() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    kernel.machine.write_register(PC_REG, 100);
    kernel.machine.write_register(NEXT_PC_REG, 104);
    assert_eq!(issue(&kernel, syscall::SC_YIELD, 0, 0, 0), Outcome::AdvancePc);
    assert_eq!(kernel.machine.read_register(PC_REG), 104);
    assert_eq!(kernel.machine.read_register(NEXT_PC_REG), 108);
}
