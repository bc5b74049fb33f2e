//! Exception dispatch.
//!
//! The machine delivers a fully decoded [`Event`]; the handler returns an
//! [`Outcome`] and never touches the PC itself, which keeps every branch
//! testable. The run loop applies the outcome: advance past a handled
//! syscall, re-run a faulted access, terminate the thread, or die on an
//! exception no user program should raise.

use std::sync::Arc;

use crate::kern::thread;
use crate::types::{ARG1_REG, ARG2_REG, ARG3_REG, RETVAL_REG};
use crate::user::syscall::{self, Syscall};
use crate::vm::pager::{self, FaultResolution};
use crate::Kernel;

/// A decoded reason for entering the kernel from user mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Syscall(Syscall),
    PageFault { vaddr: usize },
    AddressError { vaddr: usize },
    ArithmeticError,
    IllegalInstruction,
}

/// What the machine should do after the kernel handled an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Step past the syscall instruction.
    AdvancePc,
    /// Leave the PC alone so the faulting access re-runs (the handler may
    /// already have yielded the CPU on the way).
    Reschedule,
    /// The current thread is done; finish it with this exit code.
    Terminate(i32),
    /// No recovery.
    Fatal(FatalKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    UnexpectedUserException,
    BadUserPointer,
}

/// Decode the syscall convention: number in r2, arguments in r4..r7.
pub fn decode_syscall(kernel: &Kernel) -> Event {
    let code = kernel.machine.read_register(RETVAL_REG);
    let a1 = kernel.machine.read_register(ARG1_REG);
    let a2 = kernel.machine.read_register(ARG2_REG);
    let a3 = kernel.machine.read_register(ARG3_REG);
    match Syscall::decode(code, a1, a2, a3) {
        Some(sys) => Event::Syscall(sys),
        None => Event::IllegalInstruction,
    }
}

/// Handle one event. Page faults resolve through the pager; when local
/// replacement has nothing to evict the thread yields and the access
/// simply retries. Anything that is neither a syscall nor a page fault
/// is fatal.
pub fn handle(kernel: &Arc<Kernel>, event: Event) -> Outcome {
    match event {
        Event::Syscall(sys) => syscall::dispatch(kernel, sys),
        Event::PageFault { vaddr } => {
            match pager::page_fault(kernel, vaddr) {
                FaultResolution::Resolved => {}
                FaultResolution::Unresolvable => thread::yield_now(kernel),
            }
            Outcome::Reschedule
        }
        Event::AddressError { vaddr } => {
            log::error!(target: "minnow::exception", "address error at {vaddr:#x}");
            Outcome::Fatal(FatalKind::UnexpectedUserException)
        }
        Event::ArithmeticError | Event::IllegalInstruction => {
            log::error!(target: "minnow::exception", "unexpected user exception: {event:?}");
            Outcome::Fatal(FatalKind::UnexpectedUserException)
        }
    }
}

/// Apply an outcome on behalf of the run loop.
///
/// `Terminate` finishes the current thread, so it only returns for the
/// other variants.
pub fn apply(kernel: &Arc<Kernel>, outcome: Outcome) {
    match outcome {
        Outcome::AdvancePc => kernel.machine.advance_pc(),
        Outcome::Reschedule => {}
        Outcome::Terminate(code) => {
            log::debug!(target: "minnow::exception", "terminating with code {code}");
            thread::finish(kernel);
        }
        Outcome::Fatal(kind) => panic!("fatal user exception: {kind:?}"),
    }
}
