//! The syscall surface.
//!
//! Convention: syscall number in r2, arguments in r4..r7, result back in
//! r2, PC advanced by 4 after handling. User pointers are walked a byte
//! at a time; a page fault along the way is resolved through the pager
//! and the access retried, exactly as a faulting instruction would be.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fs::open_file::OpenFile;
use crate::kern::thread::{self, ThreadBuilder};
use crate::machine::MachineException;
use crate::types::{Tid, NEXT_PC_REG, PC_REG, RETVAL_REG};
use crate::user::exception::{FatalKind, Outcome};
use crate::vm::addr_space::AddressSpace;
use crate::vm::pager::{self, FaultResolution};
use crate::Kernel;

pub const SC_HALT: i32 = 0;
pub const SC_EXIT: i32 = 1;
pub const SC_EXEC: i32 = 2;
pub const SC_JOIN: i32 = 3;
pub const SC_CREATE: i32 = 4;
pub const SC_OPEN: i32 = 5;
pub const SC_READ: i32 = 6;
pub const SC_WRITE: i32 = 7;
pub const SC_CLOSE: i32 = 8;
pub const SC_FORK: i32 = 9;
pub const SC_YIELD: i32 = 10;

/// A decoded system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Halt,
    Exit { code: i32 },
    Exec { path_addr: usize },
    Join { tid: u32 },
    Create { path_addr: usize },
    Open { path_addr: usize },
    Read { buf_addr: usize, len: usize, fd: u32 },
    Write { buf_addr: usize, len: usize, fd: u32 },
    Close { fd: u32 },
    Fork { func_addr: usize },
    Yield,
}

impl Syscall {
    /// Decode from the register convention; `None` for an unknown code.
    pub fn decode(code: i32, a1: i32, a2: i32, a3: i32) -> Option<Self> {
        Some(match code {
            SC_HALT => Self::Halt,
            SC_EXIT => Self::Exit { code: a1 },
            SC_EXEC => Self::Exec {
                path_addr: a1 as usize,
            },
            SC_JOIN => Self::Join { tid: a1 as u32 },
            SC_CREATE => Self::Create {
                path_addr: a1 as usize,
            },
            SC_OPEN => Self::Open {
                path_addr: a1 as usize,
            },
            SC_READ => Self::Read {
                buf_addr: a1 as usize,
                len: a2 as usize,
                fd: a3 as u32,
            },
            SC_WRITE => Self::Write {
                buf_addr: a1 as usize,
                len: a2 as usize,
                fd: a3 as u32,
            },
            SC_CLOSE => Self::Close { fd: a1 as u32 },
            SC_FORK => Self::Fork {
                func_addr: a1 as usize,
            },
            SC_YIELD => Self::Yield,
            _ => return None,
        })
    }
}

// ============================================================================
// Descriptor table
// ============================================================================

/// Kernel-wide open-file table mapping descriptors to open files.
/// Descriptors 0 and 1 are reserved for the console, which lives outside
/// the core.
#[derive(Debug)]
pub struct FdTable {
    files: Mutex<BTreeMap<u32, Arc<OpenFile>>>,
    next: AtomicU32,
}

impl FdTable {
    pub(crate) fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            next: AtomicU32::new(2),
        }
    }

    pub fn insert(&self, file: OpenFile) -> u32 {
        let fd = self.next.fetch_add(1, Ordering::SeqCst);
        self.files.lock().insert(fd, Arc::new(file));
        fd
    }

    pub fn get(&self, fd: u32) -> Option<Arc<OpenFile>> {
        self.files.lock().get(&fd).cloned()
    }

    pub fn close(&self, fd: u32) -> bool {
        self.files.lock().remove(&fd).is_some()
    }
}

// ============================================================================
// User-memory access with fault retry
// ============================================================================

/// Read one byte of user memory, resolving page faults on the way.
pub fn read_user_byte(kernel: &Kernel, addr: usize) -> Result<u8, MachineException> {
    loop {
        match kernel.machine.read_mem(kernel, addr, 1) {
            Ok(value) => return Ok(value as u8),
            Err(MachineException::PageFault { vaddr }) => {
                if pager::page_fault(kernel, vaddr) == FaultResolution::Unresolvable {
                    thread::yield_now(kernel);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Write one byte of user memory, resolving page faults on the way.
pub fn write_user_byte(kernel: &Kernel, addr: usize, byte: u8) -> Result<(), MachineException> {
    loop {
        match kernel.machine.write_mem(kernel, addr, 1, byte as i32) {
            Ok(()) => return Ok(()),
            Err(MachineException::PageFault { vaddr }) => {
                if pager::page_fault(kernel, vaddr) == FaultResolution::Unresolvable {
                    thread::yield_now(kernel);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Copy a NUL-terminated string out of user memory.
pub fn copy_in_string(kernel: &Kernel, addr: usize) -> Result<String, MachineException> {
    let mut bytes = Vec::new();
    let mut at = addr;
    loop {
        let byte = read_user_byte(kernel, at)?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        at += 1;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn copy_in(kernel: &Kernel, addr: usize, len: usize) -> Result<Vec<u8>, MachineException> {
    (0..len).map(|i| read_user_byte(kernel, addr + i)).collect()
}

pub fn copy_out(kernel: &Kernel, addr: usize, bytes: &[u8]) -> Result<(), MachineException> {
    for (i, &byte) in bytes.iter().enumerate() {
        write_user_byte(kernel, addr + i, byte)?;
    }
    Ok(())
}

// ============================================================================
// Dispatch
// ============================================================================

/// Execute one system call on behalf of the current thread.
pub(crate) fn dispatch(kernel: &Arc<Kernel>, sys: Syscall) -> Outcome {
    log::debug!(target: "minnow::syscall", "tid={} {sys:?}", thread::current(kernel));
    match sys {
        Syscall::Halt => Outcome::Terminate(0),

        Syscall::Exit { code } => {
            if let Some(space) = thread::current_space(kernel) {
                thread::set_space(kernel, None);
                space.destroy(kernel);
            }
            Outcome::Terminate(code)
        }

        Syscall::Create { path_addr } => {
            let Ok(path) = copy_in_string(kernel, path_addr) else {
                return Outcome::Fatal(FatalKind::BadUserPointer);
            };
            if let Err(err) = kernel.file_system.create(kernel, &path, Some(0)) {
                log::debug!(target: "minnow::syscall", "create {path}: {err}");
            }
            Outcome::AdvancePc
        }

        Syscall::Open { path_addr } => {
            let Ok(path) = copy_in_string(kernel, path_addr) else {
                return Outcome::Fatal(FatalKind::BadUserPointer);
            };
            let fd = match kernel.file_system.open(kernel, &path) {
                Ok(file) => kernel.files.insert(file) as i32,
                Err(_) => 0,
            };
            kernel.machine.write_register(RETVAL_REG, fd);
            Outcome::AdvancePc
        }

        Syscall::Close { fd } => {
            kernel.files.close(fd);
            Outcome::AdvancePc
        }

        Syscall::Read { buf_addr, len, fd } => {
            let read = match kernel.files.get(fd) {
                Some(file) => {
                    let mut data = vec![0u8; len];
                    let got = file.read(kernel, &mut data);
                    if copy_out(kernel, buf_addr, &data[..got]).is_err() {
                        return Outcome::Fatal(FatalKind::BadUserPointer);
                    }
                    got
                }
                None => 0,
            };
            kernel.machine.write_register(RETVAL_REG, read as i32);
            Outcome::AdvancePc
        }

        Syscall::Write { buf_addr, len, fd } => {
            let Ok(data) = copy_in(kernel, buf_addr, len) else {
                return Outcome::Fatal(FatalKind::BadUserPointer);
            };
            if let Some(file) = kernel.files.get(fd) {
                file.write(kernel, &data);
            }
            Outcome::AdvancePc
        }

        Syscall::Exec { path_addr } => {
            let Ok(path) = copy_in_string(kernel, path_addr) else {
                return Outcome::Fatal(FatalKind::BadUserPointer);
            };
            let tid = match kernel.file_system.open(kernel, &path) {
                Ok(exec) => {
                    let mut image = vec![0u8; exec.length(kernel)];
                    exec.read_at(kernel, &mut image, 0);
                    let handle = ThreadBuilder::new("ExecThread").spawn(kernel, move |k| {
                        run_image(k, &path, &image, None);
                        teardown_space(k);
                    });
                    handle.tid.0 as i32
                }
                Err(_) => -1,
            };
            kernel.machine.write_register(RETVAL_REG, tid);
            Outcome::AdvancePc
        }

        Syscall::Fork { func_addr } => {
            let Some(space) = thread::current_space(kernel) else {
                log::warn!(target: "minnow::syscall", "fork from a thread with no address space");
                return Outcome::AdvancePc;
            };
            let exec_name = space.exec_name.clone();
            ThreadBuilder::new("ForkThread").spawn(kernel, move |k| {
                match k.file_system.open(k, &exec_name) {
                    Ok(exec) => {
                        let mut image = vec![0u8; exec.length(k)];
                        exec.read_at(k, &mut image, 0);
                        run_image(k, &exec_name, &image, Some(func_addr));
                        teardown_space(k);
                    }
                    Err(err) => {
                        log::error!(target: "minnow::syscall", "fork: cannot reopen {exec_name}: {err}")
                    }
                }
            });
            Outcome::AdvancePc
        }

        Syscall::Yield => {
            thread::yield_now(kernel);
            Outcome::AdvancePc
        }

        Syscall::Join { tid } => {
            thread::join_tid(kernel, Tid(tid));
            Outcome::AdvancePc
        }
    }
}

/// What `Exit` does to the current thread's image; `Exec`/`Fork` bodies
/// run it on the way out because no interpreter is attached to keep the
/// program alive.
fn teardown_space(kernel: &Kernel) {
    if let Some(space) = thread::current_space(kernel) {
        thread::set_space(kernel, None);
        space.destroy(kernel);
    }
}

/// Body of an `Exec`/`Fork` thread: build the address space, point the
/// registers at the entry, and install the MMU view. Running the
/// instruction stream itself belongs to the machine interpreter, outside
/// the core.
fn run_image(kernel: &Kernel, exec_name: &str, image: &[u8], entry: Option<usize>) {
    match AddressSpace::new(kernel, exec_name, image) {
        Ok(space) => {
            thread::set_space(kernel, Some(space.clone()));
            space.init_registers(kernel);
            if let Some(func) = entry {
                kernel.machine.write_register(PC_REG, func as i32);
                kernel.machine.write_register(NEXT_PC_REG, (func + 4) as i32);
            }
            space.restore_state(kernel);
        }
        Err(err) => {
            log::error!(target: "minnow::syscall", "cannot build address space for {exec_name}: {err}")
        }
    }
}
