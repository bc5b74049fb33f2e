//! Named pipes.
//!
//! A pipe is a bounded mailbox backed by a regular file: `read` appends
//! incoming bytes (refusing once [`MAX_PIPE_LEN`] would be exceeded) and
//! `write` drains everything buffered in one call, resetting the count.
//! These are not POSIX streams.

use parking_lot::Mutex;

use crate::fs::open_file::OpenFile;
use crate::fs::FsError;
use crate::kern::sync::Lock;
use crate::Kernel;

/// Capacity of a pipe's mailbox.
pub const MAX_PIPE_LEN: usize = 128;

#[derive(Debug)]
struct PipeState {
    file: Option<OpenFile>,
    length: usize,
}

/// A named pipe, addressed as a file.
#[derive(Debug)]
pub struct PipeFile {
    path: String,
    lock: Lock,
    state: Mutex<PipeState>,
}

impl PipeFile {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            lock: Lock::new("pipe lock"),
            state: Mutex::new(PipeState {
                file: None,
                length: 0,
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create and open the backing file.
    pub fn open(&self, kernel: &Kernel) -> Result<(), FsError> {
        kernel.file_system.create(kernel, &self.path, Some(0))?;
        let file = kernel.file_system.open(kernel, &self.path)?;
        self.state.lock().file = Some(file);
        Ok(())
    }

    /// Append `data` to the mailbox. Refused (false) when it would not
    /// fit.
    pub fn read(&self, kernel: &Kernel, data: &[u8]) -> bool {
        self.lock.acquire(kernel);
        let accepted = {
            let mut st = self.state.lock();
            if st.length + data.len() > MAX_PIPE_LEN {
                false
            } else {
                let at = st.length;
                st.file
                    .as_ref()
                    .expect("pipe opened before use")
                    .write_at(kernel, data, at);
                st.length += data.len();
                true
            }
        };
        self.lock.release(kernel);
        accepted
    }

    /// Drain the whole mailbox, resetting the buffered count to zero.
    pub fn write(&self, kernel: &Kernel) -> Vec<u8> {
        self.lock.acquire(kernel);
        let drained = {
            let mut st = self.state.lock();
            let mut out = vec![0u8; st.length];
            if st.length > 0 {
                st.file
                    .as_ref()
                    .expect("pipe opened before use")
                    .read_at(kernel, &mut out, 0);
                st.length = 0;
            }
            out
        };
        self.lock.release(kernel);
        drained
    }

    /// Tear down the backing file.
    pub fn remove(&self, kernel: &Kernel) -> Result<(), FsError> {
        self.state.lock().file = None;
        kernel.file_system.remove(kernel, &self.path)
    }
}
