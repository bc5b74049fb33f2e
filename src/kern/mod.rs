//! Threading, scheduling and synchronization.
//!
//! Layering, bottom up: [`list`] provides the ordered wait lists,
//! [`thread`] the thread records and lifecycle, [`scheduler`] the ready
//! queues and dispatch, and [`sync`] the blocking primitives built on all
//! three.

pub mod list;
pub mod scheduler;
pub mod sync;
pub mod thread;
