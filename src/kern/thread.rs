//! Kernel threads.
//!
//! A thread is a record in the scheduler's table: identity, name, run
//! state, scheduling attributes, saved user registers and an optional
//! owned address space. Identifiers come from a fixed pool of
//! [`MAX_THREADS`]; a finished thread is reaped by the next thread to run
//! before its tid can be reused, and every tid carries an epoch so a
//! [`JoinHandle`] can never alias a recycled identifier.
//!
//! Execution is cooperative on the one simulated CPU. Each thread is
//! backed by a host thread parked on a private [`Slot`]; exactly one slot
//! holds the baton at any time, so a context switch is: publish the next
//! thread as current, post its slot, block on our own. All switch points
//! are the documented suspension points (yield, sleep, slice expiry,
//! finish), which keeps interleavings fully scheduler-determined.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::kern::list::WaitList;
use crate::kern::scheduler;
use crate::machine::interrupt::{IntGuard, IntStatus};
use crate::types::{
    time_slice_for, Tid, DEFAULT_PRIORITY, HIGHEST_PRIORITY, LOWEST_PRIORITY, NUM_TOTAL_REGS,
};
use crate::vm::addr_space::AddressSpace;
use crate::Kernel;

/// Run state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created but never forked.
    JustCreated,
    /// On the ready queue.
    Ready,
    /// The one thread holding the CPU.
    Running,
    /// On some wait list.
    Blocked,
    /// Finished, awaiting reap.
    Zombie,
}

/// The baton parking slot backing one thread.
///
/// A binary permit: `post` stores it, `block` consumes it, waiting if it
/// has not been stored yet. Post-before-block is therefore safe.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl Slot {
    pub(crate) fn post(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.cv.notify_one();
    }

    pub(crate) fn block(&self) {
        let mut ready = self.ready.lock();
        while !*ready {
            self.cv.wait(&mut ready);
        }
        *ready = false;
    }
}

/// One live thread's record in the scheduler table.
#[derive(Debug)]
pub(crate) struct ThreadEntry {
    pub tid: Tid,
    pub epoch: u64,
    pub name: String,
    pub user_id: i32,
    pub state: ThreadState,
    pub base_priority: i32,
    pub effective_priority: i32,
    pub time_slice: u64,
    pub ticks_used: u64,
    pub last_ready_tick: u64,
    pub slot: Arc<Slot>,
    pub joiners: WaitList,
    pub user_regs: [i32; NUM_TOTAL_REGS],
    pub space: Option<Arc<AddressSpace>>,
}

/// Handle for joining a forked thread. Carries the tid's epoch, so joining
/// after the tid has been recycled returns immediately instead of blocking
/// on a stranger.
#[derive(Debug, Clone)]
pub struct JoinHandle {
    pub tid: Tid,
    pub(crate) epoch: u64,
}

// ============================================================================
// Forking
// ============================================================================

/// Builder for a new kernel thread.
pub struct ThreadBuilder {
    name: String,
    priority: i32,
    user_id: i32,
}

impl ThreadBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            priority: DEFAULT_PRIORITY,
            user_id: 0,
        }
    }

    /// Base scheduling priority; smaller is better. Clamped to the valid
    /// range.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority.clamp(HIGHEST_PRIORITY, LOWEST_PRIORITY);
        self
    }

    pub fn user_id(mut self, user_id: i32) -> Self {
        self.user_id = user_id;
        self
    }

    /// Fork: allocate a tid (fatal when the pool is exhausted), arrange
    /// first entry into `f`, mark the thread ready. If the new thread has
    /// strictly better priority than the caller, a preemption is posted
    /// and honored at the next safe point.
    pub fn spawn(
        self,
        kernel: &Arc<Kernel>,
        f: impl FnOnce(&Kernel) + Send + 'static,
    ) -> JoinHandle {
        let _guard = IntGuard::off(kernel);
        let (tid, epoch, slot) =
            scheduler::register_thread(kernel, self.name.clone(), self.priority, self.user_id);
        log::debug!(target: "minnow::thread", "fork {} (tid={tid}, pri={})", self.name, self.priority);

        let owner = Arc::clone(kernel);
        std::thread::Builder::new()
            .name(format!("minnow-{}", self.name))
            .spawn(move || {
                slot.block();
                scheduler::resume_hook(&owner);
                // First return into a brand-new thread: the switch that
                // dispatched us ran with interrupts masked, so unmask
                // before entering the thread body.
                owner.interrupt.set_level(&owner, IntStatus::On);
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    f(&owner);
                }));
                if let Err(payload) = outcome {
                    owner.note_panic();
                    log::error!(
                        target: "minnow::thread",
                        "kernel thread {tid} panicked: {}",
                        panic_text(&payload)
                    );
                }
                finish(&owner);
            })
            .expect("host thread spawn failed");

        scheduler::ready_to_run(kernel, tid);
        JoinHandle { tid, epoch }
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}

// ============================================================================
// Operations on the current thread
// ============================================================================

/// The tid of the running thread.
pub fn current(kernel: &Kernel) -> Tid {
    kernel.scheduler.core.lock().current
}

/// The running thread's name.
pub fn current_name(kernel: &Kernel) -> String {
    let core = kernel.scheduler.core.lock();
    let cur = core.current;
    core.threads
        .get(&cur)
        .map(|e| e.name.clone())
        .unwrap_or_default()
}

/// Voluntarily give up the CPU. The caller is requeued ready and runs
/// again once the scheduler picks it.
pub fn yield_now(kernel: &Kernel) {
    let _guard = IntGuard::off(kernel);
    let cur = current(kernel);
    log::trace!(target: "minnow::thread", "yield, tid={cur}");
    scheduler::ready_to_run(kernel, cur);
    scheduler::reschedule(kernel, false);
}

/// Block the current thread. The caller must have masked interrupts and
/// queued itself on some wait list first; on return the thread has been
/// woken and interrupts are still masked.
pub(crate) fn sleep_current(kernel: &Kernel) {
    debug_assert_eq!(kernel.interrupt.level(), IntStatus::Off);
    {
        let mut core = kernel.scheduler.core.lock();
        let cur = core.current;
        core.thread_mut(cur).state = ThreadState::Blocked;
    }
    scheduler::reschedule(kernel, false);
}

/// Terminate the current thread: wake joiners, mark it a zombie, and hand
/// the CPU to the next thread, which frees this record before running
/// anything else. Returns to the caller exactly once so the host thread
/// can unwind; the thread is no longer schedulable at that point.
pub(crate) fn finish(kernel: &Kernel) {
    kernel.interrupt.set_level(kernel, IntStatus::Off);
    let woken = {
        let mut core = kernel.scheduler.core.lock();
        let cur = core.current;
        let entry = core.thread_mut(cur);
        entry.state = ThreadState::Zombie;
        log::debug!(target: "minnow::thread", "finish, tid={cur}");
        entry.joiners.drain()
    };
    for joiner in woken {
        scheduler::ready_to_run(kernel, joiner);
    }
    scheduler::reschedule(kernel, true);
}

/// Wait until the thread behind `handle` has finished. Returns at once if
/// it already has (or its tid was recycled for a newer thread).
pub fn join(kernel: &Kernel, handle: &JoinHandle) {
    {
        let _guard = IntGuard::off(kernel);
        loop {
            let mut core = kernel.scheduler.core.lock();
            let live = core
                .threads
                .get(&handle.tid)
                .is_some_and(|e| e.epoch == handle.epoch && e.state != ThreadState::Zombie);
            if !live {
                break;
            }
            let cur = core.current;
            core.thread_mut(cur).state = ThreadState::Blocked;
            core.thread_mut(handle.tid).joiners.append(cur);
            drop(core);
            scheduler::reschedule(kernel, false);
        }
    }
    if kernel.has_panicked() {
        panic!("a kernel thread panicked while this thread was joining it");
    }
}

/// Join by raw tid, for the syscall surface. Waits on whichever thread
/// currently owns the tid, if any.
pub(crate) fn join_tid(kernel: &Kernel, tid: Tid) {
    let epoch = {
        let core = kernel.scheduler.core.lock();
        match core.threads.get(&tid) {
            Some(e) => e.epoch,
            None => return,
        }
    };
    join(kernel, &JoinHandle { tid, epoch });
}

/// Set the user identifier of the current thread.
pub fn set_user_id(kernel: &Kernel, user_id: i32) {
    let mut core = kernel.scheduler.core.lock();
    let cur = core.current;
    core.thread_mut(cur).user_id = user_id;
}

/// Change the current thread's base priority; takes effect immediately
/// for preemption comparisons.
pub fn set_priority(kernel: &Kernel, priority: i32) {
    let cur = current(kernel);
    scheduler::change_priority(kernel, cur, priority);
}

/// Attach (or detach) an address space to the current thread and install
/// it as the machine's MMU view.
pub fn set_space(kernel: &Kernel, space: Option<Arc<AddressSpace>>) {
    let _guard = IntGuard::off(kernel);
    {
        let mut core = kernel.scheduler.core.lock();
        let cur = core.current;
        core.thread_mut(cur).space = space.clone();
    }
    kernel.machine.set_active_space(kernel, space);
}

/// The current thread's address space, if it owns one.
pub fn current_space(kernel: &Kernel) -> Option<Arc<AddressSpace>> {
    let core = kernel.scheduler.core.lock();
    let cur = core.current;
    core.threads.get(&cur).and_then(|e| e.space.clone())
}

pub(crate) fn new_entry(
    tid: Tid,
    epoch: u64,
    name: String,
    priority: i32,
    user_id: i32,
    now: u64,
) -> ThreadEntry {
    let priority = priority.clamp(HIGHEST_PRIORITY, LOWEST_PRIORITY);
    ThreadEntry {
        tid,
        epoch,
        name,
        user_id,
        state: ThreadState::JustCreated,
        base_priority: priority,
        effective_priority: priority,
        time_slice: time_slice_for(priority),
        ticks_used: 0,
        last_ready_tick: now,
        slot: Arc::new(Slot::default()),
        joiners: WaitList::new(),
        user_regs: [0; NUM_TOTAL_REGS],
        space: None,
    }
}
