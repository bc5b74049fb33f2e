//! The scheduler: ready queues, dispatch, aging and preemption.
//!
//! Policy:
//! 1. The next thread to run is the ready thread with the smallest
//!    effective-priority value; FIFO within a priority class.
//! 2. While a thread waits on the ready queue it ages: its effective
//!    priority improves by one for every `aging_ticks` ticks elapsed
//!    since it last became ready, down to the floor, so low-priority
//!    work cannot starve forever.
//! 3. A thread that exhausts its time slice is requeued at the tail of
//!    its class and a reschedule is forced.
//! 4. Readying a thread whose effective priority is strictly better than
//!    the running thread's posts a preemption, honored at the next safe
//!    point (when interrupts come back on).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::kern::list::WaitList;
use crate::kern::thread::{new_entry, Slot, ThreadEntry, ThreadState};
use crate::types::{time_slice_for, Tid, HIGHEST_PRIORITY, LOWEST_PRIORITY, MAX_THREADS};
use crate::utilities::Bitmap;
use crate::Kernel;

// ============================================================================
// Ready queue
// ============================================================================

/// One FIFO wait list per effective-priority value.
#[derive(Debug)]
pub(crate) struct RunQueue {
    classes: Vec<WaitList>,
    count: usize,
}

impl RunQueue {
    fn new() -> Self {
        Self {
            classes: (HIGHEST_PRIORITY..=LOWEST_PRIORITY)
                .map(|_| WaitList::new())
                .collect(),
            count: 0,
        }
    }

    fn insert(&mut self, tid: Tid, effective_priority: i32) {
        self.classes[effective_priority as usize].append(tid);
        self.count += 1;
    }

    fn remove_front(&mut self) -> Option<Tid> {
        for class in self.classes.iter_mut() {
            if let Some(tid) = class.remove_front() {
                self.count -= 1;
                return Some(tid);
            }
        }
        None
    }

    fn remove(&mut self, tid: Tid, hint: i32) -> bool {
        if self.classes[hint as usize].remove(tid) {
            self.count -= 1;
            return true;
        }
        for class in self.classes.iter_mut() {
            if class.remove(tid) {
                self.count -= 1;
                return true;
            }
        }
        false
    }

    fn drain(&mut self) -> Vec<Tid> {
        let mut out = Vec::with_capacity(self.count);
        while let Some(tid) = self.remove_front() {
            out.push(tid);
        }
        out
    }
}

// ============================================================================
// Scheduler core
// ============================================================================

/// All mutable thread/scheduling state, guarded by one lock: the software
/// stand-in for "interrupts are off" on the single simulated CPU.
#[derive(Debug)]
pub(crate) struct Core {
    pub threads: BTreeMap<Tid, ThreadEntry>,
    pub tid_pool: Bitmap,
    pub epochs: Vec<u64>,
    pub ready: RunQueue,
    pub current: Tid,
    pub to_reap: Vec<ThreadEntry>,
}

impl Core {
    pub(crate) fn thread_mut(&mut self, tid: Tid) -> &mut ThreadEntry {
        self.threads.get_mut(&tid).expect("live thread")
    }
}

#[derive(Debug)]
pub struct Scheduler {
    pub(crate) core: Mutex<Core>,
    aging_ticks: u64,
}

impl Scheduler {
    pub(crate) fn new(aging_ticks: u64) -> Self {
        Self {
            core: Mutex::new(Core {
                threads: BTreeMap::new(),
                tid_pool: Bitmap::new(MAX_THREADS),
                epochs: vec![0; MAX_THREADS],
                ready: RunQueue::new(),
                current: Tid::MAIN,
                to_reap: Vec::new(),
            }),
            aging_ticks,
        }
    }
}

/// Adopt the host thread calling [`Kernel::new`] as the running main
/// thread.
pub(crate) fn bootstrap_main(kernel: &Kernel) {
    let mut core = kernel.scheduler.core.lock();
    let idx = core.tid_pool.find().expect("fresh tid pool");
    debug_assert_eq!(idx, 0);
    let mut entry = new_entry(Tid::MAIN, 0, "main".to_owned(), crate::types::DEFAULT_PRIORITY, 0, 0);
    entry.state = ThreadState::Running;
    core.threads.insert(Tid::MAIN, entry);
    core.current = Tid::MAIN;
}

/// Allocate a tid and install a just-created thread record.
/// Panics when the pool is exhausted.
pub(crate) fn register_thread(
    kernel: &Kernel,
    name: String,
    priority: i32,
    user_id: i32,
) -> (Tid, u64, Arc<Slot>) {
    let now = kernel.interrupt.ticks();
    let mut core = kernel.scheduler.core.lock();
    let idx = core
        .tid_pool
        .find()
        .expect("thread identifier pool exhausted");
    core.epochs[idx] += 1;
    let epoch = core.epochs[idx];
    let tid = Tid(idx as u32);
    let entry = new_entry(tid, epoch, name, priority, user_id, now);
    let slot = entry.slot.clone();
    core.threads.insert(tid, entry);
    (tid, epoch, slot)
}

/// Put `tid` on the ready queue at its base priority. Posts a preemption
/// if it now outranks the running thread.
pub(crate) fn ready_to_run(kernel: &Kernel, tid: Tid) {
    let now = kernel.interrupt.ticks();
    let preempt = {
        let mut core = kernel.scheduler.core.lock();
        let cur = core.current;
        let entry = core.thread_mut(tid);
        entry.state = ThreadState::Ready;
        entry.effective_priority = entry.base_priority;
        entry.time_slice = time_slice_for(entry.effective_priority);
        entry.ticks_used = 0;
        entry.last_ready_tick = now;
        let eff = entry.effective_priority;
        core.ready.insert(tid, eff);
        if tid != cur {
            let cur_eff = core.thread_mut(cur).effective_priority;
            eff < cur_eff
        } else {
            false
        }
    };
    if preempt {
        kernel.interrupt.request_yield();
    }
}

/// Dispatch the next ready thread, idling (simulated time warps to the
/// next pending interrupt) until one exists. With `dying`, the caller's
/// record is torn off the table for the next thread to reap.
pub(crate) fn reschedule(kernel: &Kernel, dying: bool) {
    loop {
        let core = kernel.scheduler.core.lock();
        let mut core = core;
        if let Some(next) = core.ready.remove_front() {
            do_switch(kernel, core, next, dying);
            return;
        }
        drop(core);
        if !kernel.interrupt.idle(kernel) {
            panic!("no threads ready or runnable, and no pending interrupts");
        }
    }
}

fn do_switch(
    kernel: &Kernel,
    mut core: parking_lot::MutexGuard<'_, Core>,
    next: Tid,
    dying: bool,
) {
    let cur = core.current;
    if next == cur {
        debug_assert!(!dying);
        let entry = core.thread_mut(cur);
        entry.state = ThreadState::Running;
        entry.ticks_used = 0;
        return;
    }

    if !dying {
        let regs = kernel.machine.snapshot_regs();
        core.thread_mut(cur).user_regs = regs;
    }
    kernel.machine.tlb_sync_and_flush(kernel);

    {
        let entry = core.thread_mut(next);
        entry.state = ThreadState::Running;
        entry.ticks_used = 0;
    }
    core.current = next;
    let next_slot = core.thread_mut(next).slot.clone();
    let cur_slot = core.threads.get(&cur).map(|e| e.slot.clone());
    if dying {
        let entry = core.threads.remove(&cur).expect("dying thread record");
        core.to_reap.push(entry);
    }
    drop(core);

    log::trace!(target: "minnow::scheduler", "switch {cur} -> {next}{}", if dying { " (reaping)" } else { "" });
    next_slot.post();
    if !dying {
        cur_slot.expect("live outgoing thread").block();
        resume_hook(kernel);
    }
}

/// Runs on a thread as it regains the CPU: reap whatever the previous
/// occupant left behind, then restore our user registers and MMU view.
pub(crate) fn resume_hook(kernel: &Kernel) {
    let reaped = {
        let mut core = kernel.scheduler.core.lock();
        let dead: Vec<ThreadEntry> = core.to_reap.drain(..).collect();
        for entry in &dead {
            core.tid_pool.clear(entry.tid.0 as usize);
        }
        dead
    };
    for entry in reaped {
        log::trace!(target: "minnow::scheduler", "reaped tid={}", entry.tid);
        drop(entry);
    }

    let (regs, space) = {
        let core = kernel.scheduler.core.lock();
        let entry = core.threads.get(&core.current).expect("current thread");
        (entry.user_regs, entry.space.clone())
    };
    kernel.machine.load_regs(&regs);
    kernel.machine.set_active_space(kernel, space);
}

/// Per-tick accounting: charge the running thread's slice and age the
/// ready queue.
pub(crate) fn charge_tick(kernel: &Kernel, now: u64) {
    let mut preempt = false;
    {
        let mut core = kernel.scheduler.core.lock();
        let cur = core.current;
        if let Some(entry) = core.threads.get_mut(&cur) {
            if entry.state == ThreadState::Running {
                entry.ticks_used += 1;
                if entry.ticks_used >= entry.time_slice {
                    preempt = true;
                }
            }
        }
        let aging = kernel.scheduler.aging_ticks;
        if aging > 0 && now % aging == 0 {
            age_ready_threads(&mut core, now, aging);
        }
    }
    if preempt {
        kernel.interrupt.request_yield();
    }
}

/// Re-sort the ready queue with aged effective priorities: each thread's
/// priority improves by one step for every `aging_ticks` ticks it has
/// waited since it last became ready, down to the floor. Relative order
/// is preserved for threads that age together.
fn age_ready_threads(core: &mut Core, now: u64, aging_ticks: u64) {
    let order = core.ready.drain();
    for tid in &order {
        let entry = core.thread_mut(*tid);
        let waited = now.saturating_sub(entry.last_ready_tick);
        let boost = (waited / aging_ticks) as i32;
        entry.effective_priority = (entry.base_priority - boost).max(HIGHEST_PRIORITY);
        entry.time_slice = time_slice_for(entry.effective_priority);
    }
    for tid in order {
        let eff = core.thread_mut(tid).effective_priority;
        core.ready.insert(tid, eff);
    }
}

/// Update a thread's base priority and re-sort it if it is ready. The
/// running thread's effective priority changes immediately so later
/// preemption comparisons see it.
pub fn change_priority(kernel: &Kernel, tid: Tid, priority: i32) {
    let _guard = crate::machine::interrupt::IntGuard::off(kernel);
    let preempt = {
        let mut core = kernel.scheduler.core.lock();
        let cur = core.current;
        let clamped = priority.clamp(HIGHEST_PRIORITY, LOWEST_PRIORITY);
        let entry = core.thread_mut(tid);
        let old_eff = entry.effective_priority;
        entry.base_priority = clamped;
        entry.effective_priority = clamped;
        entry.time_slice = time_slice_for(clamped);
        let was_ready = entry.state == ThreadState::Ready;
        if was_ready {
            core.ready.remove(tid, old_eff);
            core.ready.insert(tid, clamped);
            let cur_eff = core.thread_mut(cur).effective_priority;
            tid != cur && clamped < cur_eff
        } else {
            false
        }
    };
    if preempt {
        kernel.interrupt.request_yield();
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// One row of the `ts` thread-status dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStatus {
    pub tid: Tid,
    pub name: String,
    pub state: ThreadState,
    pub user_id: i32,
    pub effective_priority: i32,
    pub time_slice: u64,
}

/// Dump every live thread's status, in tid order.
pub fn ts(kernel: &Kernel) -> Vec<ThreadStatus> {
    let core = kernel.scheduler.core.lock();
    let rows: Vec<ThreadStatus> = core
        .threads
        .values()
        .map(|e| ThreadStatus {
            tid: e.tid,
            name: e.name.clone(),
            state: e.state,
            user_id: e.user_id,
            effective_priority: e.effective_priority,
            time_slice: e.time_slice,
        })
        .collect();
    for row in &rows {
        log::info!(
            target: "minnow::scheduler",
            "TS tid={} name={} state={:?} uid={} pri={} slice={}",
            row.tid, row.name, row.state, row.user_id, row.effective_priority, row.time_slice
        );
    }
    rows
}
