//! Interrupt masking and simulated time.
//!
//! The machine has a single interrupt level: either interrupts are enabled
//! or they are not. All kernel code that touches scheduler queues or other
//! shared state brackets the critical section with
//! [`Interrupt::set_level`], balancing mask and restore on every exit path
//! ([`IntGuard`] is the RAII form).
//!
//! Time advances in ticks. Device completions (the disk) and the optional
//! preemption timer are *pending interrupts*: each carries a due tick and
//! fires when simulated time reaches it. Re-enabling interrupts advances
//! one tick and delivers anything due; when no thread is runnable,
//! [`Interrupt::idle`] warps time forward to the next pending interrupt.
//! A preemption posted from a handler is honored at the next safe point,
//! which is the moment interrupts come back on.

use parking_lot::Mutex;

use crate::types::TIMER_TICKS;
use crate::Kernel;

/// The interrupt enable level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntStatus {
    Off,
    On,
}

/// The kinds of pending interrupt the gate can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntKind {
    /// The outstanding disk request completed.
    DiskDone,
    /// Periodic preemption timer.
    Timer,
}

#[derive(Debug)]
struct Pending {
    when: u64,
    kind: IntKind,
}

#[derive(Debug)]
struct GateState {
    level: IntStatus,
    ticks: u64,
    pending: Vec<Pending>,
    yield_on_return: bool,
    in_handler: bool,
}

/// The interrupt/atomicity gate.
#[derive(Debug)]
pub struct Interrupt {
    state: Mutex<GateState>,
}

impl Interrupt {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                level: IntStatus::On,
                ticks: 0,
                pending: Vec::new(),
                yield_on_return: false,
                in_handler: false,
            }),
        }
    }

    /// Change the interrupt level, returning the previous one.
    ///
    /// Turning interrupts back on advances time by one tick and delivers
    /// any interrupts that became due while they were masked.
    pub fn set_level(&self, kernel: &Kernel, level: IntStatus) -> IntStatus {
        let old = {
            let mut st = self.state.lock();
            let old = st.level;
            st.level = level;
            old
        };
        if old == IntStatus::Off && level == IntStatus::On {
            self.one_tick(kernel);
        }
        old
    }

    /// Current interrupt level.
    pub fn level(&self) -> IntStatus {
        self.state.lock().level
    }

    /// Total elapsed simulated ticks.
    pub fn ticks(&self) -> u64 {
        self.state.lock().ticks
    }

    /// Advance simulated time by one tick: charge the running thread's
    /// slice, deliver due interrupts, and honor a posted preemption if we
    /// are at a safe point.
    pub fn one_tick(&self, kernel: &Kernel) {
        let now = {
            let mut st = self.state.lock();
            st.ticks += 1;
            st.ticks
        };
        crate::kern::scheduler::charge_tick(kernel, now);
        self.fire_due(kernel);
        self.maybe_yield(kernel);
    }

    /// Post a pending interrupt `delta` ticks from now.
    pub(crate) fn schedule(&self, delta: u64, kind: IntKind) {
        let mut st = self.state.lock();
        let when = st.ticks + delta;
        st.pending.push(Pending { when, kind });
    }

    /// Request a reschedule at the next safe point.
    pub(crate) fn request_yield(&self) {
        self.state.lock().yield_on_return = true;
    }

    /// Nothing is runnable: warp time to the next pending interrupt and
    /// deliver it. Returns false when no interrupt is pending either, in
    /// which case the machine is wedged.
    pub(crate) fn idle(&self, kernel: &Kernel) -> bool {
        {
            let mut st = self.state.lock();
            let Some(next_due) = st.pending.iter().map(|p| p.when).min() else {
                return false;
            };
            if next_due > st.ticks {
                st.ticks = next_due;
            }
        }
        self.fire_due(kernel);
        true
    }

    /// Deliver every pending interrupt whose due tick has passed.
    /// Handlers run with interrupts forced off.
    fn fire_due(&self, kernel: &Kernel) {
        loop {
            let (kind, prev_level) = {
                let mut st = self.state.lock();
                if st.in_handler {
                    return;
                }
                let due = st
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.when <= st.ticks)
                    .min_by_key(|(_, p)| p.when)
                    .map(|(i, _)| i);
                let Some(idx) = due else { return };
                let pending = st.pending.swap_remove(idx);
                let prev = st.level;
                st.level = IntStatus::Off;
                st.in_handler = true;
                (pending.kind, prev)
            };

            match kind {
                IntKind::DiskDone => kernel.synch_disk.request_done(kernel),
                IntKind::Timer => {
                    let mut st = self.state.lock();
                    st.yield_on_return = true;
                    let when = st.ticks + TIMER_TICKS;
                    st.pending.push(Pending {
                        when,
                        kind: IntKind::Timer,
                    });
                }
            }

            let mut st = self.state.lock();
            st.in_handler = false;
            st.level = prev_level;
        }
    }

    /// At a safe point (interrupts on, not inside a handler), perform a
    /// posted preemption.
    fn maybe_yield(&self, kernel: &Kernel) {
        let do_yield = {
            let mut st = self.state.lock();
            if st.yield_on_return && st.level == IntStatus::On && !st.in_handler {
                st.yield_on_return = false;
                true
            } else {
                false
            }
        };
        if do_yield {
            log::trace!(target: "minnow::interrupt", "preempting at safe point");
            crate::kern::thread::yield_now(kernel);
        }
    }

    /// Fixed-width (24 characters + NUL) rendering of the current tick,
    /// used for file timestamps.
    pub(crate) fn timestamp(&self) -> [u8; 25] {
        let mut out = [0u8; 25];
        let text = format!("tick {:>19}", self.ticks());
        out[..24].copy_from_slice(&text.as_bytes()[..24]);
        out
    }
}

/// RAII interrupt mask: disables interrupts on creation and restores the
/// previous level on drop.
pub struct IntGuard<'a> {
    kernel: &'a Kernel,
    prev: IntStatus,
}

impl<'a> IntGuard<'a> {
    pub fn off(kernel: &'a Kernel) -> Self {
        let prev = kernel.interrupt.set_level(kernel, IntStatus::Off);
        Self { kernel, prev }
    }
}

impl Drop for IntGuard<'_> {
    fn drop(&mut self) {
        self.kernel.interrupt.set_level(self.kernel, self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelOptions;

    #[test]
    fn set_level_is_balanced_and_ticks() {
        let kernel = Kernel::new(KernelOptions::bare());
        let start = kernel.interrupt.ticks();
        let old = kernel.interrupt.set_level(&kernel, IntStatus::Off);
        assert_eq!(old, IntStatus::On);
        let old = kernel.interrupt.set_level(&kernel, IntStatus::Off);
        assert_eq!(old, IntStatus::Off);
        kernel.interrupt.set_level(&kernel, IntStatus::On);
        assert_eq!(kernel.interrupt.ticks(), start + 1);
    }

    #[test]
    fn guard_restores_previous_level() {
        let kernel = Kernel::new(KernelOptions::bare());
        {
            let _outer = IntGuard::off(&kernel);
            {
                let _inner = IntGuard::off(&kernel);
                assert_eq!(kernel.interrupt.level(), IntStatus::Off);
            }
            assert_eq!(kernel.interrupt.level(), IntStatus::Off);
        }
        assert_eq!(kernel.interrupt.level(), IntStatus::On);
    }

    #[test]
    fn idle_without_pending_reports_wedge() {
        let kernel = Kernel::new(KernelOptions::bare());
        assert!(!kernel.interrupt.idle(&kernel));
    }

    #[test]
    fn timestamp_is_fixed_width() {
        let kernel = Kernel::new(KernelOptions::bare());
        let stamp = kernel.interrupt.timestamp();
        assert_eq!(stamp[24], 0);
        assert!(stamp[..24].iter().all(|&b| b != 0));
    }
}
