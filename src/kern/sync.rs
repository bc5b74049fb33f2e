//! Synchronization primitives.
//!
//! Everything here obtains atomicity by masking interrupts (there is one
//! simulated CPU, so no context switch can intervene) and blocks through
//! [`crate::kern::thread::sleep_current`]. Wake-up order out of a
//! semaphore is FIFO.

use parking_lot::Mutex;

use crate::kern::list::WaitList;
use crate::kern::scheduler;
use crate::kern::thread;
use crate::machine::interrupt::IntGuard;
use crate::types::Tid;
use crate::Kernel;

// ============================================================================
// Semaphore
// ============================================================================

#[derive(Debug)]
struct SemInner {
    value: usize,
    queue: WaitList,
}

/// Counting semaphore with FIFO wake-up.
#[derive(Debug)]
pub struct Semaphore {
    name: &'static str,
    inner: Mutex<SemInner>,
}

impl Semaphore {
    pub fn new(name: &'static str, initial: usize) -> Self {
        Self {
            name,
            inner: Mutex::new(SemInner {
                value: initial,
                queue: WaitList::new(),
            }),
        }
    }

    /// Wait until the value is positive, then take one.
    pub fn p(&self, kernel: &Kernel) {
        let _guard = IntGuard::off(kernel);
        loop {
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                return;
            }
            let cur = thread::current(kernel);
            log::trace!(target: "minnow::sync", "P({}) blocks tid={cur}", self.name);
            inner.queue.append(cur);
            drop(inner);
            thread::sleep_current(kernel);
        }
    }

    /// Add one, readying the longest-waiting thread if there is one.
    pub fn v(&self, kernel: &Kernel) {
        let _guard = IntGuard::off(kernel);
        let woken = {
            let mut inner = self.inner.lock();
            inner.value += 1;
            inner.queue.remove_front()
        };
        if let Some(tid) = woken {
            log::trace!(target: "minnow::sync", "V({}) wakes tid={tid}", self.name);
            scheduler::ready_to_run(kernel, tid);
        }
    }

    /// Current value, for diagnostics only.
    pub fn value(&self) -> usize {
        self.inner.lock().value
    }
}

// ============================================================================
// Lock
// ============================================================================

/// A semaphore-with-owner mutex. Releasing a lock the caller does not
/// hold is fatal.
#[derive(Debug)]
pub struct Lock {
    name: &'static str,
    sem: Semaphore,
    holder: Mutex<Option<Tid>>,
}

impl Lock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            sem: Semaphore::new(name, 1),
            holder: Mutex::new(None),
        }
    }

    pub fn acquire(&self, kernel: &Kernel) {
        let _guard = IntGuard::off(kernel);
        self.sem.p(kernel);
        *self.holder.lock() = Some(thread::current(kernel));
    }

    pub fn release(&self, kernel: &Kernel) {
        let _guard = IntGuard::off(kernel);
        let cur = thread::current(kernel);
        {
            let mut holder = self.holder.lock();
            assert_eq!(
                *holder,
                Some(cur),
                "lock {} released by a thread that does not hold it",
                self.name
            );
            *holder = None;
        }
        self.sem.v(kernel);
    }

    pub fn is_held_by_current_thread(&self, kernel: &Kernel) -> bool {
        *self.holder.lock() == Some(thread::current(kernel))
    }
}

// ============================================================================
// Condition variable (Mesa style)
// ============================================================================

/// Mesa-semantics condition variable. A signal with no waiter is lost.
#[derive(Debug)]
pub struct Condition {
    waiters: Mutex<usize>,
    sem: Semaphore,
}

impl Condition {
    pub fn new(name: &'static str) -> Self {
        Self {
            waiters: Mutex::new(0),
            sem: Semaphore::new(name, 0),
        }
    }

    /// Atomically release `lock` and wait; reacquires `lock` before
    /// returning. The caller must hold `lock`.
    pub fn wait(&self, kernel: &Kernel, lock: &Lock) {
        assert!(lock.is_held_by_current_thread(kernel));
        *self.waiters.lock() += 1;
        lock.release(kernel);
        self.sem.p(kernel);
        lock.acquire(kernel);
    }

    /// Wake one waiter, if any. The caller must hold `lock`.
    pub fn signal(&self, kernel: &Kernel, lock: &Lock) {
        assert!(lock.is_held_by_current_thread(kernel));
        let mut waiters = self.waiters.lock();
        if *waiters > 0 {
            *waiters -= 1;
            self.sem.v(kernel);
        }
    }

    /// Wake every waiter. The caller must hold `lock`.
    pub fn broadcast(&self, kernel: &Kernel, lock: &Lock) {
        assert!(lock.is_held_by_current_thread(kernel));
        let mut waiters = self.waiters.lock();
        while *waiters > 0 {
            *waiters -= 1;
            self.sem.v(kernel);
        }
    }
}

// ============================================================================
// Barrier
// ============================================================================

/// Two-phase barrier that is safe for back-to-back rounds: nobody leaves
/// round `k` until all `n` threads have both arrived and observed the
/// arrival.
#[derive(Debug)]
pub struct Barrier {
    total: usize,
    arrived: Mutex<usize>,
    lock: Lock,
    cond_in: Condition,
    cond_out: Condition,
}

impl Barrier {
    pub fn new(name: &'static str, total: usize) -> Self {
        assert!(total > 0);
        Self {
            total,
            arrived: Mutex::new(0),
            lock: Lock::new(name),
            cond_in: Condition::new("barrier in"),
            cond_out: Condition::new("barrier out"),
        }
    }

    /// Block until all `total` threads have arrived at this call.
    pub fn aligned_barrier(&self, kernel: &Kernel) {
        self.lock.acquire(kernel);

        let arrivals = {
            let mut arrived = self.arrived.lock();
            *arrived += 1;
            *arrived
        };
        if arrivals == self.total {
            self.cond_in.broadcast(kernel, &self.lock);
        } else {
            self.cond_in.wait(kernel, &self.lock);
        }

        let remaining = {
            let mut arrived = self.arrived.lock();
            *arrived -= 1;
            *arrived
        };
        if remaining == 0 {
            self.cond_out.broadcast(kernel, &self.lock);
        } else {
            self.cond_out.wait(kernel, &self.lock);
        }

        self.lock.release(kernel);
    }
}

// ============================================================================
// Reader-writer lock
// ============================================================================

/// Reader–writer lock: the first reader takes the write lock, the last
/// reader releases it, writers take it exclusively. The default variant
/// admits readers as long as any keep arriving, starving writers; the
/// writer-preferring variant makes arriving readers stand aside while a
/// writer is waiting.
#[derive(Debug)]
pub struct RwLock {
    mutex: Lock,
    write_lock: Lock,
    readers: Mutex<usize>,
    writers_waiting: Mutex<usize>,
    prefer_writers: bool,
}

impl RwLock {
    pub fn new(name: &'static str) -> Self {
        Self::with_preference(name, false)
    }

    pub fn new_writer_preferring(name: &'static str) -> Self {
        Self::with_preference(name, true)
    }

    fn with_preference(name: &'static str, prefer_writers: bool) -> Self {
        Self {
            mutex: Lock::new(name),
            write_lock: Lock::new("rw write lock"),
            readers: Mutex::new(0),
            writers_waiting: Mutex::new(0),
            prefer_writers,
        }
    }

    pub fn read_acquire(&self, kernel: &Kernel) {
        loop {
            self.mutex.acquire(kernel);
            if self.prefer_writers && *self.writers_waiting.lock() > 0 {
                self.mutex.release(kernel);
                thread::yield_now(kernel);
                continue;
            }
            let first = {
                let mut readers = self.readers.lock();
                *readers += 1;
                *readers == 1
            };
            if first {
                self.write_lock.acquire(kernel);
            }
            self.mutex.release(kernel);
            return;
        }
    }

    pub fn read_release(&self, kernel: &Kernel) {
        self.mutex.acquire(kernel);
        *self.readers.lock() -= 1;
        if self.write_lock.is_held_by_current_thread(kernel) {
            // Only the reader that took the write lock may return it, and
            // it must wait for the stragglers to drain first.
            while *self.readers.lock() != 0 {
                self.mutex.release(kernel);
                thread::yield_now(kernel);
                self.mutex.acquire(kernel);
            }
            self.write_lock.release(kernel);
        }
        self.mutex.release(kernel);
    }

    pub fn write_acquire(&self, kernel: &Kernel) {
        if self.prefer_writers {
            self.mutex.acquire(kernel);
            *self.writers_waiting.lock() += 1;
            self.mutex.release(kernel);
        }
        self.write_lock.acquire(kernel);
        if self.prefer_writers {
            self.mutex.acquire(kernel);
            *self.writers_waiting.lock() -= 1;
            self.mutex.release(kernel);
        }
    }

    pub fn write_release(&self, kernel: &Kernel) {
        self.write_lock.release(kernel);
    }
}

// ============================================================================
// Bounded buffer and the two producer/consumer realizations
// ============================================================================

/// A fixed-capacity FIFO of `N` items.
#[derive(Debug)]
pub struct BoundedBuffer<T, const N: usize> {
    items: heapless::Deque<T, N>,
}

impl<T, const N: usize> Default for BoundedBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> BoundedBuffer<T, N> {
    pub fn new() -> Self {
        Self {
            items: heapless::Deque::new(),
        }
    }

    pub fn append(&mut self, item: T) {
        assert!(!self.is_full(), "append to a full bounded buffer");
        let _ = self.items.push_back(item);
    }

    pub fn remove(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn is_full(&self) -> bool {
        self.items.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Producer/consumer over a bounded buffer using a lock and two condition
/// variables.
#[derive(Debug)]
pub struct PcCondition<T, const N: usize> {
    buffer: Mutex<BoundedBuffer<T, N>>,
    lock: Lock,
    cond_producer: Condition,
    cond_consumer: Condition,
}

impl<T: Send, const N: usize> PcCondition<T, N> {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(BoundedBuffer::new()),
            lock: Lock::new("pc lock"),
            cond_producer: Condition::new("pc producer"),
            cond_consumer: Condition::new("pc consumer"),
        }
    }

    pub fn produce(&self, kernel: &Kernel, item: T) {
        self.lock.acquire(kernel);
        while self.buffer.lock().is_full() {
            self.cond_producer.wait(kernel, &self.lock);
        }
        self.buffer.lock().append(item);
        self.cond_consumer.signal(kernel, &self.lock);
        self.lock.release(kernel);
    }

    pub fn consume(&self, kernel: &Kernel) -> T {
        self.lock.acquire(kernel);
        while self.buffer.lock().is_empty() {
            self.cond_consumer.wait(kernel, &self.lock);
        }
        let item = self.buffer.lock().remove().expect("non-empty buffer");
        self.cond_producer.signal(kernel, &self.lock);
        self.lock.release(kernel);
        item
    }
}

impl<T: Send, const N: usize> Default for PcCondition<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer/consumer over a bounded buffer using three semaphores
/// (`mutex = 1`, `empty = N`, `full = 0`). Behaviorally identical to
/// [`PcCondition`] under any interleaving of one producer and one
/// consumer.
#[derive(Debug)]
pub struct PcSemaphore<T, const N: usize> {
    buffer: Mutex<BoundedBuffer<T, N>>,
    mutex: Semaphore,
    empty: Semaphore,
    full: Semaphore,
}

impl<T: Send, const N: usize> PcSemaphore<T, N> {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(BoundedBuffer::new()),
            mutex: Semaphore::new("pc mutex", 1),
            empty: Semaphore::new("pc empty", N),
            full: Semaphore::new("pc full", 0),
        }
    }

    pub fn produce(&self, kernel: &Kernel, item: T) {
        self.empty.p(kernel);
        self.mutex.p(kernel);
        self.buffer.lock().append(item);
        self.mutex.v(kernel);
        self.full.v(kernel);
    }

    pub fn consume(&self, kernel: &Kernel) -> T {
        self.full.p(kernel);
        self.mutex.p(kernel);
        let item = self.buffer.lock().remove().expect("non-empty buffer");
        self.mutex.v(kernel);
        self.empty.v(kernel);
        item
    }
}

impl<T: Send, const N: usize> Default for PcSemaphore<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
