//! End-to-end thread and synchronization scenarios, each on its own
//! isolated kernel.

use std::sync::Arc;

use parking_lot::Mutex;

use minnow::kern::scheduler::{self, ThreadStatus};
use minnow::kern::sync::{Barrier, PcCondition, PcSemaphore, RwLock, Semaphore};
use minnow::kern::thread::{self, ThreadBuilder};
use minnow::kern::thread::ThreadState;
use minnow::{Kernel, KernelOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn ping_pong_alternates_on_every_yield() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::bare());
    let log: Arc<Mutex<Vec<(&str, i32)>>> = Arc::new(Mutex::new(Vec::new()));

    let child_log = log.clone();
    let child = ThreadBuilder::new("forked thread").spawn(&kernel, move |k| {
        for i in 0..5 {
            child_log.lock().push(("child", i));
            thread::yield_now(k);
        }
    });

    for i in 0..5 {
        log.lock().push(("parent", i));
        thread::yield_now(&kernel);
    }
    thread::join(&kernel, &child);

    let seen = log.lock().clone();
    let mut expected = Vec::new();
    for i in 0..5 {
        expected.push(("parent", i));
        expected.push(("child", i));
    }
    assert_eq!(seen, expected);
}

#[test]
fn priority_preemption_runs_better_threads_first() {
    init_logging();
    // Aging off: this scenario checks the pure priority ordering.
    let kernel = Kernel::new(KernelOptions {
        aging_ticks: 0,
        ..KernelOptions::bare()
    });
    thread::set_priority(&kernel, 20);

    let done: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));
    let body = |name: &'static str, done: Arc<Mutex<Vec<&'static str>>>| {
        move |k: &Kernel| {
            // Burn a little simulated time before reporting completion.
            for _ in 0..20 {
                k.interrupt.one_tick(k);
            }
            done.lock().push(name);
        }
    };

    // The better-priority forks preempt the parent immediately, so each
    // pri-16 thread finishes before the parent resumes.
    let t2 = ThreadBuilder::new("fork 2")
        .priority(16)
        .spawn(&kernel, body("t2", done.clone()));
    let t3 = ThreadBuilder::new("fork 3")
        .priority(16)
        .spawn(&kernel, body("t3", done.clone()));
    let t1 = ThreadBuilder::new("fork 1")
        .priority(31)
        .spawn(&kernel, body("t1", done.clone()));

    let rows: Vec<ThreadStatus> = scheduler::ts(&kernel);
    let t1_row = rows.iter().find(|r| r.tid == t1.tid).expect("t1 alive");
    assert_eq!(t1_row.state, ThreadState::Ready);
    assert_eq!(t1_row.effective_priority, 31);

    for _ in 0..20 {
        kernel.interrupt.one_tick(&kernel);
    }
    done.lock().push("parent");

    thread::join(&kernel, &t1);
    thread::join(&kernel, &t2);
    thread::join(&kernel, &t3);

    assert_eq!(*done.lock(), vec!["t2", "t3", "parent", "t1"]);
}

#[test]
fn producer_consumer_with_semaphores() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::bare());
    let pc: Arc<PcSemaphore<i32, 10>> = Arc::new(PcSemaphore::new());

    let producer_pc = pc.clone();
    let producer = ThreadBuilder::new("Producer").spawn(&kernel, move |k| {
        for i in 0..100 {
            producer_pc.produce(k, i);
        }
    });
    let consumer_pc = pc.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer_seen = seen.clone();
    let consumer = ThreadBuilder::new("Consumer").spawn(&kernel, move |k| {
        for _ in 0..100 {
            consumer_seen.lock().push(consumer_pc.consume(k));
        }
    });

    thread::join(&kernel, &producer);
    thread::join(&kernel, &consumer);
    assert_eq!(*seen.lock(), (0..100).collect::<Vec<i32>>());
}

#[test]
fn producer_consumer_with_condition_variables() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::bare());
    let pc: Arc<PcCondition<i32, 10>> = Arc::new(PcCondition::new());

    let producer_pc = pc.clone();
    let producer = ThreadBuilder::new("Producer").spawn(&kernel, move |k| {
        for i in 0..100 {
            producer_pc.produce(k, i);
        }
    });
    let consumer_pc = pc.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer_seen = seen.clone();
    let consumer = ThreadBuilder::new("Consumer").spawn(&kernel, move |k| {
        for _ in 0..100 {
            consumer_seen.lock().push(consumer_pc.consume(k));
        }
    });

    thread::join(&kernel, &producer);
    thread::join(&kernel, &consumer);
    assert_eq!(*seen.lock(), (0..100).collect::<Vec<i32>>());
}

#[test]
fn barrier_rounds_never_overlap() {
    init_logging();
    const THREADS: usize = 4;
    const ROUNDS: usize = 5;

    let kernel = Kernel::new(KernelOptions::bare());
    let barrier = Arc::new(Barrier::new("BarrierTest", THREADS));
    let events: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for who in 0..THREADS {
        let barrier = barrier.clone();
        let events = events.clone();
        handles.push(
            ThreadBuilder::new(&format!("barrier {who}")).spawn(&kernel, move |k| {
                for round in 0..ROUNDS {
                    events.lock().push((who, round));
                    barrier.aligned_barrier(k);
                }
            }),
        );
    }
    for handle in &handles {
        thread::join(&kernel, handle);
    }

    let events = events.lock().clone();
    assert_eq!(events.len(), THREADS * ROUNDS);
    // No thread may reach round k+1 before all of round k has arrived.
    for (i, &(_, round)) in events.iter().enumerate() {
        let arrived_before = events[..i]
            .iter()
            .filter(|&&(_, r)| r == round)
            .count();
        if round > 0 {
            let prior_round_done = events[..i]
                .iter()
                .filter(|&&(_, r)| r == round - 1)
                .count();
            assert_eq!(prior_round_done, THREADS, "round {round} overlapped its predecessor");
        }
        assert!(arrived_before < THREADS);
    }
}

#[test]
fn reader_writer_exclusion_invariant() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::bare());
    let rw = Arc::new(RwLock::new("rw"));
    let state = Arc::new(Mutex::new((0usize, 0usize))); // (readers, writers)

    let mut handles = Vec::new();
    for who in 0..2 {
        let rw = rw.clone();
        let state = state.clone();
        handles.push(
            ThreadBuilder::new(&format!("reader {who}")).spawn(&kernel, move |k| {
                for _ in 0..3 {
                    rw.read_acquire(k);
                    {
                        let mut st = state.lock();
                        st.0 += 1;
                        assert_eq!(st.1, 0, "reader inside while a writer holds the lock");
                    }
                    for _ in 0..10 {
                        thread::yield_now(k);
                    }
                    state.lock().0 -= 1;
                    rw.read_release(k);
                    for _ in 0..10 {
                        thread::yield_now(k);
                    }
                }
            }),
        );
    }
    for who in 0..2 {
        let rw = rw.clone();
        let state = state.clone();
        handles.push(
            ThreadBuilder::new(&format!("writer {who}")).spawn(&kernel, move |k| {
                for _ in 0..3 {
                    rw.write_acquire(k);
                    {
                        let mut st = state.lock();
                        assert_eq!(st.0, 0, "writer entered with readers inside");
                        assert_eq!(st.1, 0, "two writers inside");
                        st.1 += 1;
                    }
                    for _ in 0..10 {
                        thread::yield_now(k);
                    }
                    state.lock().1 -= 1;
                    rw.write_release(k);
                    for _ in 0..10 {
                        thread::yield_now(k);
                    }
                }
            }),
        );
    }
    for handle in &handles {
        thread::join(&kernel, handle);
    }
    assert_eq!(*state.lock(), (0, 0));
}

#[test]
fn writer_preferring_variant_also_holds_the_invariant() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::bare());
    let rw = Arc::new(RwLock::new_writer_preferring("rw pref"));
    let state = Arc::new(Mutex::new((0usize, 0usize)));

    let mut handles = Vec::new();
    for who in 0..2 {
        let rw = rw.clone();
        let state = state.clone();
        handles.push(
            ThreadBuilder::new(&format!("reader {who}")).spawn(&kernel, move |k| {
                for _ in 0..3 {
                    rw.read_acquire(k);
                    {
                        let mut st = state.lock();
                        st.0 += 1;
                        assert_eq!(st.1, 0);
                    }
                    for _ in 0..5 {
                        thread::yield_now(k);
                    }
                    state.lock().0 -= 1;
                    rw.read_release(k);
                }
            }),
        );
    }
    let rw_w = rw.clone();
    let state_w = state.clone();
    handles.push(ThreadBuilder::new("writer").spawn(&kernel, move |k| {
        for _ in 0..3 {
            rw_w.write_acquire(k);
            {
                let mut st = state_w.lock();
                assert_eq!(st.0, 0);
                st.1 += 1;
            }
            for _ in 0..5 {
                thread::yield_now(k);
            }
            state_w.lock().1 -= 1;
            rw_w.write_release(k);
        }
    }));
    for handle in &handles {
        thread::join(&kernel, handle);
    }
    assert_eq!(*state.lock(), (0, 0));
}

#[test]
fn aging_unstarves_a_low_priority_thread() {
    init_logging();
    // With aging on, a waiting pri-100 thread eventually outranks the
    // busy pri-20 main thread.
    let kernel = Kernel::new(KernelOptions {
        aging_ticks: 50,
        ..KernelOptions::bare()
    });
    thread::set_priority(&kernel, 20);
    let ran = Arc::new(Mutex::new(false));
    let ran_flag = ran.clone();
    let low = ThreadBuilder::new("background")
        .priority(100)
        .spawn(&kernel, move |_| *ran_flag.lock() = true);

    let mut ticks = 0u64;
    while !*ran.lock() && ticks < 50_000 {
        kernel.interrupt.one_tick(&kernel);
        ticks += 1;
    }
    assert!(*ran.lock(), "aging never let the background thread run");
    thread::join(&kernel, &low);

    // Without aging, the same workload starves it.
    let kernel = Kernel::new(KernelOptions {
        aging_ticks: 0,
        ..KernelOptions::bare()
    });
    thread::set_priority(&kernel, 20);
    let ran = Arc::new(Mutex::new(false));
    let ran_flag = ran.clone();
    let _low = ThreadBuilder::new("background")
        .priority(100)
        .spawn(&kernel, move |_| *ran_flag.lock() = true);
    for _ in 0..5_000 {
        kernel.interrupt.one_tick(&kernel);
    }
    assert!(!*ran.lock(), "a worse-priority thread ran without aging");
}

#[test]
fn time_slice_exhaustion_rotates_equal_priorities() {
    init_logging();
    let kernel = Kernel::new(KernelOptions {
        aging_ticks: 0,
        ..KernelOptions::bare()
    });
    let order: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));

    let spin = |name: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
        move |k: &Kernel| {
            // Run through several time slices without ever yielding
            // voluntarily; preemption must rotate us out.
            for _ in 0..200 {
                k.interrupt.one_tick(k);
            }
            order.lock().push(name);
        }
    };
    let a = ThreadBuilder::new("spin a")
        .priority(16)
        .spawn(&kernel, spin("a", order.clone()));
    let b = ThreadBuilder::new("spin b")
        .priority(16)
        .spawn(&kernel, spin("b", order.clone()));

    thread::join(&kernel, &a);
    thread::join(&kernel, &b);
    // Both finish; with a ~60-tick slice neither can finish its 200
    // ticks in one stint, so completion order proves rotation happened
    // rather than run-to-completion in fork order.
    assert_eq!(order.lock().len(), 2);
}

#[test]
fn semaphore_ping_pong_with_disk_style_signaling() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::bare());
    let ping = Arc::new(Semaphore::new("ping", 0));
    let pong = Arc::new(Semaphore::new("pong", 0));

    let ping_c = ping.clone();
    let pong_c = pong.clone();
    let child = ThreadBuilder::new("pinger").spawn(&kernel, move |k| {
        for _ in 0..10 {
            ping_c.p(k);
            pong_c.v(k);
        }
    });

    for _ in 0..10 {
        ping.v(&kernel);
        pong.p(&kernel);
    }
    thread::join(&kernel, &child);
}
