//! Scenario tests: timed sleeping, fd readiness, synchronization primitives
//! and fairness, exercised through the full scheduler.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};

use cooperative_fibers::{
    nap, out_of_work, wait_fd, wait_until, wakeup, yield_now, Interest, Mutex, Semaphore,
    Signal, Timestamp, Worker,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// A future computed by a fiber is set once and readable any number of
// times, before or after completion.
#[test]
fn test_future_single_set_multi_read() {
    init_logging();
    let mut worker = Worker::new();

    let future = worker.spawn_future(|| 41 + 1).unwrap();

    let reads = Rc::new(RefCell::new(Vec::new()));
    let reads2 = reads.clone();
    let future2 = future.clone();
    worker
        .spawn(move || {
            reads2.borrow_mut().push(future2.value());
            // A second read must not block.
            reads2.borrow_mut().push(future2.value());
        })
        .unwrap();

    worker.run(None);

    assert!(future.valid());
    assert_eq!(*reads.borrow(), vec![42, 42]);
    // Late arrivals (outside any fiber) see the value immediately too.
    assert_eq!(future.value(), 42);
}

// Producer naps between items; consumer busy-polls cooperatively. Wall time
// is dominated by the producer's sleeps, and the consumer's polling never
// starves the producer.
#[test]
fn test_producer_consumer_with_naps() {
    init_logging();
    let mut worker = Worker::new();

    let items: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    let produced = items.clone();
    worker
        .spawn(move || {
            for i in 0..3 {
                nap(Duration::from_millis(10));
                produced.borrow_mut().push(i);
            }
        })
        .unwrap();

    let consumed = items.clone();
    let seen = Rc::new(Cell::new(0usize));
    let seen2 = seen.clone();
    worker
        .spawn(move || {
            while consumed.borrow().len() < 3 {
                out_of_work();
            }
            seen2.set(consumed.borrow().len());
        })
        .unwrap();

    let started = Instant::now();
    worker.run(None);
    let elapsed = started.elapsed();

    assert_eq!(seen.get(), 3);
    assert!(
        elapsed >= Duration::from_millis(25),
        "three 10 ms naps finished too fast: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(5),
        "producer/consumer took far too long: {elapsed:?}"
    );
}

// A mutex held across a voluntary yield keeps a second fiber out until the
// explicit unlock.
#[test]
fn test_mutex_held_across_yield() {
    init_logging();
    let mut worker = Worker::new();

    let mutex = Rc::new(Mutex::new());
    let order = Rc::new(RefCell::new(Vec::new()));

    let mutex_x = mutex.clone();
    let order_x = order.clone();
    worker
        .spawn(move || {
            mutex_x.lock();
            order_x.borrow_mut().push("x-locked");
            // Hand the CPU over while still holding the lock.
            out_of_work();
            order_x.borrow_mut().push("x-unlocks");
            mutex_x.unlock();
        })
        .unwrap();

    let mutex_y = mutex.clone();
    let order_y = order.clone();
    worker
        .spawn(move || {
            mutex_y.lock();
            order_y.borrow_mut().push("y-locked");
            mutex_y.unlock();
        })
        .unwrap();

    worker.run(None);
    assert_eq!(*order.borrow(), vec!["x-locked", "x-unlocks", "y-locked"]);
    assert!(!mutex.is_locked());
}

#[test]
fn test_mutex_guard_unlocks_on_drop() {
    init_logging();
    let mut worker = Worker::new();

    let mutex = Rc::new(Mutex::new());
    let hits = Rc::new(Cell::new(0u32));

    for _ in 0..3 {
        let mutex = mutex.clone();
        let hits = hits.clone();
        worker
            .spawn(move || {
                let _guard = mutex.lock_guard();
                hits.set(hits.get() + 1);
                out_of_work();
            })
            .unwrap();
    }

    worker.run(None);
    assert_eq!(hits.get(), 3);
    assert!(!mutex.is_locked());
}

// Semaphore conservation: a multi-unit acquire blocks until enough releases
// accumulate, and units are never over-granted.
#[test]
fn test_semaphore_multi_unit_acquire() {
    init_logging();
    let mut worker = Worker::new();

    let sem = Rc::new(Semaphore::new(0));
    let order = Rc::new(RefCell::new(Vec::new()));

    let sem_a = sem.clone();
    let order_a = order.clone();
    worker
        .spawn(move || {
            sem_a.acquire(3);
            order_a.borrow_mut().push("acquired");
        })
        .unwrap();

    let sem_r = sem.clone();
    let order_r = order.clone();
    worker
        .spawn(move || {
            for _ in 0..3 {
                sem_r.release(1);
                order_r.borrow_mut().push("released");
                out_of_work();
            }
        })
        .unwrap();

    worker.run(None);

    assert_eq!(
        *order.borrow(),
        vec!["released", "released", "released", "acquired"]
    );
    assert_eq!(sem.value(), 0);
}

#[test]
fn test_semaphore_mixed_waiters_all_served() {
    init_logging();
    let mut worker = Worker::new();

    let sem = Rc::new(Semaphore::new(0));
    let done = Rc::new(Cell::new(0u32));

    for want in [2u32, 1, 2] {
        let sem = sem.clone();
        let done = done.clone();
        worker
            .spawn(move || {
                sem.acquire(want);
                done.set(done.get() + 1);
            })
            .unwrap();
    }

    let sem_r = sem.clone();
    worker
        .spawn(move || {
            for _ in 0..5 {
                sem_r.release(1);
                out_of_work();
            }
        })
        .unwrap();

    worker.run(None);
    assert_eq!(done.get(), 3);
    assert_eq!(sem.value(), 0);
}

// Signals are edge-triggered: a signal with nobody waiting is lost.
#[test]
fn test_signal_has_no_memory() {
    init_logging();
    let mut worker = Worker::new();

    let signal = Rc::new(Signal::new());
    let woke = Rc::new(Cell::new(false));

    let signal_s = signal.clone();
    worker.spawn(move || signal_s.signal()).unwrap();

    let signal_w = signal.clone();
    let woke2 = woke.clone();
    worker
        .spawn(move || {
            // Let the signaler fire first.
            out_of_work();
            signal_w.wait();
            woke2.set(true);
        })
        .unwrap();

    // The waiter blocks forever; the run drains without it completing.
    worker.run(None);
    assert!(!woke.get());
}

#[test]
fn test_signal_wakes_present_waiters() {
    init_logging();
    let mut worker = Worker::new();

    let signal = Rc::new(Signal::new());
    let woken = Rc::new(Cell::new(0u32));

    for _ in 0..2 {
        let signal = signal.clone();
        let woken = woken.clone();
        worker
            .spawn(move || {
                signal.wait();
                woken.set(woken.get() + 1);
            })
            .unwrap();
    }

    let signal_s = signal.clone();
    worker
        .spawn(move || {
            // Both waiters are parked by now (they spawned first).
            signal_s.signal();
            out_of_work();
            signal_s.signal_all();
        })
        .unwrap();

    worker.run(None);
    assert_eq!(woken.get(), 2);
}

// Sleepers wake in deadline order regardless of spawn order.
#[test]
fn test_sleep_wake_ordering() {
    init_logging();
    let mut worker = Worker::new();

    let wakes: Rc<RefCell<Vec<(u64, Timestamp)>>> = Rc::new(RefCell::new(Vec::new()));

    for sleep_ms in [30u64, 10, 20] {
        let wakes = wakes.clone();
        worker
            .spawn(move || {
                nap(Duration::from_millis(sleep_ms));
                wakes.borrow_mut().push((sleep_ms, Timestamp::now()));
            })
            .unwrap();
    }

    worker.run(None);

    let wakes = wakes.borrow();
    let order: Vec<u64> = wakes.iter().map(|&(ms, _)| ms).collect();
    assert_eq!(order, vec![10, 20, 30]);
    for pair in wakes.windows(2) {
        assert!(pair[0].1 <= pair[1].1, "wake timestamps went backwards");
    }
}

// The fairness floor: a fiber spamming yields does not starve one doing
// real work, because yields within the minimum timeslice are no-ops.
#[test]
fn test_timeslice_gate_absorbs_yield_spam() {
    init_logging();
    let mut worker = Worker::new();

    let last_runner: Rc<Cell<u8>> = Rc::new(Cell::new(0));
    let stats: Rc<RefCell<[(u64, u64); 2]>> = Rc::new(RefCell::new([(0, 0); 2]));

    for tag in [1u8, 2] {
        let last_runner = last_runner.clone();
        let stats = stats.clone();
        worker
            .spawn(move || loop {
                {
                    let mut stats = stats.borrow_mut();
                    let entry = &mut stats[(tag - 1) as usize];
                    entry.0 += 1; // yield calls
                    if last_runner.get() != tag {
                        entry.1 += 1; // actual handovers observed
                        last_runner.set(tag);
                    }
                }
                yield_now();
            })
            .unwrap();
    }

    worker.run(Some(Duration::from_millis(50)));

    let stats = *stats.borrow();
    for (tag, &(calls, handovers)) in stats.iter().enumerate() {
        assert!(
            handovers > 1,
            "fiber {} was starved: {:?}",
            tag + 1,
            stats
        );
        assert!(
            calls > handovers * 4,
            "yield calls were not absorbed by the timeslice gate: {stats:?}"
        );
    }
}

#[cfg(unix)]
#[test]
fn test_wait_fd_wakes_on_readiness() {
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    init_logging();
    let mut worker = Worker::new();

    let (reader, writer) = UnixStream::pair().unwrap();
    let got = Rc::new(Cell::new(0u8));

    let got2 = got.clone();
    let fd = reader.as_raw_fd();
    let mut reader = reader;
    worker
        .spawn(move || {
            wait_fd(fd, Interest::Readable).unwrap();
            let mut buf = [0u8; 1];
            reader.read_exact(&mut buf).unwrap();
            got2.set(buf[0]);
        })
        .unwrap();

    let mut writer = writer;
    worker
        .spawn(move || {
            nap(Duration::from_millis(20));
            writer.write_all(&[0x5A]).unwrap();
        })
        .unwrap();

    let started = Instant::now();
    worker.run(None);

    assert_eq!(got.get(), 0x5A);
    assert!(started.elapsed() >= Duration::from_millis(15));
}

// A timed sleeper and a pending fd wait at the same time: the waiter must
// pick the nearer of the two timeouts and serve both in order.
#[cfg(unix)]
#[test]
fn test_timed_sleeper_and_fd_wait_combined() {
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    init_logging();
    let mut worker = Worker::new();

    let (reader, writer) = UnixStream::pair().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let order_s = order.clone();
    worker
        .spawn(move || {
            nap(Duration::from_millis(15));
            order_s.borrow_mut().push("sleeper");
        })
        .unwrap();

    let order_f = order.clone();
    let fd = reader.as_raw_fd();
    let mut reader = reader;
    worker
        .spawn(move || {
            wait_fd(fd, Interest::Readable).unwrap();
            let mut buf = [0u8; 1];
            reader.read_exact(&mut buf).unwrap();
            order_f.borrow_mut().push("fd");
        })
        .unwrap();

    let mut writer = writer;
    worker
        .spawn(move || {
            nap(Duration::from_millis(40));
            writer.write_all(&[1]).unwrap();
        })
        .unwrap();

    let started = Instant::now();
    worker.run(None);
    let elapsed = started.elapsed();

    assert_eq!(*order.borrow(), vec!["sleeper", "fd"]);
    assert!(
        elapsed >= Duration::from_millis(35),
        "fd wait completed before its writer: {elapsed:?}"
    );
}

#[test]
fn test_wait_until_polls_predicate() {
    init_logging();
    let mut worker = Worker::new();

    let flag = Rc::new(Cell::new(false));
    let done = Rc::new(Cell::new(false));

    let flag_setter = flag.clone();
    worker
        .spawn(move || {
            nap(Duration::from_millis(20));
            flag_setter.set(true);
        })
        .unwrap();

    let flag_poll = flag.clone();
    let done2 = done.clone();
    worker
        .spawn(move || {
            wait_until(move || flag_poll.get(), Duration::from_millis(5));
            done2.set(true);
        })
        .unwrap();

    let started = Instant::now();
    worker.run(None);

    assert!(done.get());
    assert!(started.elapsed() >= Duration::from_millis(15));
}

// Canceling a sleep: an explicit wakeup makes the fiber runnable long
// before its deadline.
#[test]
fn test_early_wakeup_cancels_nap() {
    init_logging();
    let mut worker = Worker::new();

    let woke = Rc::new(Cell::new(false));

    let woke2 = woke.clone();
    let sleeper = worker
        .spawn(move || {
            nap(Duration::from_secs(600));
            woke2.set(true);
        })
        .unwrap();

    worker
        .spawn(move || {
            nap(Duration::from_millis(10));
            wakeup(sleeper);
        })
        .unwrap();

    let started = Instant::now();
    worker.run(None);

    assert!(woke.get());
    assert!(
        started.elapsed() < Duration::from_secs(30),
        "sleeper was not woken early"
    );
}

#[test]
fn test_zero_nap_degenerates_to_yield() {
    init_logging();
    let mut worker = Worker::new();

    let order = Rc::new(RefCell::new(Vec::new()));
    for tag in ["a", "b"] {
        let order = order.clone();
        worker
            .spawn(move || {
                order.borrow_mut().push(tag);
                nap(Duration::ZERO);
                order.borrow_mut().push(tag);
            })
            .unwrap();
    }

    worker.run(None);
    // The zero-length nap still handed the CPU over once.
    assert_eq!(*order.borrow(), vec!["a", "b", "a", "b"]);
}

// Many sleeping fibers at once keep a single worker consistent.
#[test]
fn test_many_sleepers_stress() {
    init_logging();
    let mut worker = Worker::new();

    let woken = Rc::new(Cell::new(0u32));
    for i in 0..50u64 {
        let woken = woken.clone();
        worker
            .spawn(move || {
                nap(Duration::from_millis(1 + i % 7));
                woken.set(woken.get() + 1);
            })
            .unwrap();
    }

    worker.run(None);
    assert_eq!(woken.get(), 50);
    assert_eq!(worker.fiber_count(), 0);
}
