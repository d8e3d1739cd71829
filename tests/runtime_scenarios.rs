//! 运行时端到端场景

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use qlang_concurrency::runtime::{Barrier, Semaphore};
use qlang_concurrency::{
    LoadBalancer, Priority, RuntimeConfig, RuntimeContext, RuntimeError, SpawnOptions, Strategy,
    Timed, WorkerPool,
};

static INIT_LOGGING: Once = Once::new();

/// 测试输出里带上运行时的 tracing 事件，`--nocapture` 时可见
fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

fn ctx() -> Arc<RuntimeContext> {
    init_logging();
    RuntimeContext::new(RuntimeConfig::default()).unwrap()
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_bounded_channel_blocks_third_send() {
    let ctx = ctx();
    let ch = Arc::new(ctx.channel(2));
    ch.send("A").unwrap();
    ch.send("B").unwrap();
    assert!(ch.is_full());

    let tx = Arc::clone(&ch);
    let sender = thread::spawn(move || tx.send("C"));
    wait_for(|| ch.waiting_senders() == 1);
    assert!(!sender.is_finished());

    assert_eq!(ch.receive(), Some("A"));
    sender.join().unwrap().unwrap();
    assert_eq!(ch.receive(), Some("B"));
    assert_eq!(ch.receive(), Some("C"));
    assert!(ch.is_empty());
}

#[test]
fn test_await_timeout_then_result() {
    let ctx = ctx();
    let mut handle = ctx
        .spawn(SpawnOptions::new().name("sleepy"), |_| {
            thread::sleep(Duration::from_millis(50));
            Ok(7)
        })
        .unwrap();

    assert!(handle.await_timeout(Duration::from_millis(10)).is_timed_out());
    assert_eq!(ctx.stats().tasks_timeout, 1);
    match handle.await_timeout(Duration::from_secs(5)) {
        Timed::Ready(result) => assert_eq!(result.unwrap(), 7),
        Timed::TimedOut => panic!("task did not finish"),
    }
}

#[test]
fn test_round_robin_splits_submissions() {
    let ctx = ctx();
    let pools = vec![
        Arc::new(WorkerPool::new(&ctx, "rr0", 1, 8).unwrap()),
        Arc::new(WorkerPool::new(&ctx, "rr1", 1, 8).unwrap()),
    ];
    let lb = LoadBalancer::new(pools, Strategy::RoundRobin).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            lb.submit(move |_| {
                let worker = thread::current().name().unwrap_or_default().to_string();
                Ok((i, worker))
            })
            .unwrap()
        })
        .collect();

    let placed: Vec<(i32, String)> = handles
        .into_iter()
        .map(|h| h.await_result().unwrap())
        .collect();
    for (i, worker) in &placed {
        let expected = if i % 2 == 0 { "rr0" } else { "rr1" };
        assert!(worker.contains(expected), "job {} ran on {}", i, worker);
    }
    lb.shutdown(true);
    assert_eq!(lb.pools()[0].stats().completed, 2);
    assert_eq!(lb.pools()[1].stats().completed, 2);
}

#[test]
fn test_foreign_thread_callbacks_drain_by_priority() {
    let ctx = ctx();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let foreign = {
        let ctx = Arc::clone(&ctx);
        let order = Arc::clone(&order);
        thread::spawn(move || {
            for (label, prio) in [("low-1", Priority::LOW), ("high", Priority::HIGH), ("low-2", Priority::LOW)] {
                let order = Arc::clone(&order);
                ctx.callbacks()
                    .enqueue_callback(prio, move || {
                        order.lock().push(label);
                        Ok(())
                    })
                    .unwrap();
            }
        })
    };
    foreign.join().unwrap();

    let _guard = ctx.bridge().guard().unwrap();
    let report = ctx.callbacks().process_all().unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(*order.lock(), vec!["high", "low-1", "low-2"]);
    assert_eq!(ctx.stats().callbacks_processed, 3);
}

#[test]
fn test_semaphore_permits_stay_in_bounds() {
    let sem = Arc::new(Semaphore::new(2, 2).unwrap());
    let peak = Arc::new(AtomicUsize::new(0));
    let inside = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..6)
        .map(|_| {
            let (sem, peak, inside) = (Arc::clone(&sem), Arc::clone(&peak), Arc::clone(&inside));
            thread::spawn(move || {
                for _ in 0..20 {
                    sem.acquire().unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    assert!(sem.available_permits() <= sem.max_permits());
                    inside.fetch_sub(1, Ordering::SeqCst);
                    sem.release().unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(sem.available_permits(), 2);
    let err = sem.release().unwrap_err();
    assert!(matches!(err, RuntimeError::CapacityExceeded { limit: 2, .. }));
    assert_eq!(sem.available_permits(), 2);
}

#[test]
fn test_barrier_needs_all_parties() {
    const N: usize = 4;
    let barrier = Arc::new(Barrier::new(N).unwrap());
    let released = Arc::new(AtomicUsize::new(0));

    let early: Vec<_> = (0..N - 1)
        .map(|_| {
            let (barrier, released) = (Arc::clone(&barrier), Arc::clone(&released));
            thread::spawn(move || {
                let r = barrier.wait().unwrap();
                released.fetch_add(1, Ordering::SeqCst);
                r
            })
        })
        .collect();

    wait_for(|| barrier.waiting_count() == N - 1);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(released.load(Ordering::SeqCst), 0);

    let last = barrier.wait().unwrap();
    let mut leaders = usize::from(last.is_leader);
    for h in early {
        let r = h.join().unwrap();
        assert_eq!(r.generation, last.generation);
        leaders += usize::from(r.is_leader);
    }
    assert_eq!(leaders, 1);
    assert_eq!(barrier.generation(), 1);
}

#[test]
fn test_close_twice_is_noop() {
    let ctx = ctx();
    let ch = ctx.channel::<u8>(1);
    ch.send(9).unwrap();
    assert!(ch.close());
    assert!(!ch.close());
    assert!(ch.is_closed());
    // 关闭后仍可取完剩余数据
    assert_eq!(ch.receive(), Some(9));
    assert_eq!(ch.receive(), None);
}

#[test]
fn test_fifo_across_threads_and_capacity_bound() {
    let ctx = ctx();
    let ch = Arc::new(ctx.channel(3));
    let tx = Arc::clone(&ch);
    let producer = thread::spawn(move || {
        for i in 0..200u32 {
            tx.send(i).unwrap();
        }
        tx.close();
    });

    let mut got = Vec::new();
    while let Some(v) = ch.receive() {
        assert!(ch.len() <= 3);
        got.push(v);
    }
    producer.join().unwrap();
    assert_eq!(got, (0..200).collect::<Vec<_>>());
}

#[test]
fn test_rendezvous_round_trip() {
    let ctx = ctx();
    let ch = Arc::new(ctx.channel::<String>(0));
    let tx = Arc::clone(&ch);
    let expected = "payload".to_string();
    let sent = expected.clone();
    let sender = thread::spawn(move || tx.send(sent));
    assert_eq!(ch.receive(), Some(expected));
    sender.join().unwrap().unwrap();
}

#[test]
fn test_pipeline_end_to_end() {
    let ctx = ctx();
    let input = Arc::new(ctx.channel(4));
    let out = qlang_concurrency::runtime::Pipeline::new(&ctx, Arc::clone(&input))
        .stage(4, |x: u64| x * 3)
        .unwrap()
        .filter_stage(4, |x: u64| (x % 2 == 0).then_some(x))
        .unwrap()
        .output();

    for i in 1..=10 {
        input.send(i).unwrap();
    }
    input.close();

    let results: Vec<u64> = out.output().iter().collect();
    assert_eq!(results, vec![6, 12, 18, 24, 30]);
    out.join().unwrap();
}
