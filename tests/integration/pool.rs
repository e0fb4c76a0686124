//! End-to-end worker pool behaviour through the public API.

use std::time::{Duration, Instant};

use serde_json::json;
use taskframe::{Pool, PoolConfig, PoolState, TaskError, TaskFault, TaskKind};

#[test]
fn test_two_workers_run_three_sleeps_in_two_rounds() {
    const DELAY: u64 = 100;
    let pool = Pool::new(2).unwrap();

    let start = Instant::now();
    let handles: Vec<_> = (0..3)
        .map(|_| pool.submit(TaskKind::Sleep, json!(DELAY)))
        .collect();
    for handle in handles {
        assert_eq!(handle.wait(), Ok(json!(DELAY)));
    }
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(2 * DELAY), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(3 * DELAY), "{elapsed:?}");
    assert_eq!(pool.stats().peak_active.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[test]
fn test_mixed_workload() {
    let pool = Pool::with_config(PoolConfig {
        size: 4,
        queue_capacity: None,
    })
    .unwrap();

    let fibs: Vec<_> = (0..40u64)
        .map(|n| (n, pool.submit(TaskKind::Fibonacci, json!(n))))
        .collect();
    let primes = pool.submit(TaskKind::CountPrimes, json!(1_000_000));
    let sorted = pool.submit(TaskKind::Sort, json!([5, 3, 9, 1]));

    let (mut a, mut b) = (0u64, 1u64);
    for (n, handle) in fibs {
        assert_eq!(handle.wait(), Ok(json!(a)), "fibonacci({n})");
        (a, b) = (b, a + b);
    }
    assert_eq!(primes.wait(), Ok(json!(78_498)));
    assert_eq!(sorted.wait(), Ok(json!([1, 3, 5, 9])));
}

#[test]
fn test_faulty_task_does_not_poison_pool() {
    let pool = Pool::new(2).unwrap();

    let overflow = pool.submit(TaskKind::Fibonacci, json!(100));
    let invalid = pool.submit(TaskKind::Sum, json!("not a list"));
    let fine = pool.submit(TaskKind::Sum, json!([40, 2]));

    assert!(matches!(
        overflow.wait(),
        Err(TaskError::TaskExecutionFault {
            kind: TaskKind::Fibonacci,
            cause: TaskFault::Overflow(_),
        })
    ));
    assert!(matches!(
        invalid.wait(),
        Err(TaskError::TaskExecutionFault {
            cause: TaskFault::InvalidPayload { .. },
            ..
        })
    ));
    assert_eq!(fine.wait(), Ok(json!(42)));
    assert_eq!(pool.state(), PoolState::Running);
}

#[test]
fn test_terminate_under_load() {
    let pool = Pool::new(2).unwrap();
    let handles: Vec<_> = (0..20)
        .map(|_| pool.submit(TaskKind::Sleep, json!(20)))
        .collect();

    pool.terminate().wait();
    assert_eq!(pool.state(), PoolState::Closed);

    let mut finished = 0;
    let mut closed = 0;
    for handle in handles {
        match handle.wait() {
            Ok(_) => finished += 1,
            Err(TaskError::PoolClosed) => closed += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(finished + closed, 20);
    assert!(closed >= 1, "finished {finished}, closed {closed}");
}
