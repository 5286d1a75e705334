//! Timing and ordering behaviour of `RequestScheduler`.
//!
//! All tests run on tokio's paused clock, so multi-second waits complete
//! instantly and elapsed times are exact up to timer granularity (1ms).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready_ok, task};

use tollgate::{Priority, RequestScheduler, SchedulerConfig, TollgateError};

/// Shared log of `(label, start time)` pairs written by test work.
#[derive(Clone, Default)]
struct Starts(Arc<Mutex<Vec<(&'static str, Instant)>>>);

impl Starts {
    fn record(&self, label: &'static str) {
        self.0.lock().unwrap().push((label, Instant::now()));
    }

    fn labels(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().iter().map(|(l, _)| *l).collect()
    }

    fn times(&self) -> Vec<Instant> {
        self.0.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }
}

fn default_scheduler() -> RequestScheduler {
    RequestScheduler::new(SchedulerConfig::default()).unwrap()
}

/// `elapsed >= expected`, allowing one timer tick of rounding.
fn assert_at_least(elapsed: Duration, expected: Duration) {
    assert!(
        elapsed + Duration::from_millis(1) >= expected,
        "elapsed {elapsed:?}, expected at least {expected:?}"
    );
}

// ============================================================================
// Rate bound
// ============================================================================

#[tokio::test(start_paused = true)]
async fn dispatch_rate_never_exceeds_budget() {
    let scheduler = default_scheduler();
    let starts = Starts::default();

    let tickets: Vec<_> = (0..20)
        .map(|_| {
            let starts = starts.clone();
            scheduler.submit(
                move || {
                    let starts = starts.clone();
                    async move {
                        starts.record("item");
                        Ok(())
                    }
                },
                Priority::High,
            )
        })
        .collect();
    for ticket in tickets {
        ticket.await.unwrap();
    }

    let times = starts.times();
    assert_eq!(times.len(), 20);
    for (i, t) in times.iter().enumerate() {
        assert_at_least(t.duration_since(times[0]), Duration::from_millis(4000) * i as u32);
    }
    // the 16th request cannot go out within the first minute's 15
    assert_at_least(times[15].duration_since(times[0]), Duration::from_secs(60));
    assert_eq!(scheduler.metrics().total_processed, 20);
}

// ============================================================================
// Priority precedence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn higher_priority_dispatches_first() {
    let scheduler = default_scheduler();
    let starts = Starts::default();

    let submit = |label: &'static str, priority| {
        let starts = starts.clone();
        scheduler.submit(
            move || {
                let starts = starts.clone();
                async move {
                    starts.record(label);
                    Ok(())
                }
            },
            priority,
        )
    };

    // queued before the dispatch loop gets to run
    let tickets = vec![
        submit("low-1", Priority::Low),
        submit("low-2", Priority::Low),
        submit("medium-1", Priority::Medium),
        submit("high-1", Priority::High),
        submit("high-2", Priority::High),
    ];
    for ticket in tickets {
        ticket.await.unwrap();
    }

    assert_eq!(
        starts.labels(),
        vec!["high-1", "high-2", "medium-1", "low-1", "low-2"]
    );
}

#[tokio::test(start_paused = true)]
async fn pending_counts_per_tier() {
    let scheduler = default_scheduler();
    let first = scheduler.submit(|| async { Ok(()) }, Priority::High);
    first.await.unwrap();

    let _a = scheduler.submit(|| async { Ok(()) }, Priority::Low);
    let _b = scheduler.submit(|| async { Ok(()) }, Priority::Low);
    let _c = scheduler.submit(|| async { Ok(()) }, Priority::Medium);

    let metrics = scheduler.metrics();
    assert_eq!(metrics.pending_high, 0);
    assert_eq!(metrics.pending_medium, 1);
    assert_eq!(metrics.pending_low, 2);
}

// ============================================================================
// Retry and backoff
// ============================================================================

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_with_backoff() {
    let scheduler = default_scheduler();
    let calls = Arc::new(AtomicU32::new(0));
    let start = Instant::now();

    let counter = Arc::clone(&calls);
    let value = scheduler
        .submit(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TollgateError::Api {
                            status: 503,
                            message: "unavailable".into(),
                        })
                    } else {
                        Ok("done")
                    }
                }
            },
            Priority::Medium,
        )
        .await
        .unwrap();

    assert_eq!(value, "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 2s + 4s of backoff
    assert_at_least(start.elapsed(), Duration::from_secs(6));

    let metrics = scheduler.metrics();
    assert_eq!(metrics.total_retries, 2);
    assert_eq!(metrics.total_processed, 1);
    assert_eq!(metrics.total_failed, 0);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_after_three_attempts() {
    let scheduler = default_scheduler();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let result: Result<(), _> = scheduler
        .submit(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TollgateError::Http("connection reset".into()))
                }
            },
            Priority::Low,
        )
        .await;

    assert!(matches!(result, Err(TollgateError::Http(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let metrics = scheduler.metrics();
    assert_eq!(metrics.total_failed, 1);
    assert_eq!(metrics.total_retries, 2);
    assert_eq!(metrics.total_processed, 0);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_rejects_immediately() {
    let scheduler = default_scheduler();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let result: Result<(), _> = scheduler
        .submit(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TollgateError::Api {
                        status: 400,
                        message: "invalid prompt".into(),
                    })
                }
            },
            Priority::High,
        )
        .await;

    assert!(matches!(result, Err(TollgateError::Api { status: 400, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.metrics().total_retries, 0);
    assert_eq!(scheduler.metrics().total_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn failures_do_not_poison_later_items() {
    let scheduler = default_scheduler();
    let bad: tollgate::Ticket<()> = scheduler.submit(
        || async { Err(TollgateError::Permanent("nope".into())) },
        Priority::High,
    );
    let good = scheduler.submit(|| async { Ok(1) }, Priority::High);

    assert!(bad.await.is_err());
    assert_eq!(good.await.unwrap(), 1);
}

async fn explode() -> tollgate::Result<u32> {
    panic!("response parser exploded")
}

#[tokio::test(start_paused = true)]
async fn panicking_work_is_rejected_and_loop_survives() {
    let scheduler = default_scheduler();
    let bad = scheduler.submit(explode, Priority::High);
    let good = scheduler.submit(|| async { Ok(2) }, Priority::High);

    match bad.await {
        Err(TollgateError::Permanent(message)) => {
            assert!(message.contains("response parser exploded"), "{message}");
        }
        other => panic!("expected a permanent rejection, got {other:?}"),
    }
    assert_eq!(good.await.unwrap(), 2);

    let metrics = scheduler.metrics();
    assert_eq!(metrics.total_failed, 1);
    assert_eq!(metrics.total_processed, 1);

    // once drained, a later submit starts a fresh loop
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!scheduler.is_processing());
    let later = scheduler.submit(|| async { Ok(3) }, Priority::Low);
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(10), later).await.unwrap().unwrap(),
        3
    );
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[tokio::test(start_paused = true)]
async fn rate_limit_pauses_all_dispatch_and_requeues_first() {
    let config = SchedulerConfig::new().pause(Duration::from_secs(10), Duration::ZERO);
    let scheduler = RequestScheduler::new(config).unwrap();
    let starts = Starts::default();
    let limited_once = Arc::new(AtomicU32::new(0));

    let limited = {
        let starts = starts.clone();
        let limited_once = Arc::clone(&limited_once);
        scheduler.submit(
            move || {
                let starts = starts.clone();
                let limited_once = Arc::clone(&limited_once);
                async move {
                    starts.record("limited");
                    if limited_once.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TollgateError::RateLimited { retry_after: None })
                    } else {
                        Ok(())
                    }
                }
            },
            Priority::Low,
        )
    };

    // let the first attempt fail and open the circuit
    tokio::time::sleep(Duration::from_millis(1)).await;
    let tripped_at = starts.times()[0];
    let until = scheduler.paused_until().expect("circuit should be open");
    assert_at_least(until.duration_since(tripped_at), Duration::from_secs(10));

    let others: Vec<_> = ["high-1", "high-2"]
        .into_iter()
        .map(|label| {
            let starts = starts.clone();
            scheduler.submit(
                move || {
                    let starts = starts.clone();
                    async move {
                        starts.record(label);
                        Ok(())
                    }
                },
                Priority::High,
            )
        })
        .collect();

    limited.await.unwrap();
    for ticket in others {
        ticket.await.unwrap();
    }

    assert_eq!(starts.labels(), vec!["limited", "limited", "high-1", "high-2"]);
    for t in &starts.times()[1..] {
        assert!(*t >= until, "dispatched before the pause ended");
    }
    assert!(scheduler.paused_until().is_none());
    assert_eq!(scheduler.metrics().total_retries, 0);
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_extends_pause() {
    let config = SchedulerConfig::new().pause(Duration::from_secs(10), Duration::ZERO);
    let scheduler = RequestScheduler::new(config).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let start = Instant::now();

    let counter = Arc::clone(&calls);
    scheduler
        .submit(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TollgateError::RateLimited {
                            retry_after: Some(Duration::from_secs(45)),
                        })
                    } else {
                        Ok(())
                    }
                }
            },
            Priority::Medium,
        )
        .await
        .unwrap();

    assert_at_least(start.elapsed(), Duration::from_secs(45));
}

// ============================================================================
// Tickets
// ============================================================================

#[tokio::test(start_paused = true)]
async fn ticket_stays_pending_until_dispatched() {
    let scheduler = default_scheduler();
    let first = scheduler.submit(|| async { Ok(1) }, Priority::High);
    let mut second = task::spawn(scheduler.submit(|| async { Ok(2) }, Priority::High));

    assert_pending!(second.poll());
    assert_eq!(first.await.unwrap(), 1);
    assert_pending!(second.poll());

    tokio::time::sleep(Duration::from_millis(4100)).await;
    assert!(second.is_woken());
    assert_eq!(assert_ready_ok!(second.poll()), 2);
}

#[tokio::test(start_paused = true)]
async fn dropped_ticket_still_runs() {
    let scheduler = default_scheduler();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    drop(scheduler.submit(
        move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
        Priority::Low,
    ));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.metrics().total_processed, 1);
}

#[tokio::test(start_paused = true)]
async fn ticket_ids_are_unique() {
    let scheduler = default_scheduler();
    let a = scheduler.submit(|| async { Ok(()) }, Priority::Low);
    let b = scheduler.submit(|| async { Ok(()) }, Priority::Low);
    assert_ne!(a.id(), b.id());
    a.await.unwrap();
    b.await.unwrap();
}
