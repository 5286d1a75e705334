//! Priority request scheduler.
//!
//! Every outbound call to the rate-limited completion service goes through
//! a [`RequestScheduler`]. It combines three mechanisms:
//!
//! - **Token bucket** — at most `max_requests_per_minute` dispatches, with
//!   a burst capacity of one token by default.
//! - **Priority queues** — `High`, then `Medium`, then `Low`, FIFO within a
//!   tier. Retried items re-enter at the front of their tier.
//! - **Circuit breaker** — a rate-limit response pauses all dispatch for
//!   `pause_base + random(0..pause_jitter)` and puts the failed item at the
//!   front of the `High` queue, whatever its original priority.
//!
//! Transient failures are retried in place with exponential backoff; the
//! dispatch loop waits out the backoff before taking the next item, so at
//! most one outbound call is ever in flight.
//!
//! # Dispatch loop
//!
//! The loop is a single tokio task spawned by the first `submit` that finds
//! the scheduler idle. It runs until all queues are empty. The `processing`
//! flag lives under the same lock as the queues, so a submit racing with the
//! loop's exit either lands in a queue the loop will still drain or spawns a
//! fresh loop. A job that panics is rejected like a permanent failure and
//! the loop carries on.

mod bucket;
mod queue;

pub use queue::Priority;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use pin_project_lite::pin_project;
use rand::Rng;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::SchedulerConfig;
use crate::error::FailureClass;
use crate::telemetry;
use crate::{Result, TollgateError};

use bucket::TokenBucket;
use queue::{PriorityQueues, QueueItem, TypedJob};

/// Point-in-time view of scheduler counters and queue depths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerMetrics {
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub pending_high: usize,
    pub pending_medium: usize,
    pub pending_low: usize,
}

pin_project! {
    /// Handle to a submitted request.
    ///
    /// Resolves exactly once, with the work's value or its terminal error.
    /// Dropping the ticket does not cancel the work; it still runs and still
    /// consumes a token.
    #[must_use = "the result of a submitted request is only observable through its ticket"]
    pub struct Ticket<T> {
        id: u64,
        #[pin]
        reply: oneshot::Receiver<Result<T>>,
    }
}

impl<T> Ticket<T> {
    /// Identifier assigned at submission, as it appears in logs.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Future for Ticket<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().reply.poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TollgateError::SchedulerClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Rate-limited, prioritised executor for outbound calls.
///
/// Cheap to clone; clones share the same queues, bucket and breaker, so
/// every call site draws from one rate budget.
#[derive(Clone)]
pub struct RequestScheduler {
    shared: Arc<Shared>,
}

struct Shared {
    config: SchedulerConfig,
    state: Mutex<State>,
    next_id: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

struct State {
    queues: PriorityQueues,
    bucket: TokenBucket,
    paused_until: Option<Instant>,
    processing: bool,
}

enum Step {
    Paused(Instant),
    Throttled(Instant),
    Dispatch(QueueItem),
    Idle,
}

impl RequestScheduler {
    /// Create a scheduler. Fails if the config is unusable.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let bucket = TokenBucket::new(
            config.burst_capacity,
            config.refill_interval(),
            Instant::now(),
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    queues: PriorityQueues::default(),
                    bucket,
                    paused_until: None,
                    processing: false,
                }),
                next_id: AtomicU64::new(1),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
            }),
        })
    }

    /// The configuration this scheduler runs with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Queue `work` at `priority` and return immediately.
    ///
    /// `work` is invoked once per attempt, so it must be able to rebuild the
    /// outbound call (retries and circuit-breaker requeues call it again).
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context when the dispatch loop has to be
    /// started.
    pub fn submit<T, F, Fut>(&self, work: F, priority: Priority) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let item = QueueItem {
            id,
            priority,
            retries: 0,
            job: Box::new(TypedJob::new(work, tx)),
        };

        let start_loop = {
            let mut state = self.shared.lock();
            state.queues.push_back(item);
            debug!(
                id,
                %priority,
                high = state.queues.len(Priority::High),
                medium = state.queues.len(Priority::Medium),
                low = state.queues.len(Priority::Low),
                "request queued"
            );
            record_pending(&state.queues);
            !std::mem::replace(&mut state.processing, true)
        };
        metrics::counter!(telemetry::SUBMITTED_TOTAL, "priority" => priority.label()).increment(1);

        if start_loop {
            tokio::spawn(run(Arc::clone(&self.shared)));
        }

        Ticket { id, reply: rx }
    }

    /// Counters and current queue depths.
    pub fn metrics(&self) -> SchedulerMetrics {
        let state = self.shared.lock();
        SchedulerMetrics {
            total_processed: self.shared.processed.load(Ordering::Relaxed),
            total_failed: self.shared.failed.load(Ordering::Relaxed),
            total_retries: self.shared.retries.load(Ordering::Relaxed),
            pending_high: state.queues.len(Priority::High),
            pending_medium: state.queues.len(Priority::Medium),
            pending_low: state.queues.len(Priority::Low),
        }
    }

    /// End of the current circuit-breaker pause, if one is active.
    pub fn paused_until(&self) -> Option<Instant> {
        let state = self.shared.lock();
        state.paused_until.filter(|until| *until > Instant::now())
    }

    /// Whether a dispatch loop is currently running.
    pub fn is_processing(&self) -> bool {
        self.shared.lock().processing
    }
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("config", &self.shared.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

async fn run(shared: Arc<Shared>) {
    loop {
        match shared.next_step(Instant::now()) {
            Step::Idle => return,
            Step::Paused(until) => {
                debug!(
                    wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "circuit open, dispatch paused"
                );
                tokio::time::sleep_until(until).await;
            }
            Step::Throttled(until) => tokio::time::sleep_until(until).await,
            Step::Dispatch(item) => shared.dispatch(item).await,
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide what the loop does next. Consumes a token when it dispatches.
    fn next_step(&self, now: Instant) -> Step {
        let mut state = self.lock();

        if let Some(until) = state.paused_until {
            if now < until {
                return Step::Paused(until);
            }
            state.paused_until = None;
        }

        if state.queues.is_empty() {
            state.processing = false;
            return Step::Idle;
        }

        match state.bucket.try_take(now) {
            Err(wait) => Step::Throttled(now + wait),
            Ok(()) => match state.queues.pop_next() {
                Some(item) => {
                    record_pending(&state.queues);
                    Step::Dispatch(item)
                }
                None => {
                    state.processing = false;
                    Step::Idle
                }
            },
        }
    }

    async fn dispatch(&self, mut item: QueueItem) {
        metrics::counter!(telemetry::DISPATCHED_TOTAL, "priority" => item.priority.label())
            .increment(1);
        debug!(id = item.id, priority = %item.priority, attempt = item.retries + 1, "dispatching");

        match AssertUnwindSafe(item.job.attempt()).catch_unwind().await {
            Ok(Ok(())) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::PROCESSED_TOTAL).increment(1);
            }
            Ok(Err(err)) => self.handle_failure(item, err).await,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::FAILED_TOTAL).increment(1);
                error!(id = item.id, priority = %item.priority, %reason, "request panicked");
                item.job
                    .reject(TollgateError::Permanent(format!("request panicked: {reason}")));
            }
        }
    }

    async fn handle_failure(&self, mut item: QueueItem, err: TollgateError) {
        match err.failure_class() {
            FailureClass::RateLimit => {
                let pause = self.pause_duration(err.retry_after());
                let until = Instant::now() + pause;
                warn!(
                    id = item.id,
                    priority = %item.priority,
                    pause_ms = pause.as_millis() as u64,
                    error = %err,
                    "rate limited, pausing dispatch"
                );
                metrics::counter!(telemetry::CIRCUIT_TRIPS_TOTAL).increment(1);

                let mut state = self.lock();
                state.paused_until = Some(state.paused_until.map_or(until, |p| p.max(until)));
                state.queues.push_front(Priority::High, item);
                record_pending(&state.queues);
            }
            FailureClass::Transient if item.retries + 1 < self.config.max_attempts => {
                item.retries += 1;
                self.retries.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::RETRIES_TOTAL).increment(1);

                let delay = self.config.backoff_for_retry(item.retries);
                warn!(
                    id = item.id,
                    attempt = item.retries,
                    max_attempts = self.config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient error"
                );
                tokio::time::sleep(delay).await;

                let mut state = self.lock();
                let tier = item.priority;
                state.queues.push_front(tier, item);
                record_pending(&state.queues);
            }
            _ => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::FAILED_TOTAL).increment(1);
                error!(
                    id = item.id,
                    priority = %item.priority,
                    attempts = item.retries + 1,
                    error = %err,
                    "request failed"
                );
                item.job.reject(err);
            }
        }
    }

    /// `pause_base + random(0..=pause_jitter)`, stretched to honour a longer
    /// provider hint.
    fn pause_duration(&self, retry_after: Option<Duration>) -> Duration {
        let jitter_ms = self.config.pause_jitter.as_millis() as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        let pause = self.config.pause_base + jitter;
        retry_after.map_or(pause, |hint| pause.max(hint))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

fn record_pending(queues: &PriorityQueues) {
    for tier in Priority::ALL {
        metrics::gauge!(telemetry::PENDING, "priority" => tier.label()).set(queues.len(tier) as f64);
    }
}
