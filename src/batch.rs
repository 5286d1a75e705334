//! Micro-batching of small completion requests.
//!
//! Many tiny prompts ("validate this id", "score this lead") cost one
//! rate-limit token each when sent alone. A [`BatchProcessor`] collects them
//! and sends a single `High` priority call for the whole group, then stores
//! every output in the cache under its own key.
//!
//! A batch is flushed when it reaches `max_batch_size` items or when
//! `max_wait` has passed since its first item arrived, whichever comes first.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::cache::{FetchOptions, TieredCache};
use crate::scheduler::{Priority, RequestScheduler};
use crate::{Result, TollgateError};

/// Batch sizing and naming.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Used as the cache tag of every stored output and in logs.
    pub processor_name: String,
    pub max_batch_size: usize,
    pub max_wait: Duration,
}

impl BatchConfig {
    pub fn new(processor_name: impl Into<String>, max_batch_size: usize, max_wait: Duration) -> Self {
        Self {
            processor_name: processor_name.into(),
            max_batch_size: max_batch_size.max(1),
            max_wait,
        }
    }
}

type BatchHandler<I, O> = Arc<dyn Fn(Vec<I>) -> BoxFuture<'static, Result<Vec<O>>> + Send + Sync>;

/// Groups individually added inputs into scheduled batch calls.
///
/// The handler receives the inputs in arrival order and must return outputs
/// in the same order. It may be invoked more than once for one batch when the
/// scheduler retries.
pub struct BatchProcessor<I, O> {
    inner: Arc<Inner<I, O>>,
}

impl<I, O> Clone for BatchProcessor<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<I, O> {
    config: BatchConfig,
    scheduler: Arc<RequestScheduler>,
    cache: Arc<TieredCache>,
    handler: BatchHandler<I, O>,
    pending: Mutex<Pending<I, O>>,
}

struct Pending<I, O> {
    items: Vec<Waiting<I, O>>,
    /// Bumped on every flush so a stale timer cannot flush a newer batch.
    generation: u64,
    timer_armed: bool,
}

struct Waiting<I, O> {
    key: String,
    input: I,
    reply: oneshot::Sender<Result<O>>,
}

impl<I, O> BatchProcessor<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new<F, Fut>(
        config: BatchConfig,
        scheduler: Arc<RequestScheduler>,
        cache: Arc<TieredCache>,
        handler: F,
    ) -> Self
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<O>>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                config,
                scheduler,
                cache,
                handler: Arc::new(move |inputs| handler(inputs).boxed()),
                pending: Mutex::new(Pending {
                    items: Vec::new(),
                    generation: 0,
                    timer_armed: false,
                }),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Resolve `input`, from the cache when `key` is fresh there, otherwise
    /// as part of the next batch.
    pub async fn add(&self, key: &str, input: I) -> Result<O> {
        if let Some(cached) = self.inner.cache.get::<O>(key).await {
            return Ok(cached);
        }

        let (tx, rx) = oneshot::channel();
        let full = {
            let mut pending = self.inner.lock();
            pending.items.push(Waiting {
                key: key.to_string(),
                input,
                reply: tx,
            });
            if pending.items.len() >= self.inner.config.max_batch_size {
                Some(take_batch(&mut pending))
            } else {
                if !pending.timer_armed {
                    pending.timer_armed = true;
                    self.arm_timer(pending.generation);
                }
                None
            }
        };
        if let Some(batch) = full {
            tokio::spawn(Arc::clone(&self.inner).flush(batch));
        }

        rx.await.unwrap_or(Err(TollgateError::SchedulerClosed))
    }

    /// Number of inputs waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.inner.lock().items.len()
    }

    fn arm_timer(&self, generation: u64) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.max_wait).await;
            let batch = {
                let mut pending = inner.lock();
                if pending.generation != generation || pending.items.is_empty() {
                    return;
                }
                take_batch(&mut pending)
            };
            inner.flush(batch).await;
        });
    }
}

fn take_batch<I, O>(pending: &mut Pending<I, O>) -> Vec<Waiting<I, O>> {
    pending.generation += 1;
    pending.timer_armed = false;
    std::mem::take(&mut pending.items)
}

impl<I, O> Inner<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Pending<I, O>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn flush(self: Arc<Self>, batch: Vec<Waiting<I, O>>) {
        let name = &self.config.processor_name;
        let size = batch.len();
        debug!(processor = %name, size, "flushing batch");

        let inputs: Arc<[I]> = batch.iter().map(|w| w.input.clone()).collect();
        let handler = Arc::clone(&self.handler);
        let result = self
            .scheduler
            .submit(move || handler(inputs.to_vec()), Priority::High)
            .await;

        match result {
            Ok(outputs) => {
                if outputs.len() != size {
                    warn!(
                        processor = %name,
                        inputs = size,
                        outputs = outputs.len(),
                        "batch output count does not match input count"
                    );
                }
                let mut outputs = outputs.into_iter();
                for waiting in batch {
                    match outputs.next() {
                        Some(output) => {
                            let options = FetchOptions::new().tag(name.clone());
                            self.cache.insert(&waiting.key, &output, options).await;
                            let _ = waiting.reply.send(Ok(output));
                        }
                        None => {
                            let _ = waiting.reply.send(Err(TollgateError::BatchItemMissing));
                        }
                    }
                }
            }
            Err(e) => {
                error!(processor = %name, size, error = %e, "batch failed");
                let message = e.to_string();
                for waiting in batch {
                    let _ = waiting.reply.send(Err(TollgateError::BatchFailed {
                        processor: name.clone(),
                        message: message.clone(),
                    }));
                }
            }
        }
    }
}

impl<I, O> std::fmt::Debug for BatchProcessor<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
