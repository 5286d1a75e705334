//! Priority tiers and type-erased queue items.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{Result, TollgateError};

/// Queue tier of a submitted request.
///
/// `High` always preempts `Medium` and `Low`; there is no weighted fairness,
/// so `Low` work may starve under sustained load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Interactive work the user is waiting on.
    High,
    #[default]
    Medium,
    /// Background or speculative work.
    Low,
}

impl Priority {
    /// All tiers in dispatch order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    /// Lower-case label used in metrics.
    pub fn label(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        })
    }
}

impl FromStr for Priority {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HIGH" => Ok(Priority::High),
            "MEDIUM" => Ok(Priority::Medium),
            "LOW" => Ok(Priority::Low),
            other => Err(TollgateError::InvalidInput(format!(
                "unknown priority '{other}' (expected HIGH, MEDIUM or LOW)"
            ))),
        }
    }
}

/// A unit of work the dispatch loop can run repeatedly and settle once.
#[async_trait]
pub(crate) trait Job: Send {
    /// Run the work once. On success the caller has already been answered.
    async fn attempt(&mut self) -> Result<()>;

    /// Settle the caller with a terminal error.
    fn reject(self: Box<Self>, err: TollgateError);
}

/// [`Job`] over a concrete work closure and its reply channel.
pub(crate) struct TypedJob<T, F> {
    work: F,
    reply: Option<oneshot::Sender<Result<T>>>,
}

impl<T, F> TypedJob<T, F> {
    pub(crate) fn new(work: F, reply: oneshot::Sender<Result<T>>) -> Self {
        Self {
            work,
            reply: Some(reply),
        }
    }
}

#[async_trait]
impl<T, F, Fut> Job for TypedJob<T, F>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    async fn attempt(&mut self) -> Result<()> {
        let value = (self.work)().await?;
        if let Some(reply) = self.reply.take() {
            // Receiver gone means the caller stopped caring; the work still ran.
            let _ = reply.send(Ok(value));
        }
        Ok(())
    }

    fn reject(mut self: Box<Self>, err: TollgateError) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(err));
        }
    }
}

/// One pending request.
pub(crate) struct QueueItem {
    pub(crate) id: u64,
    pub(crate) priority: Priority,
    /// Transient-error retries so far.
    pub(crate) retries: u32,
    pub(crate) job: Box<dyn Job>,
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItem")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

/// Three FIFO queues, drained strictly by priority.
#[derive(Debug, Default)]
pub(crate) struct PriorityQueues {
    tiers: [VecDeque<QueueItem>; 3],
}

impl PriorityQueues {
    /// Enqueue a fresh submission behind its tier.
    pub(crate) fn push_back(&mut self, item: QueueItem) {
        self.tiers[item.priority.index()].push_back(item);
    }

    /// Requeue an attempted item ahead of never-attempted ones in `tier`.
    pub(crate) fn push_front(&mut self, tier: Priority, item: QueueItem) {
        self.tiers[tier.index()].push_front(item);
    }

    /// Next item: front of High, else Medium, else Low.
    pub(crate) fn pop_next(&mut self) -> Option<QueueItem> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    pub(crate) fn len(&self, tier: Priority) -> usize {
        self.tiers[tier.index()].len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }
}
