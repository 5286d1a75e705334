//! Call-site adapter tying the scheduler and a cache together.
//!
//! Outbound completion calls go through [`Gateway::call`] or
//! [`Gateway::call_with_fallback`]: the cache is consulted first when the
//! caller supplies a key, and only a miss costs a scheduled call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::cache::{FetchOptions, TieredCache};
use crate::scheduler::{Priority, RequestScheduler};
use crate::{Result, TollgateError};

/// Per-call routing and caching options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub priority: Priority,
    /// Cache key; `None` bypasses the cache entirely.
    pub cache_key: Option<String>,
    /// Lifetime of the cached result. `None` uses the cache default.
    pub ttl: Option<Duration>,
    /// Invalidation tags. Empty means `[function_name]`.
    pub tags: Vec<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    fn fetch_options(&self, function_name: &str) -> FetchOptions {
        let mut options = FetchOptions::new();
        options.ttl = self.ttl;
        options.tags = if self.tags.is_empty() {
            vec![function_name.to_string()]
        } else {
            self.tags.clone()
        };
        options
    }
}

/// Primary model plus an optional cheaper model to fall back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChain {
    pub primary: String,
    pub fallback: Option<String>,
}

impl ModelChain {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, model: impl Into<String>) -> Self {
        self.fallback = Some(model.into());
        self
    }
}

/// Scheduled, cached access to the completion service.
#[derive(Debug, Clone)]
pub struct Gateway {
    scheduler: Arc<RequestScheduler>,
    cache: Arc<TieredCache>,
}

impl Gateway {
    pub fn new(scheduler: Arc<RequestScheduler>, cache: Arc<TieredCache>) -> Self {
        Self { scheduler, cache }
    }

    pub fn scheduler(&self) -> &Arc<RequestScheduler> {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// Run `work` through the scheduler, behind the cache when
    /// `options.cache_key` is set.
    pub async fn call<T, F, Fut>(&self, function_name: &str, options: RequestOptions, work: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let priority = options.priority;
        let submit = move || self.scheduler.submit(work, priority);
        match options.cache_key.as_deref() {
            Some(key) => {
                self.cache
                    .fetch(key, submit, options.fetch_options(function_name))
                    .await
            }
            None => submit().await,
        }
    }

    /// Like [`call`](Self::call), but a transient or rate-limit failure on
    /// the primary model is retried once on the fallback model.
    ///
    /// `work` receives the model name for each attempt.
    pub async fn call_with_fallback<T, F, Fut>(
        &self,
        function_name: &str,
        models: ModelChain,
        options: RequestOptions,
        work: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let work = Arc::new(work);
        let priority = options.priority;
        let run = async move {
            let primary = self
                .scheduler
                .submit(bind_model(Arc::clone(&work), models.primary.clone()), priority)
                .await;
            match (primary, models.fallback.as_deref()) {
                (Err(e), Some(fallback)) if is_fallback_trigger(&e) => {
                    warn!(
                        function = function_name,
                        primary = %models.primary,
                        fallback,
                        error = %e,
                        "switching to fallback model"
                    );
                    self.scheduler
                        .submit(bind_model(Arc::clone(&work), fallback.to_string()), priority)
                        .await
                }
                (result, _) => result,
            }
        };

        match options.cache_key.as_deref() {
            Some(key) => {
                self.cache
                    .fetch(key, move || run, options.fetch_options(function_name))
                    .await
            }
            None => run.await,
        }
    }
}

fn bind_model<F, Fut, T>(work: Arc<F>, model: String) -> impl FnMut() -> Fut + Send + 'static
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    move || work(model.clone())
}

fn is_fallback_trigger(e: &TollgateError) -> bool {
    e.is_transient() || e.is_rate_limit()
}

/// Turn a non-success HTTP response into a classified error.
///
/// 429 becomes [`TollgateError::RateLimited`] carrying the `Retry-After`
/// seconds, 5xx is transient, anything else permanent. Success responses are
/// returned untouched.
pub async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let message = response.text().await.unwrap_or_default();
    Err(TollgateError::from_status(status.as_u16(), message, retry_after))
}
