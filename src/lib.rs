//! Tollgate - rate-limited scheduling and tiered caching for LLM API calls
//!
//! A free-tier completion API allows a handful of requests per minute. This
//! crate keeps an application inside that budget without failing requests:
//!
//! - [`RequestScheduler`] queues outbound calls by [`Priority`], dispatches
//!   them through a token bucket, retries transient failures with backoff and
//!   pauses everything when the provider answers with a rate limit.
//! - [`TieredCache`] memoizes results in a bounded memory tier over a
//!   byte-bounded durable tier, with TTL expiry and tag invalidation.
//! - [`Gateway`] and [`BatchProcessor`] combine both at the call site.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tollgate::{Config, Priority, RequestOptions, Services};
//!
//! #[tokio::main]
//! async fn main() -> tollgate::Result<()> {
//!     let services = Services::new(Config::load(None)?);
//!     let gateway = services.gateway("gemini")?;
//!
//!     let summary: String = gateway
//!         .call(
//!             "summarizeCompany",
//!             RequestOptions::new()
//!                 .priority(Priority::High)
//!                 .cache_key("summary_acme")
//!                 .ttl(Duration::from_secs(7 * 24 * 3600)),
//!             || async { Ok("Acme grows soybeans".to_string()) },
//!         )
//!         .await?;
//!
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod scheduler;
pub mod services;
pub mod telemetry;
pub mod version;

// Re-export main types at crate root
pub use batch::{BatchConfig, BatchProcessor};
pub use cache::{
    CacheEntry, CacheMetrics, DurableStore, FetchOptions, FileStore, MemoryStore, TieredCache,
    sanitize_key,
};
pub use config::{CacheConfig, Config, SchedulerConfig};
pub use error::{FailureClass, Result, TollgateError};
pub use gateway::{Gateway, ModelChain, RequestOptions, check_response};
pub use scheduler::{Priority, RequestScheduler, SchedulerMetrics, Ticket};
pub use services::Services;
