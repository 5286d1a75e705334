//! Telemetry metric name constants.
//!
//! Centralised metric names for tollgate operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `tollgate_`. Counters end in `_total`.
//!
//! # Common labels
//!
//! - `priority` — queue tier: "high", "medium" or "low"
//! - `cache` — logical cache name (e.g. "gemini", "batch")
//! - `tier` — cache tier a hit was served from: "memory" or "disk"

/// Total work items submitted to the scheduler.
///
/// Labels: `priority`.
pub const SUBMITTED_TOTAL: &str = "tollgate_submitted_total";

/// Total dispatch attempts (each consumes one token).
///
/// Labels: `priority`.
pub const DISPATCHED_TOTAL: &str = "tollgate_dispatched_total";

/// Items settled successfully.
pub const PROCESSED_TOTAL: &str = "tollgate_processed_total";

/// Items settled with a terminal error.
pub const FAILED_TOTAL: &str = "tollgate_failed_total";

/// Retry attempts after transient errors (not counting the initial attempt).
pub const RETRIES_TOTAL: &str = "tollgate_retries_total";

/// Circuit breaker trips caused by rate-limit responses.
pub const CIRCUIT_TRIPS_TOTAL: &str = "tollgate_circuit_trips_total";

/// Items waiting in the scheduler queues.
///
/// Labels: `priority`.
pub const PENDING: &str = "tollgate_pending";

/// Total cache hits.
///
/// Labels: `cache`, `tier`.
pub const CACHE_HITS_TOTAL: &str = "tollgate_cache_hits_total";

/// Total cache misses.
///
/// Labels: `cache`.
pub const CACHE_MISSES_TOTAL: &str = "tollgate_cache_misses_total";

/// Fast-tier LRU evictions.
///
/// Labels: `cache`.
pub const CACHE_EVICTIONS_TOTAL: &str = "tollgate_cache_evictions_total";

/// Durable-tier writes that failed and triggered a prune.
///
/// Labels: `cache`.
pub const CACHE_WRITE_FAILURES_TOTAL: &str = "tollgate_cache_write_failures_total";
