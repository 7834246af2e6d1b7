//! Proxy metrics.
//!
//! Fixed-cardinality counters registered at startup; incremented on the hot
//! path with relaxed atomics. Export is owned by an external collector.

use metriken::{Counter, Gauge, metric};

/// Client connections accepted.
#[metric(name = "connections_established_external")]
pub static CONNECTIONS_EXTERNAL: Counter = Counter::new();

/// Client connections currently open.
#[metric(name = "connections_active")]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

/// Connections opened to the L1 tier.
#[metric(name = "connections_established_l1")]
pub static CONNECTIONS_L1: Counter = Counter::new();

/// Connections opened to the L2 tier.
#[metric(name = "connections_established_l2")]
pub static CONNECTIONS_L2: Counter = Counter::new();

/// Bytes read from clients.
#[metric(name = "bytes_in")]
pub static BYTES_IN: Counter = Counter::new();

/// Bytes written to clients.
#[metric(name = "bytes_out")]
pub static BYTES_OUT: Counter = Counter::new();

/// Retrieval requests (get and batched get).
#[metric(name = "requests_get")]
pub static GET_REQUESTS: Counter = Counter::new();

/// Storage requests (set, add, replace).
#[metric(name = "requests_set")]
pub static SET_REQUESTS: Counter = Counter::new();

/// Delete requests.
#[metric(name = "requests_delete")]
pub static DELETE_REQUESTS: Counter = Counter::new();

/// Touch requests.
#[metric(name = "requests_touch")]
pub static TOUCH_REQUESTS: Counter = Counter::new();

/// Get-and-touch requests.
#[metric(name = "requests_gat")]
pub static GAT_REQUESTS: Counter = Counter::new();

/// Keys served from either tier.
#[metric(name = "hits")]
pub static HITS: Counter = Counter::new();

/// Keys not found in any tier, including token-mismatch misses.
#[metric(name = "misses")]
pub static MISSES: Counter = Counter::new();

/// Requests rejected as malformed.
#[metric(name = "parse_errors")]
pub static PARSE_ERRORS: Counter = Counter::new();

/// Backend failures surfaced to clients.
#[metric(name = "backend_errors")]
pub static BACKEND_ERRORS: Counter = Counter::new();

/// Metadata records that decoded but failed their own arithmetic.
#[metric(name = "invariant_violations")]
pub static INVARIANT_VIOLATIONS: Counter = Counter::new();
