//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! protocol / blockchain / exec produce:
//!     → logging.rs (structured tracing events, stderr)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → Terminal or log aggregation
//!     → Metrics endpoint (Prometheus scrape), when enabled
//! ```
//!
//! # Design Decisions
//! - Message id, client id, nonce travel as structured fields
//! - Private keys are never logged; chunk payloads are logged by size only

pub mod logging;
pub mod metrics;
