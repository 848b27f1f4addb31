//! Observability infrastructure.
//!
//! Provides:
//! - Structured logging through `tracing`
//! - OTLP metrics for batch commits, aborts, and write latency

pub mod metrics;
pub mod tracing;
