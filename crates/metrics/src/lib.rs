//! Metrics and tracing for the paid-feature execution ledger
//!
//! This crate provides Prometheus counters for execution outcomes, wallet
//! activity and compensation, plus tracing setup with correlation IDs.
//!
//! # Example
//!
//! ```no_run
//! use feature_ledger_metrics::{init_tracing, MetricsCollector};
//! use std::sync::Arc;
//!
//! let collector = Arc::new(MetricsCollector::new().unwrap());
//! init_tracing(collector.clone()).unwrap();
//!
//! println!("{}", collector.gather_text().unwrap());
//! ```

pub mod collector;
pub mod tracing;

pub use collector::{ExecutionOutcome, MetricsCollector, MetricsError};
pub use self::tracing::{
    init_tracing, init_tracing_with_filter, CorrelationId, ExecutionSpan, MetricsLayer,
    TracingError, DEFAULT_LOG_FILTER,
};
