//! Metrics module for Prometheus-based monitoring.
//!
//! Covers phase transitions, replenishment batches and deficits, job and
//! shot outcomes, drift, loop tick durations and scorer requests.
//!
//! # Example
//!
//! ```ignore
//! use reelforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.record_job_outcome("image", "completed");
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
