//! Logging and metrics plumbing shared by the SDK.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{Counter, Histogram, MetricsRegistry};
