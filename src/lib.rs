//! A Prometheus exporter for Twitch channel metrics

pub mod app;
pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod eventsub;
pub mod exporter;
pub mod exposition;
pub mod helix;
pub mod server;
pub mod util;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::app::App;
    pub use crate::cache::{LookupCache, build_key};
    pub use crate::collector::{Collector, CollectorDeps, CollectorRegistry, MetricSink, Sample};
    pub use crate::config::{ConfigOverrides, ExporterConfig, SafeConfig};
    pub use crate::error::{ExporterError, Result};
    pub use crate::eventsub::{EventSubManager, SubscribeOutcome};
    pub use crate::exporter::{Exporter, ExporterHandle, Outcome};
    pub use crate::helix::{HelixApi, HelixClient};
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
