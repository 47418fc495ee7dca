pub mod logger;
pub mod metrics;
pub mod server;

pub use logger::setup_logging;
pub use metrics::ProxyMetrics;
