pub mod config;
pub mod health;
pub mod monitoring;
pub mod proxy;
pub mod router;
pub mod shutdown;

pub use config::Settings;
pub use health::HealthChecker;
pub use monitoring::ProxyMetrics;
pub use proxy::{ProxyServer, TcpProxy};
pub use router::{BackendRegistry, RoundRobinRouter, Router};
pub use shutdown::GracefulShutdown;
