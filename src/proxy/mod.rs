pub mod connections;
pub mod session;
pub mod tcp;

use crate::config::Settings;
use crate::health::{HealthCheckStats, HealthChecker};
use crate::monitoring::{self, ProxyMetrics};
use crate::router::{BackendRegistry, BackendStatus, RoundRobinRouter, Router, RouterError, RouterStats};
use crate::shutdown::{GracefulShutdown, ShutdownSignal};
use anyhow::{Context, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub use connections::{ActiveConnections, ConnectionInfo};
pub use session::SessionEnd;
pub use tcp::TcpProxy;

/// 负载均衡服务器 - 管理注册表、健康检查、监听器和关机流程
pub struct ProxyServer {
    settings: Settings,
    registry: Arc<BackendRegistry>,
    router: Arc<dyn Router>,
    health_checker: Arc<HealthChecker>,
    metrics: Arc<ProxyMetrics>,
    connections: Arc<ActiveConnections>,
    shutdown: Arc<GracefulShutdown>,
    tcp_proxy: TcpProxy,
    start_time: Instant,
}

impl ProxyServer {
    /// 校验配置、构建各组件并绑定监听地址
    pub async fn bind(settings: Settings) -> Result<Self> {
        settings.validate().context("Invalid configuration")?;

        let registry = Arc::new(BackendRegistry::new(settings.backend_addrs()?));
        let metrics = Arc::new(ProxyMetrics::new().context("Failed to create metrics registry")?);
        let router: Arc<dyn Router> = Arc::new(RoundRobinRouter::new(registry.clone()));
        let health_checker = Arc::new(HealthChecker::new(
            settings.health_check.clone(),
            registry.clone(),
            metrics.clone(),
        ));
        let connections = Arc::new(ActiveConnections::new());

        let tcp_proxy = TcpProxy::bind(
            settings.server.clone(),
            router.clone(),
            metrics.clone(),
            connections.clone(),
        )
        .await
        .context("Failed to start TCP listener")?;

        for (index, backend) in registry.snapshot().await.iter().enumerate() {
            info!("  Backend #{}: {}", index, backend.address);
        }

        Ok(Self {
            settings,
            registry,
            router,
            health_checker,
            metrics,
            connections,
            shutdown: Arc::new(GracefulShutdown::new()),
            tcp_proxy,
            start_time: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.tcp_proxy
            .local_addr()
            .context("Failed to read listener address")
    }

    pub fn shutdown_handle(&self) -> Arc<GracefulShutdown> {
        self.shutdown.clone()
    }

    pub fn connections(&self) -> Arc<ActiveConnections> {
        self.connections.clone()
    }

    pub fn registry(&self) -> Arc<BackendRegistry> {
        self.registry.clone()
    }

    pub fn health_checker(&self) -> Arc<HealthChecker> {
        self.health_checker.clone()
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        self.metrics.clone()
    }

    pub fn status_reporter(&self) -> StatusReporter {
        StatusReporter {
            registry: self.registry.clone(),
            router: self.router.clone(),
            health_checker: self.health_checker.clone(),
            connections: self.connections.clone(),
            start_time: self.start_time,
        }
    }

    /// 运行直到收到关机信号或监听循环出现致命错误
    pub async fn run(self) -> Result<()> {
        let status = self.status_reporter();
        let Self {
            settings,
            health_checker,
            metrics,
            shutdown,
            tcp_proxy,
            ..
        } = self;

        // 先订阅再检查状态，避免错过在此之前触发的关机
        let listener_rx = shutdown.subscribe();
        let health_rx = shutdown.subscribe();
        let monitor_rx = shutdown.subscribe();

        if shutdown.is_shutting_down().await {
            warn!("Shutdown requested before the balancer started");
            drop(tcp_proxy);
            shutdown.mark_complete().await;
            return Ok(());
        }

        shutdown
            .start_signal_handling()
            .context("Failed to register signal handlers")?;

        if settings.monitoring.enable_metrics {
            let bind = settings.metrics_bind()?;
            if let Err(e) = monitoring::server::serve(bind, metrics.clone(), status, monitor_rx) {
                drop(tcp_proxy);
                shutdown.trigger_shutdown(ShutdownSignal::Internal).await;
                shutdown.mark_complete().await;
                return Err(e.context("Failed to start monitoring endpoint"));
            }
        }

        let health_handle = health_checker.start(health_rx);

        let result = tcp_proxy.run(listener_rx).await;
        if let Err(e) = &result {
            error!("Balancer error: {}", e);
            shutdown.trigger_shutdown(ShutdownSignal::Internal).await;
        }

        if tokio::time::timeout(Duration::from_secs(5), health_handle)
            .await
            .is_err()
        {
            warn!("Health checker did not stop in time");
        }

        shutdown.mark_complete().await;
        info!("Balancer shutdown complete");

        result.context("TCP listener failed")
    }
}

/// 状态快照的来源，可在服务器运行期间共享给监控端点
#[derive(Clone)]
pub struct StatusReporter {
    registry: Arc<BackendRegistry>,
    router: Arc<dyn Router>,
    health_checker: Arc<HealthChecker>,
    connections: Arc<ActiveConnections>,
    start_time: Instant,
}

impl StatusReporter {
    pub async fn snapshot(&self) -> ProxyServerStatus {
        ProxyServerStatus {
            uptime_secs: self.start_time.elapsed().as_secs(),
            active_connections: self.connections.len().await,
            backends: self.registry.status().await,
            health: self.health_checker.get_stats().await,
            router: self.router.get_stats().await,
        }
    }
}

/// 负载均衡器状态
#[derive(Debug, Clone, Serialize)]
pub struct ProxyServerStatus {
    pub uptime_secs: u64,
    pub active_connections: usize,
    pub backends: Vec<BackendStatus>,
    pub health: HealthCheckStats,
    pub router: RouterStats,
}

/// 代理错误类型
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Routing(#[from] RouterError),

    #[error("Backend connection to {address} failed: {source}")]
    BackendConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Backend connection to {address} timed out after {timeout:?}")]
    BackendTimeout { address: String, timeout: Duration },

    #[error("Backend {address} I/O error: {source}")]
    BackendIo {
        address: String,
        source: std::io::Error,
    },

    #[error("Client I/O error: {0}")]
    ClientIo(std::io::Error),

    #[error("Failed to bind listener to {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(std::io::Error),
}

/// 代理结果
pub type ProxyResult<T> = Result<T, ProxyError>;
