use crate::config::HealthCheckConfig;
use crate::monitoring::ProxyMetrics;
use crate::router::{BackendAddr, BackendRegistry};
use crate::shutdown::ShutdownSignal;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

const PROBE_BUFFER_SIZE: usize = 1024;

/// 健康检查器 - 负责监控后端服务器的健康状态
///
/// 每个周期为每个后端启动一个独立任务，任务之间互不等待，
/// 慢速或不可达的后端不会拖慢其他后端的检查。
pub struct HealthChecker {
    config: HealthCheckConfig,
    registry: Arc<BackendRegistry>,
    metrics: Arc<ProxyMetrics>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        registry: Arc<BackendRegistry>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
        }
    }

    /// 启动健康检查循环，收到关机信号后退出
    pub fn start(&self, mut shutdown_rx: broadcast::Receiver<ShutdownSignal>) -> JoinHandle<()> {
        info!(
            "Starting health checker for {} backends with interval: {}s",
            self.registry.size(),
            self.config.interval_secs
        );

        let config = self.config.clone();
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let mut ticker = interval(config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::spawn_checks(&config, &registry, &metrics);
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Health checker received shutdown signal");
                        break;
                    }
                }
            }

            info!("Health checker stopped");
        })
    }

    /// 对单个后端执行一次检查，返回检查后的健康状态
    pub async fn check_backend(&self, index: usize) -> bool {
        Self::check_single_backend(&self.config, &self.registry, &self.metrics, index).await
    }

    fn spawn_checks(
        config: &HealthCheckConfig,
        registry: &Arc<BackendRegistry>,
        metrics: &Arc<ProxyMetrics>,
    ) {
        for index in 0..registry.size() {
            let config = config.clone();
            let registry = registry.clone();
            let metrics = metrics.clone();

            tokio::spawn(async move {
                Self::check_single_backend(&config, &registry, &metrics, index).await;
            });
        }
    }

    async fn check_single_backend(
        config: &HealthCheckConfig,
        registry: &BackendRegistry,
        metrics: &ProxyMetrics,
        index: usize,
    ) -> bool {
        let Some(address) = registry.address(index).cloned() else {
            warn!("Health check requested for unknown backend index {}", index);
            return false;
        };

        debug!("Performing health check on {}", address);

        let (healthy, response_time) = match Self::probe(&address, config).await {
            Ok(response_time) => {
                debug!(
                    "Health check succeeded for {} (response time: {:?})",
                    address, response_time
                );
                (true, Some(response_time))
            }
            Err(e) => {
                debug!("Health check failed for {}: {}", address, e);
                (false, None)
            }
        };

        let changed = registry.record_check(index, healthy, response_time).await;
        if changed {
            if healthy {
                info!("Backend '{}' marked as healthy", address);
            } else {
                warn!("Backend '{}' marked as unhealthy", address);
            }
        }

        metrics.record_health_check(&address.to_string(), healthy);
        healthy
    }

    /// 发送探测报文并等待非空响应；连接在返回时关闭
    async fn probe(address: &BackendAddr, config: &HealthCheckConfig) -> Result<Duration> {
        let start_time = Instant::now();
        let timeout_duration = config.timeout();

        let connect_future = TcpStream::connect((address.host.as_str(), address.port));
        let mut stream = match timeout(timeout_duration, connect_future).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(anyhow::anyhow!("Connection failed: {}", e)),
            Err(_) => {
                return Err(anyhow::anyhow!(
                    "Connection timeout after {:?}",
                    timeout_duration
                ))
            }
        };

        timeout(timeout_duration, stream.write_all(config.probe.as_bytes()))
            .await
            .map_err(|_| anyhow::anyhow!("Probe send timeout after {:?}", timeout_duration))??;

        let mut buffer = [0u8; PROBE_BUFFER_SIZE];
        let n = timeout(timeout_duration, stream.read(&mut buffer))
            .await
            .map_err(|_| anyhow::anyhow!("Probe read timeout after {:?}", timeout_duration))??;

        if n == 0 {
            return Err(anyhow::anyhow!("Backend closed without responding"));
        }

        Ok(start_time.elapsed())
    }

    /// 获取健康检查统计信息
    pub async fn get_stats(&self) -> HealthCheckStats {
        let total_backends = self.registry.size();
        let healthy_backends = self.registry.healthy_count().await;
        let checks = self.registry.last_checks().await;

        let avg_response_time = {
            let response_times: Vec<Duration> = checks.iter().filter_map(|(_, rt)| *rt).collect();

            if response_times.is_empty() {
                Duration::from_millis(0)
            } else {
                let total_ms: u64 = response_times.iter().map(|d| d.as_millis() as u64).sum();
                Duration::from_millis(total_ms / response_times.len() as u64)
            }
        };

        HealthCheckStats {
            total_backends,
            healthy_backends,
            unhealthy_backends: total_backends.saturating_sub(healthy_backends),
            avg_response_time_ms: avg_response_time.as_millis() as u64,
            seconds_since_last_check: checks
                .iter()
                .filter_map(|(last_check, _)| *last_check)
                .max()
                .map(|t| t.elapsed().as_secs()),
        }
    }
}

/// 健康检查统计信息
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckStats {
    pub total_backends: usize,
    pub healthy_backends: usize,
    pub unhealthy_backends: usize,
    pub avg_response_time_ms: u64,
    pub seconds_since_last_check: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::GracefulShutdown;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn fast_config() -> HealthCheckConfig {
        HealthCheckConfig {
            interval_secs: 1,
            timeout_ms: 200,
            ..Default::default()
        }
    }

    fn checker_for(addrs: Vec<SocketAddr>) -> HealthChecker {
        let registry = BackendRegistry::new(
            addrs
                .into_iter()
                .map(|a| BackendAddr::new(a.ip().to_string(), a.port()))
                .collect(),
        );
        HealthChecker::new(
            fast_config(),
            Arc::new(registry),
            Arc::new(ProxyMetrics::new().unwrap()),
        )
    }

    /// 回应探测报文的后端
    async fn responding_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if let Ok(n) = stream.read(&mut buf).await {
                        if n > 0 {
                            let _ = stream.write_all(b"OK").await;
                        }
                    }
                });
            }
        });
        addr
    }

    /// 接受连接但从不回应的后端
    async fn silent_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    /// 接受连接后立即关闭的后端
    async fn closing_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        addr
    }

    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_responding_backend_marked_healthy() {
        let checker = checker_for(vec![responding_backend().await]);
        checker.registry.set_healthy(0, false).await;

        assert!(checker.check_backend(0).await);
        assert!(checker.registry.get(0).await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_refused_backend_marked_unhealthy() {
        let checker = checker_for(vec![refused_addr().await]);

        assert!(!checker.check_backend(0).await);
        assert!(!checker.registry.get(0).await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let checker = checker_for(vec![silent_backend().await]);

        let start = Instant::now();
        assert!(!checker.check_backend(0).await);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!checker.registry.get(0).await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_empty_response_marked_unhealthy() {
        let checker = checker_for(vec![closing_backend().await]);

        assert!(!checker.check_backend(0).await);
        assert!(!checker.registry.get(0).await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_stable_backend_stays_healthy() {
        let checker = checker_for(vec![responding_backend().await]);

        for _ in 0..20 {
            assert!(checker.check_backend(0).await);
            assert!(checker.registry.get(0).await.unwrap().healthy);
        }

        let stats = checker.get_stats().await;
        assert_eq!(stats.healthy_backends, 1);
        assert_eq!(stats.unhealthy_backends, 0);
        assert_eq!(stats.seconds_since_last_check, Some(0));
    }

    #[tokio::test]
    async fn test_unknown_index_is_ignored() {
        let checker = checker_for(vec![responding_backend().await]);
        assert!(!checker.check_backend(7).await);
        assert!(checker.registry.get(0).await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_slow_backend_does_not_delay_others() {
        let checker = checker_for(vec![
            silent_backend().await,
            refused_addr().await,
            responding_backend().await,
        ]);
        checker.registry.set_healthy(2, false).await;

        let shutdown = GracefulShutdown::new();
        let handle = checker.start(shutdown.subscribe());

        // 第一次 tick 立即触发；静默后端需要等待超时，其余后端应先完成
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!checker.registry.get(1).await.unwrap().healthy);
        assert!(checker.registry.get(2).await.unwrap().healthy);

        shutdown.trigger_shutdown(ShutdownSignal::Internal).await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
