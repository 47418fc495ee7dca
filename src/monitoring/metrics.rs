use anyhow::Result;
use prometheus::{
    Counter, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct ProxyMetrics {
    pub registry: Arc<Registry>,

    // 连接指标
    pub tcp_connections_total: IntCounter,
    pub active_connections: IntGauge,
    pub forced_closes_total: IntCounter,

    // 流量指标
    pub bytes_transferred_total: Counter,
    pub requests_total: IntCounter,
    pub errors_total: IntCounter,

    // 延迟指标
    pub session_duration: Histogram,
    pub backend_response_time: Histogram,

    // 路由指标
    pub routing_decisions_total: IntCounter,
    pub no_backend_total: IntCounter,

    // 健康检查指标
    pub health_checks_total: IntCounterVec,
    pub backend_health: IntGaugeVec,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let tcp_connections_total = IntCounter::with_opts(Opts::new(
            "balancer_tcp_connections_total",
            "Total number of client connections accepted",
        ))?;

        let active_connections = IntGauge::with_opts(Opts::new(
            "balancer_active_connections",
            "Current number of active client connections",
        ))?;

        let forced_closes_total = IntCounter::with_opts(Opts::new(
            "balancer_forced_closes_total",
            "Total number of client connections closed by shutdown",
        ))?;

        let bytes_transferred_total = Counter::with_opts(Opts::new(
            "balancer_bytes_transferred_total",
            "Total bytes relayed in both directions",
        ))?;

        let requests_total = IntCounter::with_opts(Opts::new(
            "balancer_requests_total",
            "Total number of requests forwarded to a backend",
        ))?;

        let errors_total = IntCounter::with_opts(Opts::new(
            "balancer_errors_total",
            "Total number of client sessions that ended with an error",
        ))?;

        let session_duration = Histogram::with_opts(HistogramOpts::new(
            "balancer_session_duration_seconds",
            "Client session duration in seconds",
        ))?;

        let backend_response_time = Histogram::with_opts(HistogramOpts::new(
            "balancer_backend_response_time_seconds",
            "Backend round-trip time in seconds",
        ))?;

        let routing_decisions_total = IntCounter::with_opts(Opts::new(
            "balancer_routing_decisions_total",
            "Total number of backend selections made",
        ))?;

        let no_backend_total = IntCounter::with_opts(Opts::new(
            "balancer_no_backend_total",
            "Total number of selections that found no healthy backend",
        ))?;

        let health_checks_total = IntCounterVec::new(
            Opts::new(
                "balancer_health_checks_total",
                "Total number of health check probes",
            ),
            &["backend", "result"],
        )?;

        let backend_health = IntGaugeVec::new(
            Opts::new(
                "balancer_backend_healthy",
                "Backend health state (1 = healthy, 0 = unhealthy)",
            ),
            &["backend"],
        )?;

        // 注册所有指标
        registry.register(Box::new(tcp_connections_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(forced_closes_total.clone()))?;
        registry.register(Box::new(bytes_transferred_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(session_duration.clone()))?;
        registry.register(Box::new(backend_response_time.clone()))?;
        registry.register(Box::new(routing_decisions_total.clone()))?;
        registry.register(Box::new(no_backend_total.clone()))?;
        registry.register(Box::new(health_checks_total.clone()))?;
        registry.register(Box::new(backend_health.clone()))?;

        Ok(Self {
            registry,
            tcp_connections_total,
            active_connections,
            forced_closes_total,
            bytes_transferred_total,
            requests_total,
            errors_total,
            session_duration,
            backend_response_time,
            routing_decisions_total,
            no_backend_total,
            health_checks_total,
            backend_health,
        })
    }

    pub fn record_health_check(&self, backend: &str, healthy: bool) {
        let result = if healthy { "healthy" } else { "unhealthy" };
        self.health_checks_total
            .with_label_values(&[backend, result])
            .inc();
        self.backend_health
            .with_label_values(&[backend])
            .set(i64::from(healthy));
    }

    pub fn export_metrics(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families).unwrap_or_default()
    }
}
