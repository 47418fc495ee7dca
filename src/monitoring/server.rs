use super::ProxyMetrics;
use crate::proxy::StatusReporter;
use crate::shutdown::ShutdownSignal;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use warp::Filter;

/// 启动监控端点：GET /metrics (Prometheus 文本格式) 和 GET /status (JSON)
///
/// 返回实际绑定的地址，收到关机信号后停止。
pub fn serve(
    bind: SocketAddr,
    metrics: Arc<ProxyMetrics>,
    status: StatusReporter,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> Result<SocketAddr> {
    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || metrics.export_metrics());

    let status_route = warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(move || {
            let status = status.clone();
            async move {
                let snapshot = status.snapshot().await;
                Ok::<_, warp::Rejection>(warp::reply::json(&snapshot))
            }
        });

    let routes = metrics_route.or(status_route);

    let (addr, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(bind, async move {
            let _ = shutdown_rx.recv().await;
        })
        .with_context(|| format!("Failed to bind monitoring endpoint to {}", bind))?;

    info!("Monitoring endpoint listening on http://{}", addr);

    tokio::spawn(async move {
        server.await;
        info!("Monitoring endpoint stopped");
    });

    Ok(addr)
}
