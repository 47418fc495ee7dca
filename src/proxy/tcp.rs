use super::connections::{ActiveConnections, ConnectionInfo};
use super::session::{self, SessionEnd};
use super::{ProxyError, ProxyResult};
use crate::config::ServerConfig;
use crate::monitoring::ProxyMetrics;
use crate::router::Router;
use crate::shutdown::ShutdownSignal;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

/// TCP 负载均衡监听器
pub struct TcpProxy {
    config: ServerConfig,
    listener: TcpListener,
    router: Arc<dyn Router>,
    metrics: Arc<ProxyMetrics>,
    connections: Arc<ActiveConnections>,
}

impl TcpProxy {
    pub async fn bind(
        config: ServerConfig,
        router: Arc<dyn Router>,
        metrics: Arc<ProxyMetrics>,
        connections: Arc<ActiveConnections>,
    ) -> ProxyResult<Self> {
        let bind_address = config.bind_address();
        let listener = TcpListener::bind(&bind_address)
            .await
            .map_err(|source| ProxyError::Bind {
                address: bind_address.clone(),
                source,
            })?;

        match listener.local_addr() {
            Ok(addr) => info!("TCP balancer listening on {}", addr),
            Err(_) => info!("TCP balancer listening on {}", bind_address),
        }

        Ok(Self {
            config,
            listener,
            router,
            metrics,
            connections,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 接受连接直到收到关机信号或出现致命错误，然后关闭所有连接和监听套接字
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<ShutdownSignal>) -> ProxyResult<()> {
        let result = loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            info!("Client {} has connected", client_addr);
                            self.spawn_session(stream, client_addr).await;
                        }
                        Err(e) if is_transient_accept_error(&e) => {
                            warn!("Failed to accept TCP connection: {}", e);
                            // 短暂延迟以避免忙循环
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                        Err(e) => {
                            error!("Fatal error in accept loop: {}", e);
                            break Err(ProxyError::Accept(e));
                        }
                    }
                }
                signal = shutdown_rx.recv() => {
                    match signal {
                        Ok(signal) => info!("TCP balancer received shutdown signal: {}", signal),
                        Err(e) => warn!("Shutdown channel error, stopping: {}", e),
                    }
                    break Ok(());
                }
            }
        };

        self.cleanup().await;
        result
    }

    async fn spawn_session(&self, stream: TcpStream, client_addr: SocketAddr) {
        let info = ConnectionInfo::new(client_addr);
        let close_rx = self.connections.register(info.clone()).await;

        self.metrics.tcp_connections_total.inc();
        self.metrics.active_connections.inc();

        let router = self.router.clone();
        let metrics = self.metrics.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            Self::handle_connection(stream, info, close_rx, router, metrics, connections, config)
                .await;
        });
    }

    /// 处理单个连接，任何错误只影响本会话
    async fn handle_connection(
        mut stream: TcpStream,
        mut info: ConnectionInfo,
        close_rx: oneshot::Receiver<()>,
        router: Arc<dyn Router>,
        metrics: Arc<ProxyMetrics>,
        connections: Arc<ActiveConnections>,
        config: ServerConfig,
    ) {
        let result = tokio::select! {
            result = session::run_session(&mut stream, router.as_ref(), &metrics, &config, &mut info) => result,
            _ = close_rx => Ok(SessionEnd::ForceClosed),
        };

        // 释放客户端套接字
        drop(stream);

        match &result {
            Ok(SessionEnd::ForceClosed) => {
                metrics.forced_closes_total.inc();
                info!("Connection {} from {} force closed", info.id, info.client_addr);
            }
            Ok(end) => {
                debug!(
                    "Session {} ended ({:?}) after {} requests, {} bytes",
                    info.id,
                    end,
                    info.requests,
                    info.total_bytes()
                );
            }
            Err(e) => {
                metrics.errors_total.inc();
                error!("Error handling client {}: {}", info.client_addr, e);
            }
        }

        connections.remove(&info.id).await;
        metrics.active_connections.dec();
        metrics
            .session_duration
            .observe(info.duration().as_secs_f64());

        info!("Connection closed from {}", info.client_addr);
    }

    async fn cleanup(self) {
        let closed = self.connections.close_all().await;
        info!("Closed {} active connections", closed);

        drop(self.listener);
        info!("Listening socket closed");
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || is_fd_exhaustion(e)
}

/// EMFILE / ENFILE：文件描述符耗尽，等待已有连接释放
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(23) | Some(24))
}
