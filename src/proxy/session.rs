use super::connections::ConnectionInfo;
use super::{ProxyError, ProxyResult};
use crate::config::ServerConfig;
use crate::monitoring::ProxyMetrics;
use crate::router::{BackendAddr, Router};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// 会话正常结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// 客户端关闭连接
    ClientClosed,
    /// 后端未响应就关闭了连接
    BackendClosed,
    /// 关机时被强制关闭
    ForceClosed,
}

/// 服务一个客户端连接：读取 → 选择后端 → 转发 → 回写，直到任一方关闭
///
/// 每个请求都新建一条后端连接，回写完成后即释放。
pub async fn run_session(
    client: &mut TcpStream,
    router: &dyn Router,
    metrics: &ProxyMetrics,
    config: &ServerConfig,
    info: &mut ConnectionInfo,
) -> ProxyResult<SessionEnd> {
    let mut request = vec![0u8; config.buffer_size];
    let mut response = vec![0u8; config.buffer_size];

    loop {
        let n = client.read(&mut request).await.map_err(ProxyError::ClientIo)?;
        if n == 0 {
            return Ok(SessionEnd::ClientClosed);
        }

        metrics.routing_decisions_total.inc();
        let backend = router
            .select_backend()
            .await
            .inspect_err(|_| metrics.no_backend_total.inc())?;

        let started = Instant::now();
        let m = forward(
            &backend.address,
            &request[..n],
            &mut response,
            config.connect_timeout(),
        )
        .await?;
        metrics
            .backend_response_time
            .observe(started.elapsed().as_secs_f64());

        if m == 0 {
            debug!(
                "Backend {} closed without responding to {}",
                backend.address, info.id
            );
            return Ok(SessionEnd::BackendClosed);
        }

        client
            .write_all(&response[..m])
            .await
            .map_err(ProxyError::ClientIo)?;

        info.requests += 1;
        info.bytes_sent += n as u64;
        info.bytes_received += m as u64;
        info.last_backend = Some(backend.address);

        metrics.requests_total.inc();
        metrics.bytes_transferred_total.inc_by((n + m) as f64);
    }
}

/// 一次后端往返，后端连接在返回时关闭
async fn forward(
    address: &BackendAddr,
    request: &[u8],
    response: &mut [u8],
    connect_timeout: Duration,
) -> ProxyResult<usize> {
    let connect_future = TcpStream::connect((address.host.as_str(), address.port));
    let mut backend = match timeout(connect_timeout, connect_future).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(ProxyError::BackendConnectionFailed {
                address: address.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(ProxyError::BackendTimeout {
                address: address.to_string(),
                timeout: connect_timeout,
            })
        }
    };

    debug!("Connected to backend {}", address);

    let backend_io = |source| ProxyError::BackendIo {
        address: address.to_string(),
        source,
    };

    backend.write_all(request).await.map_err(backend_io)?;
    let m = backend.read(response).await.map_err(backend_io)?;

    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{BackendRegistry, RoundRobinRouter, RouterError};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// 回显后端，响应前加上名称前缀
    async fn echo_backend(name: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if let Ok(n) = stream.read(&mut buf).await {
                        let mut reply = format!("{}:", name).into_bytes();
                        reply.extend_from_slice(&buf[..n]);
                        let _ = stream.write_all(&reply).await;
                    }
                });
            }
        });
        addr
    }

    async fn closing_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
            }
        });
        addr
    }

    fn router_for(addrs: &[SocketAddr]) -> RoundRobinRouter {
        let registry = BackendRegistry::new(
            addrs
                .iter()
                .map(|a| BackendAddr::new(a.ip().to_string(), a.port()))
                .collect(),
        );
        RoundRobinRouter::new(Arc::new(registry))
    }

    /// 返回 (客户端, 代理侧) 两端
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn spawn_session(
        router: RoundRobinRouter,
    ) -> (
        TcpStream,
        tokio::task::JoinHandle<(ProxyResult<SessionEnd>, ConnectionInfo)>,
    ) {
        let (client, mut server) = socket_pair().await;
        let handle = tokio::spawn(async move {
            let metrics = ProxyMetrics::new().unwrap();
            let mut info = ConnectionInfo::new(server.peer_addr().unwrap());
            let result = run_session(
                &mut server,
                &router,
                &metrics,
                &ServerConfig::default(),
                &mut info,
            )
            .await;
            (result, info)
        });
        (client, handle)
    }

    async fn round_trip(client: &mut TcpStream, payload: &[u8]) -> String {
        client.write_all(payload).await.unwrap();
        let mut buf = [0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn test_relays_requests_in_rotation() {
        let b0 = echo_backend("b0").await;
        let b1 = echo_backend("b1").await;
        let (mut client, handle) = spawn_session(router_for(&[b0, b1])).await;

        assert_eq!(round_trip(&mut client, b"one").await, "b0:one");
        assert_eq!(round_trip(&mut client, b"two").await, "b1:two");
        assert_eq!(round_trip(&mut client, b"three").await, "b0:three");

        drop(client);
        let (result, info) = handle.await.unwrap();
        assert_eq!(result.unwrap(), SessionEnd::ClientClosed);
        assert_eq!(info.requests, 3);
        assert_eq!(info.bytes_sent, 11);
        assert_eq!(info.last_backend.unwrap().port, b0.port());
    }

    #[tokio::test]
    async fn test_no_backend_terminates_session() {
        let b0 = echo_backend("b0").await;
        let router = router_for(&[b0]);
        router.registry().set_healthy(0, false).await;
        let (mut client, handle) = spawn_session(router).await;

        client.write_all(b"hello").await.unwrap();
        let (result, _) = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(ProxyError::Routing(RouterError::NoBackendAvailable { attempts: 1 }))
        ));

        // 客户端看到的是关闭的连接
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_backend_closing_ends_session() {
        let (mut client, handle) = spawn_session(router_for(&[closing_backend().await])).await;

        client.write_all(b"hello").await.unwrap();
        let (result, info) = handle.await.unwrap();
        assert_eq!(result.unwrap(), SessionEnd::BackendClosed);
        assert_eq!(info.requests, 0);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_session_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut client, handle) = spawn_session(router_for(&[addr])).await;
        client.write_all(b"hello").await.unwrap();

        let (result, _) = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(ProxyError::BackendConnectionFailed { .. })
        ));
    }
}
