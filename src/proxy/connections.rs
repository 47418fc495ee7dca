use crate::router::BackendAddr;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::{oneshot, RwLock};
use tracing::debug;

/// 连接信息
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub client_addr: SocketAddr,
    pub start_time: Instant,
    pub requests: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_backend: Option<BackendAddr>,
}

impl ConnectionInfo {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client_addr,
            start_time: Instant::now(),
            requests: 0,
            bytes_sent: 0,
            bytes_received: 0,
            last_backend: None,
        }
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

struct TrackedConnection {
    info: ConnectionInfo,
    closer: oneshot::Sender<()>,
}

/// 活跃连接集合
///
/// 接受连接时登记，会话结束时移除；关机时通过 `close_all` 通知每个会话丢弃其套接字。
#[derive(Default)]
pub struct ActiveConnections {
    connections: RwLock<HashMap<String, TrackedConnection>>,
}

impl ActiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记连接，返回的接收器在连接被强制关闭时完成
    pub async fn register(&self, info: ConnectionInfo) -> oneshot::Receiver<()> {
        let (closer, close_rx) = oneshot::channel();
        let mut connections = self.connections.write().await;
        debug!("Tracking connection {} from {}", info.id, info.client_addr);
        connections.insert(info.id.clone(), TrackedConnection { info, closer });
        close_rx
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.connections.write().await.remove(id).is_some()
    }

    /// 关闭所有已登记的连接，返回关闭数量
    pub async fn close_all(&self) -> usize {
        let drained: Vec<TrackedConnection> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, tracked)| tracked).collect()
        };

        let count = drained.len();
        for tracked in drained {
            debug!(
                "Force closing connection {} from {}",
                tracked.info.id, tracked.info.client_addr
            );
            // 会话可能已经结束，接收端被丢弃时忽略
            let _ = tracked.closer.send(());
        }

        count
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .await
            .values()
            .map(|tracked| tracked.info.clone())
            .collect()
    }
}
