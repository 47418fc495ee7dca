use super::{BackendEntry, BackendRegistry, Router, RouterError, RouterStats};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// 轮询路由器 - 按注册顺序轮流选择后端服务器，跳过不健康的后端
///
/// 游标在整次扫描期间持有锁，每次选择最多检查 `registry.size()` 个后端。
pub struct RoundRobinRouter {
    name: String,
    registry: Arc<BackendRegistry>,
    cursor: Mutex<usize>,
    stats: RwLock<RouterStats>,
}

impl RoundRobinRouter {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        let backend_count = registry.size() as u32;

        Self {
            name: "round_robin".to_string(),
            registry,
            cursor: Mutex::new(0),
            stats: RwLock::new(RouterStats {
                name: "round_robin".to_string(),
                backend_count,
                ..Default::default()
            }),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    async fn scan(&self) -> Result<BackendEntry, RouterError> {
        let size = self.registry.size();
        let mut cursor = self.cursor.lock().await;

        for _ in 0..size {
            if *cursor >= size {
                *cursor = 0;
            }

            let index = *cursor;
            *cursor += 1;

            match self.registry.get(index).await {
                Some(entry) if entry.healthy => {
                    debug!(
                        "RoundRobinRouter selected backend: {} (index: {})",
                        entry.address, index
                    );
                    return Ok(entry);
                }
                _ => debug!("RoundRobinRouter skipping unhealthy backend index {}", index),
            }
        }

        Err(RouterError::NoBackendAvailable { attempts: size })
    }
}

#[async_trait]
impl Router for RoundRobinRouter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn select_backend(&self) -> Result<BackendEntry, RouterError> {
        let result = self.scan().await;

        let mut stats = self.stats.write().await;
        stats.total_requests += 1;
        match &result {
            Ok(_) => stats.successful_requests += 1,
            Err(e) => {
                stats.failed_requests += 1;
                warn!("RoundRobinRouter: {}", e);
            }
        }

        result
    }

    async fn get_stats(&self) -> RouterStats {
        let mut stats = self.stats.read().await.clone();
        stats.healthy_backend_count = self.registry.healthy_count().await as u32;
        stats
    }
}
