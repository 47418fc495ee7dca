pub mod round_robin;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

pub use round_robin::RoundRobinRouter;

/// 路由器接口 - 负责从后端注册表中挑选下一个后端
#[async_trait]
pub trait Router: Send + Sync {
    /// 路由器名称
    fn name(&self) -> &str;

    /// 选择后端服务器，找不到健康后端时返回错误
    async fn select_backend(&self) -> Result<BackendEntry, RouterError>;

    /// 获取路由器统计信息
    async fn get_stats(&self) -> RouterStats;
}

/// 路由错误
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("No backends available after {attempts} attempts")]
    NoBackendAvailable { attempts: usize },
}

/// 后端地址解析错误
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AddrParseError {
    #[error("Backend address '{0}' is missing a port (expected host:port)")]
    MissingPort(String),

    #[error("Backend address '{0}' has an empty host")]
    EmptyHost(String),

    #[error("Backend address '{input}' has an invalid port '{port}'")]
    InvalidPort { input: String, port: String },
}

/// 后端地址 (host, port)，也是后端的唯一标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddr {
    pub host: String,
    pub port: u16,
}

impl BackendAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for BackendAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let (host, port) = input
            .rsplit_once(':')
            .ok_or_else(|| AddrParseError::MissingPort(input.to_string()))?;

        // [::1]:9000 形式的 IPv6 地址
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(AddrParseError::EmptyHost(input.to_string()));
        }

        let port = port.parse::<u16>().map_err(|_| AddrParseError::InvalidPort {
            input: input.to_string(),
            port: port.to_string(),
        })?;

        Ok(Self::new(host, port))
    }
}

/// 后端快照
#[derive(Debug, Clone, PartialEq)]
pub struct BackendEntry {
    pub index: usize,
    pub address: BackendAddr,
    pub healthy: bool,
}

impl BackendEntry {
    pub fn host(&self) -> &str {
        &self.address.host
    }

    pub fn port(&self) -> u16 {
        self.address.port
    }
}

/// 后端状态 (用于监控输出)
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub address: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub response_time_ms: Option<u64>,
    pub seconds_since_check: Option<u64>,
}

#[derive(Debug, Clone)]
struct BackendState {
    healthy: bool,
    consecutive_failures: u32,
    last_check: Option<Instant>,
    response_time: Option<Duration>,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            // 初始假设健康，等待第一次健康检查
            healthy: true,
            consecutive_failures: 0,
            last_check: None,
            response_time: None,
        }
    }
}

struct BackendSlot {
    address: BackendAddr,
    state: RwLock<BackendState>,
}

/// 后端注册表 - 启动时创建，运行期间只有健康标记会变化
pub struct BackendRegistry {
    slots: Vec<BackendSlot>,
}

impl BackendRegistry {
    pub fn new(addresses: Vec<BackendAddr>) -> Self {
        let slots = addresses
            .into_iter()
            .map(|address| BackendSlot {
                address,
                state: RwLock::new(BackendState::default()),
            })
            .collect();

        Self { slots }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn address(&self, index: usize) -> Option<&BackendAddr> {
        self.slots.get(index).map(|slot| &slot.address)
    }

    /// 读取指定后端的快照
    pub async fn get(&self, index: usize) -> Option<BackendEntry> {
        let slot = self.slots.get(index)?;
        let healthy = slot.state.read().await.healthy;

        Some(BackendEntry {
            index,
            address: slot.address.clone(),
            healthy,
        })
    }

    /// 设置健康标记，返回状态是否发生变化
    pub async fn set_healthy(&self, index: usize, healthy: bool) -> bool {
        let Some(slot) = self.slots.get(index) else {
            warn!("Ignoring health update for unknown backend index {}", index);
            return false;
        };

        let mut state = slot.state.write().await;
        let changed = state.healthy != healthy;
        state.healthy = healthy;
        changed
    }

    /// 记录一次健康检查结果，返回状态是否发生变化
    pub async fn record_check(
        &self,
        index: usize,
        healthy: bool,
        response_time: Option<Duration>,
    ) -> bool {
        let Some(slot) = self.slots.get(index) else {
            warn!("Ignoring health check result for unknown backend index {}", index);
            return false;
        };

        let mut state = slot.state.write().await;
        let changed = state.healthy != healthy;

        state.healthy = healthy;
        state.last_check = Some(Instant::now());
        if healthy {
            state.consecutive_failures = 0;
            state.response_time = response_time;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        }

        changed
    }

    pub async fn healthy_count(&self) -> usize {
        let mut count = 0;
        for slot in &self.slots {
            if slot.state.read().await.healthy {
                count += 1;
            }
        }
        count
    }

    pub async fn snapshot(&self) -> Vec<BackendEntry> {
        let mut entries = Vec::with_capacity(self.slots.len());
        for index in 0..self.slots.len() {
            if let Some(entry) = self.get(index).await {
                entries.push(entry);
            }
        }
        entries
    }

    pub async fn status(&self) -> Vec<BackendStatus> {
        let mut statuses = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let state = slot.state.read().await.clone();
            statuses.push(BackendStatus {
                address: slot.address.to_string(),
                healthy: state.healthy,
                consecutive_failures: state.consecutive_failures,
                response_time_ms: state.response_time.map(|d| d.as_millis() as u64),
                seconds_since_check: state.last_check.map(|t| t.elapsed().as_secs()),
            });
        }
        statuses
    }

    pub(crate) async fn last_checks(&self) -> Vec<(Option<Instant>, Option<Duration>)> {
        let mut checks = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let state = slot.state.read().await;
            checks.push((state.last_check, state.response_time));
        }
        checks
    }
}

/// 路由器统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub name: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub backend_count: u32,
    pub healthy_backend_count: u32,
}
