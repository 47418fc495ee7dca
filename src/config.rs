use crate::router::BackendAddr;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_PROBE: &str = "GET /health-check HTTP/1.1\r\n\r\n";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 后端列表，格式为 host:port
    pub backends: Vec<String>,
    pub server: ServerConfig,
    pub health_check: HealthCheckConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    pub timeout_ms: u64,
    pub probe: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub enable_metrics: bool,
    pub metrics_bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            buffer_size: 1024,
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_ms: 2000,
            probe: DEFAULT_PROBE.to_string(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_metrics: false,
            metrics_bind: "127.0.0.1:9090".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Settings {
    pub async fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();

        if config_path.exists() {
            let content = tokio::fs::read_to_string(config_path)
                .await
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
            let settings: Settings = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;
            info!("Configuration loaded from {:?}", config_path);
            Ok(settings)
        } else {
            info!("Config file {:?} not found, using defaults", config_path);
            Ok(Settings::default())
        }
    }

    pub async fn save_to_path<P: AsRef<Path>>(&self, config_path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        tokio::fs::write(config_path.as_ref(), content)
            .await
            .with_context(|| format!("Failed to write config file: {:?}", config_path.as_ref()))?;
        Ok(())
    }

    /// 解析 --servers 形式的逗号分隔列表
    pub fn set_backends_from_list(&mut self, list: &str) {
        self.backends = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }

    pub fn backend_addrs(&self) -> Result<Vec<BackendAddr>> {
        self.backends
            .iter()
            .map(|raw| {
                raw.parse::<BackendAddr>()
                    .with_context(|| format!("Invalid backend entry '{}'", raw))
            })
            .collect()
    }

    pub fn metrics_bind(&self) -> Result<SocketAddr> {
        self.monitoring
            .metrics_bind
            .parse()
            .with_context(|| format!("Invalid metrics bind address '{}'", self.monitoring.metrics_bind))
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(anyhow::anyhow!("At least one backend must be configured"));
        }
        self.backend_addrs()?;

        if self.server.host.is_empty() {
            return Err(anyhow::anyhow!("Listen host cannot be empty"));
        }
        if self.server.buffer_size == 0 {
            return Err(anyhow::anyhow!("Buffer size cannot be 0"));
        }
        if self.server.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Backend connect timeout cannot be 0"));
        }

        if self.health_check.interval_secs == 0 {
            return Err(anyhow::anyhow!("Health check interval cannot be 0"));
        }
        if self.health_check.timeout_ms == 0 {
            return Err(anyhow::anyhow!("Health check timeout cannot be 0"));
        }
        if self.health_check.probe.is_empty() {
            return Err(anyhow::anyhow!("Health check probe cannot be empty"));
        }

        if self.monitoring.enable_metrics {
            self.metrics_bind()?;
        }

        Ok(())
    }
}
