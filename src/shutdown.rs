use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

/// 关机信号类型
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 程序内部触发的关机 (例如监听循环致命错误)
    Internal,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// 关机状态
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownState {
    /// 正常运行
    Running,
    /// 开始关机流程
    ShuttingDown,
    /// 已关闭
    Shutdown,
}

/// 关机协调器
///
/// 不等待连接排空：触发后各组件立即关闭自己持有的套接字。
pub struct GracefulShutdown {
    /// 关机信号广播器
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    /// 当前状态
    state: Arc<RwLock<ShutdownState>>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            shutdown_tx,
            state: Arc::new(RwLock::new(ShutdownState::Running)),
        }
    }

    /// 获取关机信号接收器
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    pub async fn get_state(&self) -> ShutdownState {
        self.state.read().await.clone()
    }

    pub async fn is_shutting_down(&self) -> bool {
        let state = self.state.read().await;
        !matches!(*state, ShutdownState::Running)
    }

    /// 启动信号监听，收到信号后触发关机
    pub fn start_signal_handling(self: &Arc<Self>) -> Result<()> {
        let shutdown = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for SIGINT: {}", e);
                return;
            }
            info!("Received SIGINT signal");
            shutdown.trigger_shutdown(ShutdownSignal::Interrupt).await;
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())?;
            let shutdown = Arc::clone(self);
            tokio::spawn(async move {
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM signal");
                    shutdown.trigger_shutdown(ShutdownSignal::Terminate).await;
                }
            });
        }

        info!("Signal handlers registered successfully");
        Ok(())
    }

    /// 触发关机，只有第一次触发会广播信号；返回本次是否生效
    pub async fn trigger_shutdown(&self, signal: ShutdownSignal) -> bool {
        let mut state = self.state.write().await;

        match *state {
            ShutdownState::Running => {
                info!("Initiating shutdown due to signal: {}", signal);
                *state = ShutdownState::ShuttingDown;

                if let Err(e) = self.shutdown_tx.send(signal) {
                    warn!("Failed to broadcast shutdown signal: {}", e);
                }
                true
            }
            _ => {
                warn!("Shutdown already in progress, ignoring signal: {}", signal);
                false
            }
        }
    }

    pub async fn mark_complete(&self) {
        let mut state = self.state.write().await;
        *state = ShutdownState::Shutdown;
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}
