#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tcp_balancer::config::Settings;
use tcp_balancer::router::BackendRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// 测试用后端：探测报文回复 OK，普通请求回复 "名称:请求内容"
pub struct MockBackend {
    pub name: &'static str,
    pub addr: SocketAddr,
    up: Arc<AtomicBool>,
    hits: Arc<AtomicUsize>,
}

impl MockBackend {
    pub async fn spawn(name: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let up = Arc::new(AtomicBool::new(true));
        let hits = Arc::new(AtomicUsize::new(0));

        let accept_up = up.clone();
        let accept_hits = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let up = accept_up.clone();
                let hits = accept_hits.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let n = match stream.read(&mut buf).await {
                        Ok(n) if n > 0 => n,
                        _ => return,
                    };

                    // 下线状态：读取后直接关闭，不做任何回复
                    if !up.load(Ordering::SeqCst) {
                        return;
                    }

                    let request = &buf[..n];
                    if request.starts_with(b"GET /health-check") {
                        let _ = stream.write_all(b"OK").await;
                    } else {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let mut reply = format!("{}:", name).into_bytes();
                        reply.extend_from_slice(request);
                        let _ = stream.write_all(&reply).await;
                    }
                });
            }
        });

        Self {
            name,
            addr,
            up,
            hits,
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }
}

/// 接受连接但永不回复的后端
pub async fn spawn_silent_backend() -> SocketAddr {
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

pub fn settings_for(backends: &[String]) -> Settings {
    let mut settings = Settings::default();
    settings.backends = backends.to_vec();
    settings.server.host = "127.0.0.1".to_string();
    settings.server.port = 0;
    settings.server.connect_timeout_ms = 500;
    // 只依赖启动时的第一轮检查，其余检查由测试显式触发
    settings.health_check.interval_secs = 3600;
    settings.health_check.timeout_ms = 300;
    settings
}

pub async fn round_trip(client: &mut TcpStream, payload: &str) -> String {
    client.write_all(payload.as_bytes()).await.unwrap();
    let mut buf = [0u8; 1024];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("response timed out")
        .unwrap();
    String::from_utf8_lossy(&buf[..n]).to_string()
}

/// 等待条件成立，最多 2 秒
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

/// 等待启动时的第一轮健康检查全部完成
pub async fn wait_for_first_checks(registry: &BackendRegistry) {
    wait_until(|| async move {
        registry
            .status()
            .await
            .iter()
            .all(|s| s.seconds_since_check.is_some())
    })
    .await;
}
