/// 连接处理器
///
/// 每种运行模式一个实现，监听器只依赖 [`ConnectionHandler`] trait
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::warn;

use crate::config::{ProxyConfiguration, ProxyMode};
use crate::credentials::CredentialResolver;
use crate::error::{ProxyError, Result};
use crate::proxy::{ProxyCore, RoutingStrategy};
use crate::sni::{SniInspector, SniResult, SniffedConnection};
use crate::stats::StatsTracker;
use crate::tunnel::SyntheticTunnelRequest;

/// 单个已接受连接的处理逻辑
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// 处理连接直到其结束；错误只影响这一个连接
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()>;

    fn mode(&self) -> ProxyMode;
}

/// 独立模式：嗅探 SNI，合成 CONNECT，直连目标
pub struct StandaloneHandler {
    core: ProxyCore,
    inspector: SniInspector,
    tunnel_port: u16,
}

impl StandaloneHandler {
    pub fn new(config: &ProxyConfiguration, stats: StatsTracker) -> Self {
        Self {
            core: ProxyCore::new(RoutingStrategy::PassThrough, config, stats),
            inspector: SniInspector::new(config.sniff_timeout()),
            tunnel_port: config.tunnel_port,
        }
    }
}

#[async_trait]
impl ConnectionHandler for StandaloneHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let (result, stream) = self.inspector.inspect(stream).await?;

        match result {
            SniResult::Found(host) => {
                let conn = SniffedConnection { host, stream, peer };
                let request = SyntheticTunnelRequest::from_sniffed(&conn, self.tunnel_port);
                self.core.serve_synthetic(&request, conn.stream).await
            }
            // 显式的代理请求（浏览器配置了本代理）
            SniResult::NotTls if looks_like_http_request(stream.prefix()) => {
                self.core.serve_http(stream).await
            }
            SniResult::Timeout => Err(ProxyError::timeout(self.inspector.timeout())),
            SniResult::NoSni | SniResult::NotTls | SniResult::Malformed => {
                self.core.stats().record_sni_missing();
                warn!("Cannot support non-SNI enabled client {}", peer);
                Err(ProxyError::SniMissing { peer })
            }
        }
    }

    fn mode(&self) -> ProxyMode {
        ProxyMode::Standalone
    }
}

/// 转发模式：解析 HTTP 请求，经上游代理转发并注入认证
pub struct ForwardingHandler {
    core: ProxyCore,
}

impl ForwardingHandler {
    pub fn new(
        config: &ProxyConfiguration,
        resolver: &CredentialResolver,
        stats: StatsTracker,
    ) -> Self {
        let strategy = RoutingStrategy::for_mode(ProxyMode::Forwarding, config, resolver);
        Self {
            core: ProxyCore::new(strategy, config, stats),
        }
    }

    pub fn strategy(&self) -> &RoutingStrategy {
        self.core.strategy()
    }
}

#[async_trait]
impl ConnectionHandler for ForwardingHandler {
    async fn handle(&self, stream: TcpStream, _peer: SocketAddr) -> Result<()> {
        self.core.serve_http(stream).await
    }

    fn mode(&self) -> ProxyMode {
        ProxyMode::Forwarding
    }
}

/// 按模式构造处理器；转发模式在此时解析一次凭据
pub fn build_handler(
    mode: ProxyMode,
    config: &ProxyConfiguration,
    stats: StatsTracker,
) -> Arc<dyn ConnectionHandler> {
    match mode {
        ProxyMode::Standalone => Arc::new(StandaloneHandler::new(config, stats)),
        ProxyMode::Forwarding => {
            let resolver = CredentialResolver::from_config(config);
            Arc::new(ForwardingHandler::new(config, &resolver, stats))
        }
    }
}

/// 请求行形如 `METHOD SP ...`
fn looks_like_http_request(prefix: &[u8]) -> bool {
    let method_len = prefix
        .iter()
        .take_while(|b| b.is_ascii_uppercase())
        .count();
    (3..=7).contains(&method_len) && prefix.get(method_len) == Some(&b' ')
}
