/// Simple Proxy 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod auth;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod handler;
pub mod http;
pub mod listener;
pub mod proxy;
pub mod sni;
pub mod stats;
pub mod tunnel;

// 重新导出常用类型
pub use auth::AuthInjector;
pub use config::{ProxyConfiguration, ProxyMode};
pub use credentials::{CredentialResolver, CredentialStore, Credentials};
pub use error::{ProxyError, Result};
pub use handler::ConnectionHandler;
pub use listener::{ListenerHandle, ListenerManager};
pub use proxy::{ProxyCore, RoutingStrategy};
pub use sni::{SniInspector, SniResult, SniffedConnection};
pub use stats::{ListenerStats, StatsTracker};
pub use tunnel::SyntheticTunnelRequest;
