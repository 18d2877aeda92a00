/// 自定义错误类型
///
/// 使用 thiserror 定义代理核心的错误分类，调用者（CLI / 托盘）可据此决定
/// 是展示给用户、改用 reset，还是仅记录日志
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// 代理核心的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 已有监听器在运行
    #[error("A proxy listener is already running; stop or reset it first")]
    AlreadyRunning,

    /// 绑定/监听失败（端口占用、权限不足），不自动重试
    #[error("Failed to listen on {addr}: {source}")]
    ListenError {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 单次 accept 失败（可恢复）
    #[error("Failed to accept connection: {0}")]
    AcceptError(#[source] io::Error),

    /// 监听器已关闭（accept 循环的正常退出信号）
    #[error("Listener closed")]
    ListenerClosed,

    /// 连接中没有 SNI 扩展
    #[error("Connection from {peer} carries no TLS server name")]
    SniMissing { peer: SocketAddr },

    /// 连接目标或上游代理失败
    #[error("Failed to dial {addr}: {source}")]
    UpstreamDialError {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 上游代理拒绝 CONNECT
    #[error("Upstream proxy refused tunnel to {target}: {status}")]
    UpstreamRefused { target: String, status: String },

    /// 无法解析的 HTTP 请求
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 凭据存储错误
    #[error("Credential store error: {0}")]
    Credentials(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建监听失败错误
    pub fn listen_error(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ListenError {
            addr: addr.into(),
            source,
        }
    }

    /// 创建拨号失败错误
    pub fn dial_error(addr: impl Into<String>, source: io::Error) -> Self {
        Self::UpstreamDialError {
            addr: addr.into(),
            source,
        }
    }

    /// 创建请求解析错误
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning)
    }

    pub fn is_listen_error(&self) -> bool {
        matches!(self, Self::ListenError { .. })
    }

    pub fn is_sni_missing(&self) -> bool {
        matches!(self, Self::SniMissing { .. })
    }

    pub fn is_dial_error(&self) -> bool {
        matches!(self, Self::UpstreamDialError { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 是否只影响单个连接（不应终止监听器）
    pub fn is_connection_scoped(&self) -> bool {
        !matches!(
            self,
            Self::AlreadyRunning | Self::ListenError { .. } | Self::Config(_)
        )
    }
}
