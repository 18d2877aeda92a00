// 配置管理模块 - 使用模块化设计

mod validator;
mod watcher;

pub use validator::ConfigValidator;
pub use watcher::ConfigWatcher;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// 应用名称，同时用作配置目录名和凭据标签
pub const APP_NAME: &str = "simple-proxy";

/// 配置文件名
pub const CONFIG_FILE_NAME: &str = "simple-proxy.toml";

/// 环境变量前缀
pub const ENV_PREFIX: &str = "SIMPLE_PROXY_";

/// 请求未携带 User-Agent 时使用的默认值
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/78.0.3904.97 Safari/537.36";

/// 代理运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// 嗅探 SNI 后直连目标
    Standalone,
    /// 所有请求经上游代理转发，并注入认证信息
    Forwarding,
}

impl ProxyMode {
    /// 根据 forwarding_enabled 标志选择模式
    pub fn from_forwarding(enabled: bool) -> Self {
        if enabled {
            ProxyMode::Forwarding
        } else {
            ProxyMode::Standalone
        }
    }
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Standalone => write!(f, "standalone"),
            ProxyMode::Forwarding => write!(f, "forwarding"),
        }
    }
}

/// 代理配置快照，监听器启动时读取，运行期间不会被修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfiguration {
    /// 本地监听地址
    pub listen_host: String,
    /// 本地监听端口
    pub listen_port: u16,
    /// 上游代理地址
    pub target_proxy_host: String,
    /// 上游代理端口
    pub target_proxy_port: u16,
    /// 上游代理登录名（为空时从 netrc / 凭据存储中查找）
    pub login: String,
    /// 上游代理密码
    pub password: String,
    /// 是否记录每个请求
    pub verbose: bool,
    /// 是否启用转发模式
    pub forwarding_enabled: bool,
    /// 默认 User-Agent
    pub user_agent: String,
    /// SNI 隧道的目标端口
    pub tunnel_port: u16,
    /// SNI 嗅探超时（毫秒）
    pub sniff_timeout_ms: u64,
    /// 连接目标/上游代理的超时（秒）
    pub connect_timeout_secs: u64,
    /// 停止时等待存量连接的最长时间（秒），未设置时不等待也不强制关闭
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_timeout_secs: Option<u64>,
    /// netrc 文件路径（默认 ~/.netrc）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netrc_path: Option<PathBuf>,
    /// 凭据存储文件路径（可选）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_store: Option<PathBuf>,
    /// 凭据存储中使用的标签
    pub credential_label: String,
}

impl Default for ProxyConfiguration {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8118,
            target_proxy_host: String::new(),
            target_proxy_port: 8000,
            login: String::new(),
            password: String::new(),
            verbose: false,
            forwarding_enabled: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            tunnel_port: 443,
            sniff_timeout_ms: 5000,
            connect_timeout_secs: 10,
            shutdown_timeout_secs: None,
            netrc_path: None,
            credential_store: None,
            credential_label: APP_NAME.to_string(),
        }
    }
}

impl ProxyConfiguration {
    /// 本地监听地址（host:port）
    pub fn listen_addr(&self) -> String {
        join_host_port(&self.listen_host, self.listen_port)
    }

    /// 上游代理地址（host:port）
    pub fn target_proxy_addr(&self) -> String {
        join_host_port(&self.target_proxy_host, self.target_proxy_port)
    }

    /// 上游代理 URL，也是凭据存储中的键
    pub fn target_proxy_url(&self) -> String {
        format!("http://{}", self.target_proxy_addr())
    }

    pub fn mode(&self) -> ProxyMode {
        ProxyMode::from_forwarding(self.forwarding_enabled)
    }

    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_secs.map(Duration::from_secs)
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate(self)
    }

    /// 从 TOML 字符串解析配置（未填写的字段使用默认值）
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse proxy configuration")
    }

    /// 序列化为 TOML
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize proxy configuration")
    }

    /// 从文件加载配置，并应用环境变量覆盖
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// 加载配置；文件不存在时写入默认配置
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(
                "Configuration file not found in {:?}, a new file will be created",
                path
            );
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
            std::fs::write(path, Self::default().to_toml()?)
                .with_context(|| format!("Failed to write configuration file {:?}", path))?;
        }
        Self::load(path)
    }

    /// 使用 SIMPLE_PROXY_* 环境变量覆盖配置项
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("LISTEN_HOST") {
            self.listen_host = v;
        }
        if let Some(v) = var("LISTEN_PORT") {
            self.listen_port = parse_env("LISTEN_PORT", &v)?;
        }
        if let Some(v) = var("TARGET_PROXY_HOST") {
            self.target_proxy_host = v;
        }
        if let Some(v) = var("TARGET_PROXY_PORT") {
            self.target_proxy_port = parse_env("TARGET_PROXY_PORT", &v)?;
        }
        if let Some(v) = var("LOGIN") {
            self.login = v;
        }
        if let Some(v) = var("PASSWORD") {
            self.password = v;
        }
        if let Some(v) = var("VERBOSE") {
            self.verbose = parse_env("VERBOSE", &v)?;
        }
        if let Some(v) = var("FORWARDING_ENABLED") {
            self.forwarding_enabled = parse_env("FORWARDING_ENABLED", &v)?;
        }
        if let Some(v) = var("USER_AGENT") {
            self.user_agent = v;
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        anyhow::anyhow!(
            "Invalid value '{}' for {}{}: {}",
            value,
            ENV_PREFIX,
            name,
            e
        )
    })
}

/// 拼接 host:port，IPv6 地址加方括号
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// 配置目录：$XDG_CONFIG_HOME/simple-proxy 或 ~/.config/simple-proxy
pub fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir).join(APP_NAME);
        }
    }
    match home_dir() {
        Some(home) => home.join(".config").join(APP_NAME),
        None => {
            warn!("Cannot determine home directory, using current directory for configuration");
            PathBuf::from(".").join(APP_NAME)
        }
    }
}

/// 默认配置文件路径
pub fn default_config_path() -> PathBuf {
    default_config_dir().join(CONFIG_FILE_NAME)
}

/// 用户主目录
pub fn home_dir() -> Option<PathBuf> {
    let expanded = shellexpand::tilde("~");
    if expanded == "~" {
        None
    } else {
        Some(PathBuf::from(expanded.as_ref()))
    }
}
