use anyhow::{bail, Result};
use tracing::warn;

use super::ProxyConfiguration;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        if addr.chars().any(char::is_whitespace) {
            bail!("{}: address '{}' contains whitespace", context, addr);
        }
        Ok(())
    }

    /// 验证完整配置
    ///
    /// 转发模式只由 forwarding_enabled 决定，上游地址为空不会被推断为独立模式
    pub fn validate(config: &ProxyConfiguration) -> Result<()> {
        Self::validate_address(&config.listen_host, "listen_host")?;
        Self::validate_port(config.tunnel_port, "tunnel_port")?;

        if config.sniff_timeout_ms == 0 {
            bail!("sniff_timeout_ms must be greater than 0");
        }
        if config.connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be greater than 0");
        }
        if config.credential_label.trim().is_empty() {
            bail!("credential_label cannot be empty");
        }
        if config.user_agent.contains(['\r', '\n']) {
            bail!("user_agent cannot contain line breaks");
        }

        if config.forwarding_enabled {
            Self::validate_address(&config.target_proxy_host, "target_proxy_host")?;
            Self::validate_port(config.target_proxy_port, "target_proxy_port")?;
        } else if !config.target_proxy_host.trim().is_empty() {
            warn!(
                "target_proxy_host '{}' is set but forwarding is disabled; running standalone",
                config.target_proxy_host
            );
        }

        if config.password.is_empty() && !config.login.is_empty() {
            warn!("login '{}' is configured without a password", config.login);
        }

        Ok(())
    }
}
