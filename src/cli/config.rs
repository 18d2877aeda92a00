use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{ProxyConfiguration, DEFAULT_USER_AGENT};

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &Path) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {:?}", config_path))?;
    let mode = metadata.permissions().mode();

    // 其他用户可读（o+r = 0o004）或组用户可读（g+r = 0o040）
    if mode & 0o044 != 0 {
        warn!(
            "⚠️  SECURITY WARNING: Config file {:?} is readable by other users (permissions: {:o})\n\
             This file may contain the upstream proxy password.\n\
             RECOMMENDATION: chmod 600 {:?}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &Path) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    mode: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

fn print_failure(format: &str, error: String) -> Result<()> {
    if format == "json" {
        let result = CheckResult {
            valid: false,
            mode: "unknown".to_string(),
            warnings: vec![],
            error: Some(error),
            details: serde_json::json!({}),
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("✗ {}", error);
    }
    Ok(())
}

fn collect_warnings(config: &ProxyConfiguration) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.forwarding_enabled && config.login.is_empty() {
        warnings.push(
            "No login configured; credentials will be looked up in netrc or the credential store"
                .to_string(),
        );
    }
    if !config.login.is_empty() && config.password.is_empty() {
        warnings.push("Login is set but password is empty".to_string());
    }
    if let Some(ref netrc) = config.netrc_path {
        if !netrc.exists() {
            warnings.push(format!("Netrc file not found: {:?}", netrc));
        }
    }
    if config.shutdown_timeout().is_none() {
        warnings.push("No shutdown deadline; stop waits for every connection to end".to_string());
    }
    warnings
}

/// Check configuration file format
pub fn check_config(config_path: &Path, format: &str) -> Result<()> {
    if !config_path.exists() {
        let message = format!("Configuration file not found: {:?}", config_path);
        print_failure(format, message.clone())?;
        anyhow::bail!(message);
    }

    if format == "text" {
        println!("Checking configuration file: {:?}\n", config_path);
    }

    let config = match ProxyConfiguration::load(config_path).and_then(|c| c.validate().map(|_| c))
    {
        Ok(config) => config,
        Err(e) => {
            if format == "json" {
                print_failure(format, format!("{:#}", e))?;
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (quotes, brackets)");
                println!("  2. Verify field names are spelled correctly");
                println!("  3. Ensure port numbers are valid (1-65535)");
                println!("  4. Forwarding mode needs target_proxy_host and target_proxy_port");
                println!("  5. SIMPLE_PROXY_* environment variables override the file");
            }
            return Err(e);
        }
    };

    let warnings = collect_warnings(&config);
    let details = serde_json::json!({
        "listen_addr": config.listen_addr(),
        "target_proxy": config.target_proxy_addr(),
        "login": config.login,
        "password_length": config.password.len(),
        "custom_user_agent": config.user_agent != DEFAULT_USER_AGENT,
        "tunnel_port": config.tunnel_port,
        "verbose": config.verbose,
    });

    if format == "json" {
        let result = CheckResult {
            valid: true,
            mode: config.mode().to_string(),
            warnings,
            error: None,
            details,
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("✓ Mode: {}", config.mode());
        println!("✓ Listen address: {}", config.listen_addr());
        if config.forwarding_enabled {
            println!("✓ Upstream proxy: {}", config.target_proxy_addr());
            if !config.login.is_empty() {
                println!("✓ Login: {}", config.login);
            }
        } else {
            println!("✓ Tunnel port: {}", config.tunnel_port);
        }
        for warning in &warnings {
            println!("⚠ Warning: {}", warning);
        }
        println!("\n✓ Proxy configuration is valid!");
    }

    Ok(())
}
