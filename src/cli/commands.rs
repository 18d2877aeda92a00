use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{default_config_dir, default_config_path, ConfigWatcher, ProxyConfiguration};
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::listener::ListenerManager;

use super::args::{CredentialKey, CredentialsAction, RunArgs};
use super::config::{check_config, check_config_file_permissions, expand_path};
use super::logging::LogControl;
use super::template;

/// 凭据文件的默认文件名
const CREDENTIALS_FILE_NAME: &str = "credentials.toml";

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli, log: &LogControl) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run(args) => {
            run_proxy(args, log).await?;
        }
        Commands::Check { config, format } => {
            let config_path = resolve_config_path(config.as_deref())?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
        Commands::Credentials { action } => {
            manage_credentials(action)?;
        }
    }

    Ok(())
}

fn resolve_config_path(config: Option<&str>) -> Result<PathBuf> {
    match config {
        Some(path) => Ok(PathBuf::from(expand_path(path)?)),
        None => Ok(default_config_path()),
    }
}

impl RunArgs {
    /// 命令行参数优先于配置文件和环境变量
    pub fn apply_to(&self, config: &mut ProxyConfiguration) {
        if self.forward {
            config.forwarding_enabled = true;
        }
        if self.standalone {
            config.forwarding_enabled = false;
        }
        if let Some(ref host) = self.listen_host {
            config.listen_host = host.clone();
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(ref host) = self.target_proxy_host {
            config.target_proxy_host = host.clone();
        }
        if let Some(port) = self.target_proxy_port {
            config.target_proxy_port = port;
        }
        if let Some(ref login) = self.login {
            config.login = login.clone();
        }
        if let Some(ref password) = self.password {
            config.password = password.clone();
        }
        if self.log_requests {
            config.verbose = true;
        }
    }
}

/// Run the proxy until Ctrl-C
async fn run_proxy(args: &RunArgs, log: &LogControl) -> Result<()> {
    let config_path = resolve_config_path(args.config.as_deref())?;

    info!("Loading proxy configuration from: {:?}", config_path);
    let mut config = ProxyConfiguration::load_or_create(&config_path)?;
    check_config_file_permissions(&config_path)?;
    args.apply_to(&mut config);
    log.apply(&config);

    let mode = config.mode();
    let manager = ListenerManager::new(config);
    let handle = manager.start(mode).await?;
    info!(
        "Proxy listening on {} in {} mode",
        handle.local_addr, handle.mode
    );

    let mut changes = if args.watch {
        let (rx, _task) = ConfigWatcher::new(&config_path).spawn();
        Some(rx)
    } else {
        None
    };

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Received Ctrl-C, shutting down");
                break;
            }
            Some(mut updated) = next_change(&mut changes) => {
                args.apply_to(&mut updated);
                log.apply(&updated);
                apply_change(&manager, updated).await;
            }
        }
    }

    manager.stop().await?;
    if let Some(stats) = manager.stats() {
        info!(
            "Served {} connections ({} bytes up, {} bytes down)",
            stats.accepted, stats.bytes_client_to_remote, stats.bytes_remote_to_client
        );
    }
    Ok(())
}

async fn next_change(
    changes: &mut Option<mpsc::Receiver<ProxyConfiguration>>,
) -> Option<ProxyConfiguration> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// 配置变化时重建监听器；上一次重建失败则直接启动
async fn apply_change(manager: &ListenerManager, config: ProxyConfiguration) {
    let mode = config.mode();
    let result = if manager.is_running() {
        manager.reconfigure(config).await
    } else {
        manager.set_config(config);
        manager.start(mode).await.map(Some)
    };

    match result {
        Ok(Some(handle)) => info!(
            "Proxy listening on {} in {} mode",
            handle.local_addr, handle.mode
        ),
        Ok(None) => {}
        Err(e) => error!("Failed to apply configuration change: {}", e),
    }
}

fn open_store(key: &CredentialKey) -> Result<Arc<dyn CredentialStore>> {
    let path = match key.store {
        Some(ref store) => PathBuf::from(expand_path(store)?),
        None => {
            let config_path = resolve_config_path(key.config.as_deref())?;
            let configured = if config_path.exists() {
                ProxyConfiguration::load(&config_path)?.credential_store
            } else {
                None
            };
            configured.unwrap_or_else(|| default_config_dir().join(CREDENTIALS_FILE_NAME))
        }
    };
    info!("Using credential store {:?}", path);
    Ok(Arc::new(FileCredentialStore::new(path)))
}

fn manage_credentials(action: &CredentialsAction) -> Result<()> {
    match action {
        CredentialsAction::Set {
            key,
            login,
            password,
        } => {
            let password = match password {
                Some(p) => p.clone(),
                None => std::env::var("SIMPLE_PROXY_PASSWORD").context(
                    "No password given; pass --password or set SIMPLE_PROXY_PASSWORD",
                )?,
            };
            open_store(key)?.save(&key.label, &key.url, login, &password)?;
            println!("✓ Saved credentials for {} ({})", key.url, key.label);
        }
        CredentialsAction::Get { key } => match open_store(key)?.get(&key.label, &key.url)? {
            Some(credentials) => println!("{}", credentials.login),
            None => {
                warn!("No credentials stored for {}", key.url);
                anyhow::bail!("No credentials stored for {} ({})", key.url, key.label);
            }
        },
        CredentialsAction::Delete { key } => {
            open_store(key)?.delete(&key.label, &key.url)?;
            println!("✓ Deleted credentials for {} ({})", key.url, key.label);
        }
    }
    Ok(())
}
