/// 配置文件变更通知
///
/// 轮询配置文件，内容变化时发送重新加载并校验过的配置快照
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ProxyConfiguration;

/// Default polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct ConfigWatcher {
    path: PathBuf,
    interval: Duration,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start watching. The task ends when the receiver is dropped.
    pub fn spawn(self) -> (mpsc::Receiver<ProxyConfiguration>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move {
            let mut last = tokio::fs::read(&self.path).await.ok();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即返回
            ticker.tick().await;

            info!("Watching configuration file {:?}", self.path);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tx.closed() => break,
                }

                let current = match tokio::fs::read(&self.path).await {
                    Ok(content) => Some(content),
                    Err(e) => {
                        debug!("Cannot read {:?}: {}", self.path, e);
                        None
                    }
                };

                if current.is_none() || current == last {
                    continue;
                }
                last = current;

                let config = match ProxyConfiguration::load(&self.path)
                    .and_then(|c| c.validate().map(|_| c))
                {
                    Ok(config) => config,
                    Err(e) => {
                        warn!(
                            "Ignoring invalid configuration change in {:?}: {:#}",
                            self.path, e
                        );
                        continue;
                    }
                };

                info!("Configuration file {:?} changed", self.path);
                if tx.send(config).await.is_err() {
                    break;
                }
            }

            debug!("Configuration watcher for {:?} stopped", self.path);
        });

        (rx, handle)
    }
}
