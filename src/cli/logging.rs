/// 日志初始化与运行期级别调整
use tracing::warn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::ProxyConfiguration;

/// 按 -v 次数决定默认级别；开启请求日志时至少为 info
pub fn default_level(verbosity: u8, log_requests: bool) -> &'static str {
    match verbosity {
        0 if log_requests => "info",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// 日志级别控制；设置了 RUST_LOG 时保持其过滤规则不变
#[derive(Clone, Default)]
pub struct LogControl {
    verbosity: u8,
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl LogControl {
    /// 初始化全局 subscriber
    pub fn init(verbosity: u8) -> Self {
        let (filter, from_env) = match EnvFilter::try_from_default_env() {
            Ok(filter) => (filter, true),
            Err(_) => (EnvFilter::new(default_level(verbosity, false)), false),
        };
        let (filter, handle) = reload::Layer::new(filter);

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();

        Self {
            verbosity,
            handle: (!from_env).then_some(handle),
        }
    }

    /// 按配置中的请求日志开关调整级别
    pub fn apply(&self, config: &ProxyConfiguration) {
        let Some(handle) = &self.handle else {
            return;
        };
        let level = default_level(self.verbosity, config.verbose);
        if let Err(e) = handle.reload(EnvFilter::new(level)) {
            warn!("Failed to adjust log level: {}", e);
        }
    }
}
