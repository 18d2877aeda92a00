use anyhow::Result;
use clap::Parser;
use simple_proxy::cli::{execute_command, Cli, LogControl};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG 优先，否则按 -v 次数决定日志级别，配置开启请求日志后再调整
    let log = LogControl::init(cli.verbose);

    info!("Simple Proxy v{}", env!("CARGO_PKG_VERSION"));

    execute_command(&cli, &log).await
}
