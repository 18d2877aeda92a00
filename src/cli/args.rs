use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "simple-proxy")]
#[command(
    author,
    version,
    about = "Local forwarding proxy with upstream authentication",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志详细程度（-v info，-vv debug，-vvv trace）
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 启动代理
    Run(RunArgs),
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径（默认 $XDG_CONFIG_HOME/simple-proxy/simple-proxy.toml）
        #[arg(short, long)]
        config: Option<String>,

        /// 输出格式 (text, json)
        #[arg(long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成配置模板
    Template {
        /// 输出文件路径（默认输出到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 管理凭据存储中的上游代理凭据
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },
}

#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// 配置文件路径（默认 $XDG_CONFIG_HOME/simple-proxy/simple-proxy.toml）
    #[arg(short, long)]
    pub config: Option<String>,

    /// 经上游代理转发
    #[arg(long, conflicts_with = "standalone")]
    pub forward: bool,

    /// 不经上游代理，直接连接目标
    #[arg(long)]
    pub standalone: bool,

    /// 监听地址
    #[arg(long)]
    pub listen_host: Option<String>,

    /// 监听端口
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// 上游代理地址
    #[arg(long)]
    pub target_proxy_host: Option<String>,

    /// 上游代理端口
    #[arg(long)]
    pub target_proxy_port: Option<u16>,

    /// 上游代理登录名
    #[arg(long)]
    pub login: Option<String>,

    /// 上游代理密码
    #[arg(long)]
    pub password: Option<String>,

    /// 记录每个请求
    #[arg(long)]
    pub log_requests: bool,

    /// 配置文件变化时自动重启监听器
    #[arg(long)]
    pub watch: bool,
}

#[derive(Subcommand, Debug)]
pub enum CredentialsAction {
    /// 保存凭据
    Set {
        #[command(flatten)]
        key: CredentialKey,

        /// 登录名
        #[arg(long)]
        login: String,

        /// 密码（未提供时从环境变量 SIMPLE_PROXY_PASSWORD 读取）
        #[arg(long)]
        password: Option<String>,
    },
    /// 显示已保存的登录名
    Get {
        #[command(flatten)]
        key: CredentialKey,
    },
    /// 删除凭据
    Delete {
        #[command(flatten)]
        key: CredentialKey,
    },
}

#[derive(Args, Debug, Clone)]
pub struct CredentialKey {
    /// 上游代理 URL，例如 http://proxy.example.com:8080
    #[arg(long)]
    pub url: String,

    /// 凭据标签
    #[arg(long, default_value = "simple-proxy")]
    pub label: String,

    /// 凭据存储文件（默认使用配置中的 credential_store）
    #[arg(long)]
    pub store: Option<String>,

    /// 配置文件路径
    #[arg(short, long)]
    pub config: Option<String>,
}
