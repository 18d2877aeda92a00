/// 代理核心
///
/// 请求处理引擎，启动时按 [`RoutingStrategy`] 配置一次：
/// - `PassThrough`：直接连接请求的目标
/// - `UpstreamForward`：所有请求经上游代理转发，并注入认证信息
///
/// 嗅探隧道与显式 CONNECT 走同一条 [`ProxyCore::serve_connect`] 路径
use bytes::Bytes;
use ::http::header::{CONNECTION, CONTENT_LENGTH, EXPECT, HOST, PROXY_AUTHORIZATION, USER_AGENT};
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::AuthInjector;
use crate::config::{join_host_port, ProxyConfiguration, ProxyMode};
use crate::credentials::{CredentialResolver, Credentials};
use crate::error::{ProxyError, Result};
use crate::http::{self, BodyKind, RequestHead};
use crate::sni::PrefixedStream;
use crate::stats::StatsTracker;
use crate::tunnel::{SyntheticTunnelRequest, TunnelWriter};

/// 连接空闲超时时间
const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// 数据复制缓冲区大小
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// TCP keepalive 参数
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// 写回客户端的隧道确认
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// 代替上游应答的 100-continue
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// 一个普通请求处理完后客户端连接的去向
enum Next {
    KeepAlive,
    Close,
    /// 101 协议切换，之后双向原样转发
    Upgrade(BufReader<TcpStream>),
}

/// 路由策略，启动监听器时选定，运行期间不变
#[derive(Clone, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// 直连目标
    PassThrough,
    /// 经上游代理转发
    UpstreamForward {
        host: String,
        port: u16,
        credentials: Credentials,
    },
}

impl RoutingStrategy {
    /// 按模式选择策略；转发模式下解析凭据
    pub fn for_mode(
        mode: ProxyMode,
        config: &ProxyConfiguration,
        resolver: &CredentialResolver,
    ) -> Self {
        match mode {
            ProxyMode::Standalone => RoutingStrategy::PassThrough,
            ProxyMode::Forwarding => {
                let credentials = resolver.resolve(config, &config.target_proxy_host);
                info!("Forwarding queries to proxy at {}", config.target_proxy_url());
                if !credentials.is_anonymous() {
                    info!("Using user account {}", credentials.login);
                }
                RoutingStrategy::UpstreamForward {
                    host: config.target_proxy_host.clone(),
                    port: config.target_proxy_port,
                    credentials,
                }
            }
        }
    }

    pub fn mode(&self) -> ProxyMode {
        match self {
            RoutingStrategy::PassThrough => ProxyMode::Standalone,
            RoutingStrategy::UpstreamForward { .. } => ProxyMode::Forwarding,
        }
    }
}

impl fmt::Debug for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingStrategy::PassThrough => write!(f, "PassThrough"),
            RoutingStrategy::UpstreamForward {
                host,
                port,
                credentials,
            } => f
                .debug_struct("UpstreamForward")
                .field("host", host)
                .field("port", port)
                .field("credentials", credentials)
                .finish(),
        }
    }
}

/// 代理核心
pub struct ProxyCore {
    strategy: RoutingStrategy,
    injector: AuthInjector,
    connect_timeout: Duration,
    verbose: bool,
    stats: StatsTracker,
}

impl ProxyCore {
    pub fn new(strategy: RoutingStrategy, config: &ProxyConfiguration, stats: StatsTracker) -> Self {
        let injector = match &strategy {
            RoutingStrategy::UpstreamForward { credentials, .. } => {
                AuthInjector::new(credentials, &config.user_agent)
            }
            RoutingStrategy::PassThrough => {
                AuthInjector::new(&Credentials::anonymous(), &config.user_agent)
            }
        };
        Self {
            strategy,
            injector,
            connect_timeout: config.connect_timeout(),
            verbose: config.verbose,
            stats,
        }
    }

    pub fn strategy(&self) -> &RoutingStrategy {
        &self.strategy
    }

    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    fn log_request(&self, args: fmt::Arguments<'_>) {
        if self.verbose {
            info!("{}", args);
        } else {
            debug!("{}", args);
        }
    }

    /// 处理一个显式的 HTTP 代理连接
    ///
    /// 普通请求逐个解析、改写后转发，同一连接上的每个请求都经过认证注入；
    /// 遇到 CONNECT 或协议切换后转为原样转发
    pub async fn serve_http<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = BufReader::new(stream);
        let mut served = 0usize;

        loop {
            let head = match http::read_request_head(&mut client).await {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(()),
                // 保持连接的空闲超时
                Err(e) if served > 0 && e.is_timeout() => return Ok(()),
                Err(e @ ProxyError::InvalidRequest(_)) => {
                    client
                        .write_all(&http::error_response(400, "Bad Request"))
                        .await
                        .ok();
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            served += 1;

            self.log_request(format_args!(
                "{} {} {} ({:?})",
                head.method,
                head.target,
                head.version,
                self.strategy.mode()
            ));

            if head.is_connect() {
                let leftover = Bytes::copy_from_slice(client.buffer());
                let (client_read, client_write) = tokio::io::split(client.into_inner());
                return self
                    .serve_connect(&head, leftover, client_read, client_write)
                    .await;
            }

            match self.serve_plain(head, &mut client).await? {
                Next::KeepAlive => continue,
                Next::Close => {
                    client.shutdown().await.ok();
                    return Ok(());
                }
                Next::Upgrade(remote) => {
                    let pending = Bytes::copy_from_slice(client.buffer());
                    let mut remote = remote.into_inner();
                    if !pending.is_empty() {
                        remote.write_all(&pending).await?;
                    }

                    let (mut client_read, mut client_write) =
                        tokio::io::split(client.into_inner());
                    let (mut remote_read, mut remote_write) = remote.split();
                    self.relay(
                        &mut client_read,
                        &mut client_write,
                        &mut remote_read,
                        &mut remote_write,
                    )
                    .await;
                    return Ok(());
                }
            }
        }
    }

    /// 处理嗅探得到的隧道
    ///
    /// 客户端写端包装为 [`TunnelWriter`]，隧道确认不会到达客户端
    pub async fn serve_synthetic<S>(
        &self,
        request: &SyntheticTunnelRequest,
        stream: PrefixedStream<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.log_request(format_args!(
            "Tunnel {} -> {} ({:?})",
            request.source_address,
            request.authority(),
            self.strategy.mode()
        ));

        let (client_read, client_write) = tokio::io::split(stream);
        self.serve_connect(
            &request.to_request_head(),
            Bytes::new(),
            client_read,
            TunnelWriter::new(client_write),
        )
        .await
    }

    /// CONNECT 隧道：建立到目标（或经上游）的连接，写回确认，然后双向转发
    pub async fn serve_connect<R, W>(
        &self,
        head: &RequestHead,
        leftover: Bytes,
        mut client_read: R,
        mut client_write: W,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let authority = head.target.as_str();
        if split_authority(authority).is_none() {
            client_write
                .write_all(&http::error_response(400, "Bad Request"))
                .await
                .ok();
            return Err(ProxyError::invalid_request(format!(
                "invalid CONNECT target {:?}",
                authority
            )));
        }

        let (mut remote, remote_leftover) = match &self.strategy {
            RoutingStrategy::PassThrough => {
                let remote = self.dial_or_502(authority, &mut client_write).await?;
                (remote, Bytes::new())
            }
            RoutingStrategy::UpstreamForward { host, port, .. } => {
                let upstream = join_host_port(host, *port);
                let remote = self.dial_or_502(&upstream, &mut client_write).await?;
                let mut remote = BufReader::new(remote);

                let connect = self.upstream_connect_head(head);
                remote.write_all(&connect.to_bytes()).await?;

                let mut response = match http::read_response_head(&mut remote).await {
                    Ok(response) => response,
                    Err(e) => {
                        client_write
                            .write_all(&http::error_response(502, "Bad Gateway"))
                            .await
                            .ok();
                        return Err(e);
                    }
                };
                if !response.is_success() {
                    warn!(
                        "Upstream proxy {} refused tunnel to {}: {}",
                        upstream, authority, response
                    );
                    let body = response.body_kind("CONNECT").unwrap_or(BodyKind::Empty);
                    response.set_keep_alive(false);
                    client_write.write_all(&response.to_bytes()).await?;
                    http::copy_body(&mut remote, &mut client_write, body)
                        .await
                        .ok();
                    client_write.flush().await?;
                    return Err(ProxyError::UpstreamRefused {
                        target: authority.to_string(),
                        status: response.to_string(),
                    });
                }
                let rest = Bytes::copy_from_slice(remote.buffer());
                (remote.into_inner(), rest)
            }
        };

        client_write.write_all(CONNECT_ESTABLISHED).await?;
        if !remote_leftover.is_empty() {
            client_write.write_all(&remote_leftover).await?;
        }
        client_write.flush().await?;

        if !leftover.is_empty() {
            remote.write_all(&leftover).await?;
        }

        let (mut remote_read, mut remote_write) = remote.split();
        self.relay(
            &mut client_read,
            &mut client_write,
            &mut remote_read,
            &mut remote_write,
        )
        .await;
        Ok(())
    }

    /// 普通（非 CONNECT）请求：改写请求头，按分帧转发请求体和响应
    ///
    /// 每个请求使用一条新的出站连接
    async fn serve_plain<S>(&self, mut head: RequestHead, client: &mut BufReader<S>) -> Result<Next>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let method = head.method.clone();
        let keep_alive = head.wants_keep_alive();
        let request_body = match head.body_kind() {
            Ok(kind) => kind,
            Err(e) => {
                client
                    .write_all(&http::error_response(400, "Bad Request"))
                    .await
                    .ok();
                return Err(e);
            }
        };

        let dial_addr = match &self.strategy {
            RoutingStrategy::PassThrough => {
                let authority = match to_origin_form(&mut head) {
                    Ok(authority) => authority,
                    Err(e) => {
                        client
                            .write_all(&http::error_response(400, "Bad Request"))
                            .await
                            .ok();
                        return Err(e);
                    }
                };
                head.remove_header(PROXY_AUTHORIZATION.as_str());
                authority
            }
            RoutingStrategy::UpstreamForward { host, port, .. } => {
                to_absolute_form(&mut head);
                self.injector.apply(&mut head);
                join_host_port(host, *port)
            }
        };

        let expects_continue = head.expects_continue();
        if expects_continue {
            head.remove_header(EXPECT.as_str());
        }
        let head = prepare_hop_headers(head);

        let remote = self.dial_or_502(&dial_addr, client).await?;
        let mut remote = BufReader::new(remote);
        let request = head.to_bytes();
        remote.write_all(&request).await?;
        if expects_continue {
            client.write_all(CONTINUE).await?;
            client.flush().await?;
        }
        let sent = http::copy_body(client, &mut remote, request_body).await?;
        self.stats
            .add_bytes_client_to_remote(request.len() as u64 + sent);

        let mut response = loop {
            let response = match http::read_response_head(&mut remote).await {
                Ok(response) => response,
                Err(e) => {
                    client
                        .write_all(&http::error_response(502, "Bad Gateway"))
                        .await
                        .ok();
                    return Err(e);
                }
            };
            if !response.is_interim() {
                break response;
            }
            client.write_all(&response.to_bytes()).await?;
        };

        if response.is_switching_protocols() {
            let mut forwarded = response.to_bytes();
            forwarded.extend_from_slice(remote.buffer());
            client.write_all(&forwarded).await?;
            client.flush().await?;
            self.stats.add_bytes_remote_to_client(forwarded.len() as u64);
            return Ok(Next::Upgrade(remote));
        }

        let response_body = match response.body_kind(&method) {
            Ok(kind) => kind,
            Err(e) => {
                client
                    .write_all(&http::error_response(502, "Bad Gateway"))
                    .await
                    .ok();
                return Err(e);
            }
        };
        // 以关闭连接为结束标志的响应体无法在同一连接上继续下一个请求
        let keep_alive = keep_alive && response_body != BodyKind::UntilEof;
        response.set_keep_alive(keep_alive);

        let response_head = response.to_bytes();
        client.write_all(&response_head).await?;
        let received = http::copy_body(&mut remote, client, response_body).await?;
        self.stats
            .add_bytes_remote_to_client(response_head.len() as u64 + received);

        Ok(if keep_alive { Next::KeepAlive } else { Next::Close })
    }

    /// 发往上游代理的 CONNECT 请求：Host、认证头、User-Agent
    fn upstream_connect_head(&self, client: &RequestHead) -> RequestHead {
        let mut head = RequestHead {
            method: "CONNECT".to_string(),
            target: client.target.clone(),
            version: "HTTP/1.1".to_string(),
            headers: vec![("Host".to_string(), client.target.clone())],
        };
        if let Some(ua) = client.header(USER_AGENT.as_str()) {
            head.headers.push(("User-Agent".to_string(), ua.to_string()));
        }
        self.injector.apply(&mut head);
        head
    }

    /// 连接失败时向客户端写 502
    async fn dial_or_502<W>(&self, addr: &str, client: &mut W) -> Result<TcpStream>
    where
        W: AsyncWrite + Unpin,
    {
        match dial(addr, self.connect_timeout).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.stats.record_upstream_failure();
                client
                    .write_all(&http::error_response(502, "Bad Gateway"))
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    /// 双向转发，任一方向结束后关闭对端的写方向
    async fn relay<CR, CW, RR, RW>(
        &self,
        client_read: &mut CR,
        client_write: &mut CW,
        remote_read: &mut RR,
        remote_write: &mut RW,
    ) where
        CR: AsyncRead + Unpin,
        CW: AsyncWrite + Unpin,
        RR: AsyncRead + Unpin,
        RW: AsyncWrite + Unpin,
    {
        let stats = &self.stats;
        let c2r = async {
            let result = copy_with_stats(client_read, remote_write, |n| {
                stats.add_bytes_client_to_remote(n)
            })
            .await;
            remote_write.shutdown().await.ok();
            result
        };
        let r2c = async {
            let result = copy_with_stats(remote_read, client_write, |n| {
                stats.add_bytes_remote_to_client(n)
            })
            .await;
            client_write.shutdown().await.ok();
            result
        };

        let (c2r_result, r2c_result) = tokio::join!(c2r, r2c);
        match (c2r_result, r2c_result) {
            (Ok(up), Ok(down)) => debug!("Relay finished: {} bytes up, {} bytes down", up, down),
            (Err(e), _) | (_, Err(e)) => debug!("Relay finished with error: {}", e),
        }
    }
}

/// 实时统计的数据复制函数（带空闲超时）
async fn copy_with_stats<R, W>(
    reader: &mut R,
    writer: &mut W,
    record: impl Fn(u64),
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match timeout(CONNECTION_IDLE_TIMEOUT, reader.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Connection idle timeout",
                ))
            }
        };
        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
        record(n as u64);
    }

    Ok(total)
}

/// 连接目标地址，设置 TCP_NODELAY 和 keepalive
pub async fn dial(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            ProxyError::dial_error(
                addr,
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            )
        })?
        .map_err(|e| ProxyError::dial_error(addr, e))?;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }
    apply_keepalive(&stream, addr);
    Ok(stream)
}

fn apply_keepalive(stream: &TcpStream, addr: &str) {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP keepalive on {}: {}", addr, e);
    }
}

/// 拆分 host:port（支持 [v6]:port）
pub fn split_authority(authority: &str) -> Option<(&str, u16)> {
    let (host, port) = authority.rsplit_once(':')?;
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || host.contains(['[', ']']) {
        return None;
    }
    Some((host, port))
}

/// 绝对形式改写为源站形式，返回要连接的 host:port
fn to_origin_form(head: &mut RequestHead) -> Result<String> {
    if head.target.starts_with('/') {
        let host = head
            .header(HOST.as_str())
            .ok_or_else(|| ProxyError::invalid_request("request without Host header"))?;
        return Ok(if split_authority(host).is_some() {
            host.to_string()
        } else {
            join_host_port(host, 80)
        });
    }

    let url = url::Url::parse(&head.target)
        .map_err(|e| ProxyError::invalid_request(format!("invalid URL {:?}: {}", head.target, e)))?;
    if url.scheme() != "http" {
        return Err(ProxyError::invalid_request(format!(
            "unsupported scheme {:?}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::invalid_request("no host in URL"))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let authority = join_host_port(host.trim_start_matches('[').trim_end_matches(']'), port);

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    if !head.has_header(HOST.as_str()) {
        head.headers.insert(0, ("Host".to_string(), authority.clone()));
    }
    head.target = path;
    Ok(authority)
}

/// 上游代理需要绝对形式的请求目标
fn to_absolute_form(head: &mut RequestHead) {
    if !head.target.starts_with('/') {
        return;
    }
    if let Some(host) = head.header(HOST.as_str()) {
        head.target = format!("http://{}{}", host, head.target);
    }
}

/// 逐跳头部：去掉 Proxy-Connection，出站连接只承载这一个请求
///
/// 协议升级请求保留 `Connection: upgrade`
fn prepare_hop_headers(mut head: RequestHead) -> RequestHead {
    let upgrade = head.wants_upgrade();
    head.remove_header("Proxy-Connection");
    head.remove_header("Keep-Alive");
    if head.has_header("Transfer-Encoding") {
        head.remove_header(CONTENT_LENGTH.as_str());
    }
    head.set_header(CONNECTION.as_str(), if upgrade { "upgrade" } else { "close" });
    head
}
