/// 隧道合成
///
/// 独立模式下把嗅探到的主机名转换为等价的 CONNECT 请求，使嗅探隧道与显式
/// CONNECT 隧道走同一条处理路径；[`TunnelWriter`] 吞掉处理路径写回的
/// "200 Connection established"，让客户端只看到目标服务器的原始字节
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tracing::trace;

use crate::config::join_host_port;
use crate::http::RequestHead;
use crate::sni::SniffedConnection;

/// 被吞掉的隧道确认报文
const TUNNEL_ACKS: [&[u8]; 2] = [
    b"HTTP/1.0 200 OK\r\n\r\n",
    b"HTTP/1.1 200 Connection established\r\n\r\n",
];

/// 由嗅探结果合成的 CONNECT 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticTunnelRequest {
    pub method: &'static str,
    pub target_host: String,
    pub target_port: u16,
    pub source_address: SocketAddr,
}

impl SyntheticTunnelRequest {
    pub fn new(target_host: impl Into<String>, target_port: u16, source_address: SocketAddr) -> Self {
        Self {
            method: "CONNECT",
            target_host: target_host.into(),
            target_port,
            source_address,
        }
    }

    /// 根据嗅探到的连接构造
    pub fn from_sniffed<S>(conn: &SniffedConnection<S>, target_port: u16) -> Self {
        Self::new(conn.host.clone(), target_port, conn.peer)
    }

    /// host:port
    pub fn authority(&self) -> String {
        join_host_port(&self.target_host, self.target_port)
    }

    /// 等价的 `CONNECT host:port HTTP/1.1` 请求头
    pub fn to_request_head(&self) -> RequestHead {
        let authority = self.authority();
        RequestHead {
            method: self.method.to_string(),
            target: authority.clone(),
            version: "HTTP/1.1".to_string(),
            headers: vec![("Host".to_string(), authority)],
        }
    }
}

/// 只写的响应适配器
///
/// 没有任何写状态行/头部的接口；在转发任何字节之前写入的第一条隧道确认报文
/// 会被丢弃，其余字节原样写入底层连接
#[derive(Debug)]
pub struct TunnelWriter<W> {
    inner: W,
    forwarded: bool,
    swallowed: bool,
}

impl<W> TunnelWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            forwarded: false,
            swallowed: false,
        }
    }

    /// 是否已经吞掉过确认报文
    pub fn swallowed(&self) -> bool {
        self.swallowed
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn should_swallow(&self, buf: &[u8]) -> bool {
        !self.forwarded && !self.swallowed && is_tunnel_ack(buf)
    }
}

/// 判断是否为隧道确认报文（原因短语不区分大小写）
pub fn is_tunnel_ack(buf: &[u8]) -> bool {
    TUNNEL_ACKS
        .iter()
        .any(|ack| ack.len() == buf.len() && ack.eq_ignore_ascii_case(buf))
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TunnelWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.should_swallow(buf) {
            trace!("Swallowed tunnel acknowledgment");
            self.swallowed = true;
            return Poll::Ready(Ok(buf.len()));
        }

        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                self.forwarded = true;
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
