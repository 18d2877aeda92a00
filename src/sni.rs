/// TLS SNI 嗅探
///
/// 读取新连接的第一个 TLS 记录并解析 ClientHello 中的服务器名，不参与握手；
/// 嗅探时读取的字节由 [`PrefixedStream`] 重放给后续处理
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ProxyError, Result};

/// Default time allowed for the client's first flight.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the bytes buffered while sniffing.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 16 * 1024 + 5;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Outcome of inspecting a connection's first bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Server name found, lowercased and without a trailing dot.
    Found(String),
    /// A ClientHello without a server_name extension.
    NoSni,
    /// Not a TLS handshake record.
    NotTls,
    /// Truncated or inconsistent ClientHello.
    Malformed,
    /// The client did not send enough bytes in time.
    Timeout,
}

/// Reads and parses the ClientHello of a raw connection.
#[derive(Debug, Clone)]
pub struct SniInspector {
    timeout: Duration,
    max_bytes: usize,
}

impl Default for SniInspector {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

impl SniInspector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes.max(RECORD_HEADER_LEN);
        self
    }

    /// Sniff the server name from `stream`.
    ///
    /// Whatever the outcome, the returned stream replays every byte that was
    /// read. I/O errors while reading are returned as is.
    pub async fn inspect<S>(&self, mut stream: S) -> io::Result<(SniResult, PrefixedStream<S>)>
    where
        S: AsyncRead + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(1024);
        let read = timeout(
            self.timeout,
            read_first_record(&mut stream, &mut buffer, self.max_bytes),
        )
        .await;

        let result = match read {
            Ok(Ok(())) => parse_client_hello(&buffer),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(
                    "SNI sniff timed out after {:?} with {} bytes",
                    self.timeout,
                    buffer.len()
                );
                SniResult::Timeout
            }
        };

        Ok((result, PrefixedStream::new(buffer.freeze(), stream)))
    }

    /// Sniff and require a server name.
    pub async fn sniff<S>(&self, stream: S, peer: SocketAddr) -> Result<SniffedConnection<S>>
    where
        S: AsyncRead + Unpin,
    {
        let (result, stream) = self.inspect(stream).await?;
        match result {
            SniResult::Found(host) => Ok(SniffedConnection { host, stream, peer }),
            SniResult::Timeout => Err(ProxyError::timeout(self.timeout)),
            other => {
                debug!("No server name from {}: {:?}", peer, other);
                Err(ProxyError::SniMissing { peer })
            }
        }
    }
}

/// Read the record header and then as much of the record as fits.
async fn read_first_record<S>(stream: &mut S, buffer: &mut BytesMut, max: usize) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    while buffer.len() < RECORD_HEADER_LEN {
        if stream.read_buf(buffer).await? == 0 {
            return Ok(());
        }
    }

    if buffer[0] != CONTENT_TYPE_HANDSHAKE {
        return Ok(());
    }

    let record_len = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
    let wanted = (RECORD_HEADER_LEN + record_len).min(max);
    while buffer.len() < wanted {
        let mut chunk = (&mut *stream).take((wanted - buffer.len()) as u64);
        if chunk.read_buf(buffer).await? == 0 {
            break;
        }
    }
    Ok(())
}

/// Bounds-checked reader over the ClientHello body.
struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Option<u8> {
        let (&b, rest) = self.data.split_first()?;
        self.data = rest;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Some(head)
    }

    fn skip_u8_prefixed(&mut self) -> Option<()> {
        let len = self.u8()? as usize;
        self.take(len).map(|_| ())
    }

    fn skip_u16_prefixed(&mut self) -> Option<()> {
        let len = self.u16()? as usize;
        self.take(len).map(|_| ())
    }
}

/// Parse the server name out of a buffered first TLS record.
pub fn parse_client_hello(data: &[u8]) -> SniResult {
    if data.is_empty() || data[0] != CONTENT_TYPE_HANDSHAKE {
        return SniResult::NotTls;
    }
    if data.len() < RECORD_HEADER_LEN + 4 {
        return SniResult::Malformed;
    }

    let handshake = &data[RECORD_HEADER_LEN..];
    if handshake[0] != HANDSHAKE_CLIENT_HELLO {
        return SniResult::NotTls;
    }

    let mut cursor = Cursor {
        data: &handshake[4..],
    };
    find_server_name(&mut cursor).unwrap_or(SniResult::Malformed)
}

fn find_server_name(c: &mut Cursor<'_>) -> Option<SniResult> {
    // legacy_version + random
    c.take(2 + 32)?;
    c.skip_u8_prefixed()?; // session id
    c.skip_u16_prefixed()?; // cipher suites
    c.skip_u8_prefixed()?; // compression methods

    if c.data.is_empty() {
        return Some(SniResult::NoSni);
    }

    let extensions_len = c.u16()? as usize;
    let available = extensions_len.min(c.data.len());
    let mut extensions = Cursor {
        data: c.take(available)?,
    };

    while extensions.data.len() >= 4 {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let body = extensions.take(ext_len)?;
        if ext_type == EXTENSION_SERVER_NAME {
            return Some(parse_server_name_extension(body));
        }
    }

    Some(SniResult::NoSni)
}

fn parse_server_name_extension(body: &[u8]) -> SniResult {
    let mut c = Cursor { data: body };
    let Some(list_len) = c.u16() else {
        return SniResult::Malformed;
    };
    let Some(list) = c.take(list_len as usize) else {
        return SniResult::Malformed;
    };

    let mut names = Cursor { data: list };
    while !names.data.is_empty() {
        let (Some(name_type), Some(name_len)) = (names.u8(), names.u16()) else {
            return SniResult::Malformed;
        };
        let Some(name) = names.take(name_len as usize) else {
            return SniResult::Malformed;
        };
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }
        return match std::str::from_utf8(name) {
            Ok(host) if !host.is_empty() => {
                SniResult::Found(host.to_ascii_lowercase().trim_end_matches('.').to_string())
            }
            _ => SniResult::Malformed,
        };
    }

    SniResult::NoSni
}

/// A stream that yields `prefix` before reading from `inner`.
///
/// Writes go straight to `inner`.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Bytes not yet replayed.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A raw connection together with the server name sniffed from it.
///
/// `stream` is positioned at the connection's first byte.
#[derive(Debug)]
pub struct SniffedConnection<S> {
    pub host: String,
    pub stream: PrefixedStream<S>,
    pub peer: SocketAddr,
}
