/// HTTP/1.x 报文头解析与消息体分帧
///
/// 报文头由 `httparse` 解析；读取基于 [`AsyncBufRead`]，报文头之后的字节留在缓冲区中，
/// 由调用方继续按 [`BodyKind`] 转发消息体，或在升级为隧道时原样取出
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{ProxyError, Result};

/// 报文头最大长度
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// 报文头中的最大头部数量
const MAX_HEADERS: usize = 100;

/// 分块编码中单行（块大小行、trailer 行）的最大长度
const MAX_LINE_SIZE: u64 = 4096;

/// 读取报文头的超时时间
pub const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// 转发消息体时的空闲超时时间
pub const BODY_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

fn version_string(minor: Option<u8>) -> String {
    format!("HTTP/1.{}", minor.unwrap_or(1))
}

fn owned_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// 逗号分隔的头部值中是否含有某个标记（不区分大小写）
fn has_token(headers: &[(String, String)], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .flat_map(|(_, v)| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// 解析后的请求头，保留原始的头部顺序和大小写
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// 尝试从缓冲区解析；数据不完整时返回 None，完整时返回（请求头，报文头长度）
    pub fn try_parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => {
                return Err(ProxyError::invalid_request(format!(
                    "malformed request head: {}",
                    e
                )))
            }
        };

        let (Some(method), Some(target)) = (req.method, req.path) else {
            return Err(ProxyError::invalid_request("incomplete request line"));
        };
        Ok(Some((
            Self {
                method: method.to_string(),
                target: target.to_string(),
                version: version_string(req.version),
                headers: owned_headers(req.headers),
            },
            len,
        )))
    }

    /// 从完整的请求头（含结尾空行）解析
    pub fn parse(raw: &[u8]) -> Result<Self> {
        Self::try_parse(raw)?
            .map(|(head, _)| head)
            .ok_or_else(|| ProxyError::invalid_request("incomplete request head"))
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// 第一个同名头部的值（不区分大小写）
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// 同名头部出现的次数
    pub fn header_count(&self, name: &str) -> usize {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// 删除所有同名头部
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// 替换同名头部，结果中只保留一个
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.into()));
    }

    /// 客户端是否希望在本次请求后保持连接
    ///
    /// 同时识别 Connection 和旧式的 Proxy-Connection
    pub fn wants_keep_alive(&self) -> bool {
        let mentions = |token: &str| {
            has_token(&self.headers, "Connection", token)
                || has_token(&self.headers, "Proxy-Connection", token)
        };
        if self.version == "HTTP/1.0" {
            mentions("keep-alive")
        } else {
            !mentions("close")
        }
    }

    /// 是否为协议升级请求（如 WebSocket）
    pub fn wants_upgrade(&self) -> bool {
        self.has_header("Upgrade") && has_token(&self.headers, "Connection", "upgrade")
    }

    /// 是否带有 `Expect: 100-continue`
    pub fn expects_continue(&self) -> bool {
        has_token(&self.headers, "Expect", "100-continue")
    }

    /// 请求体的分帧方式
    pub fn body_kind(&self) -> Result<BodyKind> {
        if self.has_header("Transfer-Encoding") {
            // 最后一个传输编码必须是 chunked，否则无法确定请求体长度
            return if last_coding_is_chunked(&self.headers) {
                Ok(BodyKind::Chunked)
            } else {
                Err(ProxyError::invalid_request(
                    "request body with unknown length",
                ))
            };
        }
        match content_length(&self.headers)? {
            Some(0) | None => Ok(BodyKind::Empty),
            Some(n) => Ok(BodyKind::Length(n)),
        }
    }

    /// 序列化为线上格式（含结尾空行）
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        write_headers(&mut out, &self.headers);
        out
    }
}

/// 解析后的响应头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// 尝试从缓冲区解析；数据不完整时返回 None
    pub fn try_parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        let len = match resp.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => {
                return Err(ProxyError::invalid_request(format!(
                    "malformed response head: {}",
                    e
                )))
            }
        };

        let Some(code) = resp.code else {
            return Err(ProxyError::invalid_request("incomplete status line"));
        };
        Ok(Some((
            Self {
                version: version_string(resp.version),
                code,
                reason: resp.reason.unwrap_or_default().to_string(),
                headers: owned_headers(resp.headers),
            },
            len,
        )))
    }

    /// 从完整的响应头解析
    pub fn parse(raw: &[u8]) -> Result<Self> {
        Self::try_parse(raw)?
            .map(|(head, _)| head)
            .ok_or_else(|| ProxyError::invalid_request("incomplete response head"))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 1xx 中间响应（不含 101 协议切换）
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.code) && self.code != 101
    }

    pub fn is_switching_protocols(&self) -> bool {
        self.code == 101
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// 响应体的分帧方式，`method` 为对应请求的方法
    pub fn body_kind(&self, method: &str) -> Result<BodyKind> {
        if method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.code)
            || self.code == 204
            || self.code == 304
        {
            return Ok(BodyKind::Empty);
        }
        if find_header(&self.headers, "Transfer-Encoding").is_some() {
            return Ok(if last_coding_is_chunked(&self.headers) {
                BodyKind::Chunked
            } else {
                BodyKind::UntilEof
            });
        }
        match content_length(&self.headers)? {
            Some(0) => Ok(BodyKind::Empty),
            Some(n) => Ok(BodyKind::Length(n)),
            None => Ok(BodyKind::UntilEof),
        }
    }

    /// 告知客户端连接是否保持
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.headers.retain(|(n, _)| {
            !n.eq_ignore_ascii_case("Connection")
                && !n.eq_ignore_ascii_case("Proxy-Connection")
                && !n.eq_ignore_ascii_case("Keep-Alive")
        });
        let value = if keep_alive { "keep-alive" } else { "close" };
        self.headers.push(("Connection".to_string(), value.to_string()));
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.version, self.code, self.reason).as_bytes(),
        );
        write_headers(&mut out, &self.headers);
        out
    }
}

impl std::fmt::Display for ResponseHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.version, self.code, self.reason)
    }
}

fn write_headers(out: &mut Vec<u8>, headers: &[(String, String)]) {
    for (name, value) in headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
}

fn last_coding_is_chunked(headers: &[(String, String)]) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("Transfer-Encoding"))
        .flat_map(|(_, v)| v.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

/// Content-Length；多个取值不一致时报错
fn content_length(headers: &[(String, String)]) -> Result<Option<u64>> {
    let mut length = None;
    for (_, value) in headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
    {
        for part in value.split(',') {
            let n = part.trim().parse::<u64>().map_err(|_| {
                ProxyError::invalid_request(format!("invalid Content-Length {:?}", value))
            })?;
            if length.is_some_and(|prev| prev != n) {
                return Err(ProxyError::invalid_request("conflicting Content-Length"));
            }
            length = Some(n);
        }
    }
    Ok(length)
}

/// 消息体的分帧方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    /// 直到对端关闭连接
    UntilEof,
}

/// 从流中读取一个请求头
///
/// 在任何字节到达之前连接被关闭时返回 None
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    read_head(reader, RequestHead::try_parse).await
}

/// 从流中读取一个响应头
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    read_head(reader, ResponseHead::try_parse)
        .await?
        .ok_or_else(|| ProxyError::invalid_request("connection closed before response"))
}

/// 读取一个报文头，带超时
async fn read_head<R, T>(
    reader: &mut R,
    parse: fn(&[u8]) -> Result<Option<(T, usize)>>,
) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
{
    timeout(HEAD_READ_TIMEOUT, fill_head(reader, parse))
        .await
        .map_err(|_| ProxyError::timeout(HEAD_READ_TIMEOUT))?
}

/// 逐块读取直到报文头完整；只消费报文头本身的字节
async fn fill_head<R, T>(
    reader: &mut R,
    parse: fn(&[u8]) -> Result<Option<(T, usize)>>,
) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::invalid_request(
                "unexpected EOF while reading head",
            ));
        }

        let before = head.len();
        let take = chunk.len().min(MAX_HEAD_SIZE - before);
        head.extend_from_slice(&chunk[..take]);

        if let Some((parsed, len)) = parse(&head)? {
            reader.consume(len.saturating_sub(before));
            return Ok(Some(parsed));
        }
        reader.consume(take);
        if head.len() >= MAX_HEAD_SIZE {
            return Err(ProxyError::invalid_request("head too long"));
        }
    }
}

/// 按分帧方式转发一个消息体，返回写出的字节数
pub async fn copy_body<R, W>(reader: &mut R, writer: &mut W, kind: BodyKind) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match kind {
        BodyKind::Empty => 0,
        BodyKind::Length(n) => copy_exact(reader, writer, n).await?,
        BodyKind::UntilEof => copy_until_eof(reader, writer).await?,
        BodyKind::Chunked => copy_chunked(reader, writer).await?,
    };
    writer.flush().await?;
    Ok(copied)
}

async fn fill<R>(reader: &mut R) -> Result<&[u8]>
where
    R: AsyncBufRead + Unpin,
{
    timeout(BODY_IDLE_TIMEOUT, reader.fill_buf())
        .await
        .map_err(|_| ProxyError::timeout(BODY_IDLE_TIMEOUT))?
        .map_err(Into::into)
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    while remaining > 0 {
        let buf = fill(reader).await?;
        if buf.is_empty() {
            return Err(ProxyError::invalid_request("body ended early"));
        }
        let n = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        writer.write_all(&buf[..n]).await?;
        reader.consume(n);
        remaining -= n as u64;
    }
    Ok(len)
}

async fn copy_until_eof<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let buf = fill(reader).await?;
        if buf.is_empty() {
            return Ok(total);
        }
        let n = buf.len();
        writer.write_all(buf).await?;
        reader.consume(n);
        total += n as u64;
    }
}

/// 读取一行（含 CRLF），超过长度限制视为错误
async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = (&mut *reader).take(MAX_LINE_SIZE);
    timeout(BODY_IDLE_TIMEOUT, limited.read_until(b'\n', &mut line))
        .await
        .map_err(|_| ProxyError::timeout(BODY_IDLE_TIMEOUT))??;
    if !line.ends_with(b"\n") {
        return Err(ProxyError::invalid_request("truncated chunked body"));
    }
    Ok(line)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProxyError::invalid_request("invalid chunk size line"))?;
    let size = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| ProxyError::invalid_request(format!("invalid chunk size {:?}", size)))
}

/// 原样转发分块编码的消息体，包括 trailer
async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let line = read_line(reader).await?;
        let size = parse_chunk_size(&line)?;
        writer.write_all(&line).await?;
        total += line.len() as u64;

        if size == 0 {
            // trailer 直到空行为止
            loop {
                let trailer = read_line(reader).await?;
                writer.write_all(&trailer).await?;
                total += trailer.len() as u64;
                if trailer == b"\r\n" || trailer == b"\n" {
                    return Ok(total);
                }
            }
        }

        // 块数据及其后的 CRLF
        total += copy_exact(reader, writer, size).await?;
        let end = read_line(reader).await?;
        if end != b"\r\n" && end != b"\n" {
            return Err(ProxyError::invalid_request("missing CRLF after chunk"));
        }
        writer.write_all(&end).await?;
        total += end.len() as u64;
    }
}

/// 简单的错误响应
pub fn error_response(code: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        reason.len(),
        reason
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    const GET: &[u8] = b"GET http://example.com/a?b=1 HTTP/1.1\r\n\
Host: example.com\r\n\
Proxy-Authorization: Basic old\r\n\
proxy-authorization: Basic older\r\n\
\r\n";

    #[test]
    fn test_parse_request_head() {
        let head = RequestHead::parse(GET).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.com/a?b=1");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("host"), Some("example.com"));
        assert_eq!(head.header_count("Proxy-Authorization"), 2);
        assert!(!head.is_connect());
        assert!(head.wants_keep_alive());
    }

    #[test]
    fn test_partial_head_needs_more_data() {
        assert!(RequestHead::try_parse(b"GET / HTTP/1.1\r\nHost: a\r\n")
            .unwrap()
            .is_none());
        let (_, len) = RequestHead::try_parse(b"GET / HTTP/1.1\r\n\r\nbody")
            .unwrap()
            .unwrap();
        assert_eq!(len, 18);
    }

    #[test]
    fn test_set_header_replaces_all_duplicates() {
        let mut head = RequestHead::parse(GET).unwrap();
        head.set_header("Proxy-Authorization", "Basic new");
        assert_eq!(head.header_count("proxy-authorization"), 1);
        assert_eq!(head.header("Proxy-Authorization"), Some("Basic new"));
        // 其他头部顺序不变
        assert_eq!(head.headers[0].0, "Host");
    }

    #[test]
    fn test_to_bytes_preserves_layout() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let head = RequestHead::parse(raw).unwrap();
        assert!(head.is_connect());
        assert_eq!(head.to_bytes(), raw.to_vec());
    }

    #[test]
    fn test_rejects_malformed_request_line() {
        assert!(RequestHead::parse(b"GARBAGE\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET / FTP/1.0\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"\r\n\r\n").is_err());
    }

    #[test]
    fn test_keep_alive_rules() {
        let close = RequestHead::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!close.wants_keep_alive());

        let old = RequestHead::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!old.wants_keep_alive());

        let old_keep =
            RequestHead::parse(b"GET / HTTP/1.0\r\nProxy-Connection: Keep-Alive\r\n\r\n")
                .unwrap();
        assert!(old_keep.wants_keep_alive());
    }

    #[test]
    fn test_request_body_kind() {
        let get = RequestHead::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(get.body_kind().unwrap(), BodyKind::Empty);

        let post = RequestHead::parse(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n").unwrap();
        assert_eq!(post.body_kind().unwrap(), BodyKind::Length(5));

        let chunked = RequestHead::parse(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\nContent-Length: 5\r\n\r\n",
        )
        .unwrap();
        assert_eq!(chunked.body_kind().unwrap(), BodyKind::Chunked);

        let unknown =
            RequestHead::parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n").unwrap();
        assert!(unknown.body_kind().is_err());

        let conflicting = RequestHead::parse(
            b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n",
        )
        .unwrap();
        assert!(conflicting.body_kind().is_err());
    }

    #[test]
    fn test_response_body_kind() {
        let ok = ResponseHead::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n").unwrap();
        assert_eq!(ok.body_kind("GET").unwrap(), BodyKind::Length(2));
        assert_eq!(ok.body_kind("HEAD").unwrap(), BodyKind::Empty);

        let no_content = ResponseHead::parse(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert_eq!(no_content.body_kind("GET").unwrap(), BodyKind::Empty);

        let streamed = ResponseHead::parse(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
        assert_eq!(streamed.body_kind("GET").unwrap(), BodyKind::UntilEof);
    }

    #[test]
    fn test_set_keep_alive_replaces_connection_headers() {
        let mut resp = ResponseHead::parse(
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nKeep-Alive: timeout=5\r\n\r\n",
        )
        .unwrap();
        resp.set_keep_alive(true);
        assert_eq!(resp.header("connection"), Some("keep-alive"));
        assert!(resp.header("keep-alive").is_none());
    }

    #[tokio::test]
    async fn test_read_request_head_keeps_leftover() {
        let mut input: &[u8] =
            b"POST /upload HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello";
        let head = read_request_head(&mut input).await.unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(input, b"hello");
    }

    #[tokio::test]
    async fn test_read_request_head_split_across_reads() {
        let (mut client, server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            client.write_all(b"GET / HTTP/1.1\r\nHost: a\r").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b"\n\r\nnext").await.unwrap();
        });

        let mut server = BufReader::new(server);
        let head = read_request_head(&mut server).await.unwrap().unwrap();
        assert_eq!(head.header("host"), Some("a"));
        assert_eq!(server.buffer(), b"next");
    }

    #[tokio::test]
    async fn test_read_request_head_rejects_oversized() {
        let mut big = b"GET / HTTP/1.1\r\n".to_vec();
        big.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE + 10));
        let mut input: &[u8] = &big;
        let err = read_request_head(&mut input).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_read_request_head_eof() {
        let mut partial: &[u8] = b"GET / HTTP/1.1\r\n";
        assert!(read_request_head(&mut partial).await.is_err());

        let mut empty: &[u8] = b"";
        assert!(read_request_head(&mut empty).await.unwrap().is_none());
    }

    #[test]
    fn test_response_head() {
        let status = ResponseHead::parse(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .unwrap();
        assert_eq!(status.code, 407);
        assert_eq!(status.reason, "Proxy Authentication Required");
        assert!(!status.is_success());

        let ok = ResponseHead::parse(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
        assert!(ok.is_success());
        assert!(ResponseHead::parse(b"SSH-2.0\r\n\r\n").is_err());

        let cont = ResponseHead::parse(b"HTTP/1.1 100 Continue\r\n\r\n").unwrap();
        assert!(cont.is_interim());
    }

    #[tokio::test]
    async fn test_copy_length_body_stops_at_boundary() {
        let mut input: &[u8] = b"helloGET /next";
        let mut out = Vec::new();
        let n = copy_body(&mut input, &mut out, BodyKind::Length(5))
            .await
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");
        assert_eq!(input, b"GET /next");
    }

    #[tokio::test]
    async fn test_copy_chunked_body_with_trailer() {
        let body: &[u8] = b"5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Sum: 1\r\n\r\n";
        let input = [body, b"GET /next"].concat();
        let mut reader: &[u8] = &input[..];
        let mut out = Vec::new();
        copy_body(&mut reader, &mut out, BodyKind::Chunked)
            .await
            .unwrap();
        assert_eq!(out, body);
        assert_eq!(reader, b"GET /next");
    }

    #[tokio::test]
    async fn test_truncated_length_body_is_an_error() {
        let mut input: &[u8] = b"abc";
        let mut out = Vec::new();
        assert!(copy_body(&mut input, &mut out, BodyKind::Length(10))
            .await
            .is_err());
    }
}
