//! Common utilities for integration tests
#![allow(dead_code)]

use parking_lot::Mutex;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use simple_proxy::config::ProxyConfiguration;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Configuration listening on a random local port, with no ambient credentials
pub fn test_config(netrc_dir: &tempfile::TempDir) -> ProxyConfiguration {
    ProxyConfiguration {
        listen_host: "127.0.0.1".to_string(),
        listen_port: get_available_port(),
        netrc_path: Some(netrc_dir.path().join("missing-netrc")),
        sniff_timeout_ms: 1000,
        connect_timeout_secs: 2,
        shutdown_timeout_secs: Some(1),
        ..Default::default()
    }
}

/// Create a simple echo server for testing
pub async fn start_echo_server(port: u16) -> tokio::task::JoinHandle<()> {
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind echo server");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    })
}

/// Read until the end of an HTTP head; returns the head as text
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .expect("Timeout reading head")
            .unwrap_or(0);
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Read everything until the peer closes
pub async fn read_to_end<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut data = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut data))
        .await
        .expect("Timeout reading response")
        .expect("Failed to read response");
    data
}

/// Count header lines named `name` (case-insensitive)
pub fn header_values<'a>(head: &'a str, name: &str) -> Vec<&'a str> {
    head.split("\r\n")
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .filter(|(n, _)| n.trim().eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim())
        .collect()
}

/// Fake upstream proxy that records every request head it receives
#[derive(Clone)]
pub struct FakeUpstream {
    pub port: u16,
    heads: Arc<Mutex<Vec<String>>>,
}

impl FakeUpstream {
    /// `connect_status` is the status sent back for CONNECT; 200 opens an echo tunnel
    pub async fn start(connect_status: u16) -> Self {
        Self::spawn(connect_status, false).await
    }

    /// Answers plain requests with a framed response and keeps the connection open
    pub async fn start_keep_alive() -> Self {
        Self::spawn(200, true).await
    }

    async fn spawn(connect_status: u16, keep_alive: bool) -> Self {
        let listener = TokioTcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake upstream");
        let port = listener.local_addr().unwrap().port();
        let heads = Arc::new(Mutex::new(Vec::new()));

        let recorded = heads.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    loop {
                        let head = read_head(&mut socket).await;
                        if head.is_empty() {
                            return;
                        }
                        let is_connect = head.starts_with("CONNECT ");
                        recorded.lock().push(head);

                        if !is_connect {
                            let response: &[u8] = if keep_alive {
                                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"
                            } else {
                                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
                            };
                            if socket.write_all(response).await.is_err() || !keep_alive {
                                return;
                            }
                            continue;
                        }

                        if connect_status == 200 {
                            if socket
                                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                                .await
                                .is_err()
                            {
                                return;
                            }
                            let (mut reader, mut writer) = socket.split();
                            let _ = tokio::io::copy(&mut reader, &mut writer).await;
                        } else {
                            let response = format!(
                                "HTTP/1.1 {} Proxy Authentication Required\r\n\
                                 Proxy-Authenticate: Basic realm=\"upstream\"\r\n\
                                 Content-Length: 0\r\n\r\n",
                                connect_status
                            );
                            let _ = socket.write_all(response.as_bytes()).await;
                        }
                        return;
                    }
                });
            }
        });

        Self { port, heads }
    }

    pub fn heads(&self) -> Vec<String> {
        self.heads.lock().clone()
    }

    /// Wait until `count` heads were recorded
    pub async fn wait_for_heads(&self, count: usize) -> Vec<String> {
        for _ in 0..50 {
            let heads = self.heads();
            if heads.len() >= count {
                return heads;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.heads()
    }
}

/// Hand-built TLS ClientHello record, optionally carrying a server name
pub fn client_hello(host: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();
    // supported_groups: x25519
    extensions.extend_from_slice(&[0x00, 0x0a, 0x00, 0x04, 0x00, 0x02, 0x00, 0x1d]);
    if let Some(host) = host {
        let name = host.as_bytes();
        let list_len = 3 + name.len();
        extensions.extend_from_slice(&[0x00, 0x00]);
        extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
        extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
        extensions.push(0x00);
        extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
        extensions.extend_from_slice(name);
    }

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x11; 32]);
    body.push(0x00);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Self-signed certificate for `localhost`
pub struct TestCert {
    pub cert: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl TestCert {
    pub fn generate() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("Failed to generate test certificate");
        Self {
            cert: certified.cert.der().clone(),
            key_der: certified.signing_key.serialize_der(),
        }
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert.clone()], key)
            .expect("Failed to create server config");
        TlsAcceptor::from(Arc::new(config))
    }

    pub fn connector(&self) -> TlsConnector {
        let mut root_store = rustls::RootCertStore::empty();
        root_store
            .add(self.cert.clone())
            .expect("Failed to add test certificate");
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

/// TLS echo server for `localhost`
pub async fn start_tls_echo_server(port: u16, cert: &TestCert) -> tokio::task::JoinHandle<()> {
    let acceptor = cert.acceptor();
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind TLS echo server");

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(socket).await else {
                    return;
                };
                let (mut reader, mut writer) = tokio::io::split(tls);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    })
}

/// TLS handshake with SNI `localhost` over an existing connection
pub async fn tls_connect(
    cert: &TestCert,
    stream: TcpStream,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let server_name = ServerName::try_from("localhost").expect("Invalid server name");
    timeout(
        Duration::from_secs(5),
        cert.connector().connect(server_name, stream),
    )
    .await
    .expect("TLS handshake timed out")
    .expect("TLS handshake failed")
}

pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}
