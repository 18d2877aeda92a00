/// Forwarding mode: upstream relay and credential injection
mod common;

use simple_proxy::config::{ProxyConfiguration, DEFAULT_USER_AGENT};
use simple_proxy::{ListenerManager, ProxyError, ProxyMode};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// base64("alice:secret")
const ALICE_AUTH: &str = "Basic YWxpY2U6c2VjcmV0";

fn forwarding_config(
    dir: &tempfile::TempDir,
    upstream: &common::FakeUpstream,
    login: &str,
    password: &str,
) -> ProxyConfiguration {
    ProxyConfiguration {
        forwarding_enabled: true,
        target_proxy_host: "127.0.0.1".to_string(),
        target_proxy_port: upstream.port,
        login: login.to_string(),
        password: password.to_string(),
        ..common::test_config(dir)
    }
}

async fn start_forwarding(config: ProxyConfiguration) -> (ListenerManager, u16) {
    let port = config.listen_port;
    let manager = ListenerManager::new(config);
    manager
        .start(ProxyMode::Forwarding)
        .await
        .expect("Failed to start forwarding listener");
    (manager, port)
}

async fn send_request(port: u16, request: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    common::read_to_end(&mut stream).await
}

#[tokio::test]
async fn test_plain_request_gets_single_authorization() {
    let dir = common::temp_dir();
    let upstream = common::FakeUpstream::start(200).await;
    let (manager, port) =
        start_forwarding(forwarding_config(&dir, &upstream, "alice", "secret")).await;

    let response = send_request(
        port,
        "GET http://example.com/index.html HTTP/1.1\r\n\
         Host: example.com\r\n\
         Connection: close\r\n\
         Proxy-Authorization: Basic Zm9vOmJhcg==\r\n\r\n",
    )
    .await;
    assert!(String::from_utf8_lossy(&response).ends_with("ok"));

    let heads = upstream.wait_for_heads(1).await;
    let head = &heads[0];
    assert!(head.starts_with("GET http://example.com/index.html HTTP/1.1\r\n"));
    assert_eq!(
        common::header_values(head, "Proxy-Authorization"),
        vec![ALICE_AUTH]
    );
    assert_eq!(
        common::header_values(head, "User-Agent"),
        vec![DEFAULT_USER_AGENT]
    );

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_user_agent_is_kept() {
    let dir = common::temp_dir();
    let upstream = common::FakeUpstream::start(200).await;
    let (manager, port) =
        start_forwarding(forwarding_config(&dir, &upstream, "alice", "secret")).await;

    send_request(
        port,
        "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nUser-Agent: curl/8.0\r\n\
         Connection: close\r\n\r\n",
    )
    .await;

    let heads = upstream.wait_for_heads(1).await;
    assert_eq!(
        common::header_values(&heads[0], "User-Agent"),
        vec!["curl/8.0"]
    );

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_anonymous_forwarding_sends_no_authorization() {
    let dir = common::temp_dir();
    let upstream = common::FakeUpstream::start(200).await;
    let (manager, port) = start_forwarding(forwarding_config(&dir, &upstream, "", "")).await;

    send_request(
        port,
        "GET http://example.com/ HTTP/1.1\r\n\
         Host: example.com\r\n\
         Connection: close\r\n\
         Proxy-Authorization: Basic Zm9vOmJhcg==\r\n\r\n",
    )
    .await;

    let heads = upstream.wait_for_heads(1).await;
    assert!(common::header_values(&heads[0], "Proxy-Authorization").is_empty());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_anonymous_connect_sends_no_authorization() {
    let dir = common::temp_dir();
    let upstream = common::FakeUpstream::start(200).await;
    let (manager, port) = start_forwarding(forwarding_config(&dir, &upstream, "", "")).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    stream
        .write_all(
            b"CONNECT example.com:443 HTTP/1.1\r\n\
              Host: example.com:443\r\n\
              Proxy-Authorization: Basic Zm9vOmJhcg==\r\n\r\n",
        )
        .await
        .unwrap();
    let head = common::read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {}", head);

    let heads = upstream.wait_for_heads(1).await;
    let connect = &heads[0];
    assert!(connect.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    assert!(common::header_values(connect, "Proxy-Authorization").is_empty());
    assert_eq!(
        common::header_values(connect, "User-Agent"),
        vec![DEFAULT_USER_AGENT]
    );

    drop(stream);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_keep_alive_requests_each_carry_authorization() {
    let dir = common::temp_dir();
    let upstream = common::FakeUpstream::start_keep_alive().await;
    let (manager, port) =
        start_forwarding(forwarding_config(&dir, &upstream, "alice", "secret")).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    for path in ["/first", "/second"] {
        let request = format!(
            "GET http://example.com{} HTTP/1.1\r\nHost: example.com\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let head = common::read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {}", head);
        assert_eq!(common::header_values(&head, "Connection"), vec!["keep-alive"]);
        let mut body = [0u8; 2];
        timeout(Duration::from_secs(5), stream.read_exact(&mut body))
            .await
            .expect("Timeout waiting for response body")
            .unwrap();
        assert_eq!(&body, b"ok");
    }

    let heads = upstream.wait_for_heads(2).await;
    assert_eq!(heads.len(), 2);
    assert!(heads[0].starts_with("GET http://example.com/first HTTP/1.1\r\n"));
    assert!(heads[1].starts_with("GET http://example.com/second HTTP/1.1\r\n"));
    for head in &heads {
        assert_eq!(
            common::header_values(head, "Proxy-Authorization"),
            vec![ALICE_AUTH]
        );
        assert_eq!(
            common::header_values(head, "User-Agent"),
            vec![DEFAULT_USER_AGENT]
        );
    }

    drop(stream);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_credentials_from_netrc() {
    let dir = common::temp_dir();
    let upstream = common::FakeUpstream::start(200).await;
    let mut config = forwarding_config(&dir, &upstream, "", "");
    let netrc = dir.path().join("netrc");
    std::fs::write(&netrc, "machine 127.0.0.1 login alice password secret\n").unwrap();
    config.netrc_path = Some(netrc);
    let (manager, port) = start_forwarding(config).await;

    send_request(
        port,
        "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    let heads = upstream.wait_for_heads(1).await;
    assert_eq!(
        common::header_values(&heads[0], "Proxy-Authorization"),
        vec![ALICE_AUTH]
    );

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_connect_through_upstream() {
    let dir = common::temp_dir();
    let upstream = common::FakeUpstream::start(200).await;
    let (manager, port) =
        start_forwarding(forwarding_config(&dir, &upstream, "alice", "secret")).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let head = common::read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {}", head);

    stream.write_all(b"tunnel data").await.unwrap();
    let mut buf = [0u8; 11];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("Timeout waiting for tunnel echo")
        .unwrap();
    assert_eq!(&buf, b"tunnel data");

    let heads = upstream.wait_for_heads(1).await;
    let connect = &heads[0];
    assert!(connect.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    assert_eq!(
        common::header_values(connect, "Proxy-Authorization"),
        vec![ALICE_AUTH]
    );
    assert_eq!(
        common::header_values(connect, "User-Agent"),
        vec![DEFAULT_USER_AGENT]
    );

    drop(stream);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_upstream_refusal_is_relayed() {
    let dir = common::temp_dir();
    let upstream = common::FakeUpstream::start(407).await;
    let (manager, port) =
        start_forwarding(forwarding_config(&dir, &upstream, "alice", "wrong")).await;

    let response = send_request(
        port,
        "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
    )
    .await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 407"), "unexpected response: {}", response);
    assert!(response.contains("Proxy-Authenticate: Basic"));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_upstream_returns_bad_gateway() {
    let dir = common::temp_dir();
    let mut config = common::test_config(&dir);
    config.forwarding_enabled = true;
    config.target_proxy_host = "127.0.0.1".to_string();
    config.target_proxy_port = common::get_available_port();
    let (manager, port) = start_forwarding(config).await;

    let response = send_request(port, "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 502"));
    assert_eq!(manager.stats().unwrap().upstream_failures, 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_switching_modes_requires_reset() {
    let dir = common::temp_dir();
    let upstream = common::FakeUpstream::start(200).await;
    let (manager, port) =
        start_forwarding(forwarding_config(&dir, &upstream, "alice", "secret")).await;

    let err = manager.start(ProxyMode::Standalone).await.unwrap_err();
    assert!(matches!(err, ProxyError::AlreadyRunning));
    assert_eq!(manager.handle().unwrap().mode, ProxyMode::Forwarding);

    let handle = manager.reset(ProxyMode::Standalone).await.unwrap();
    assert_eq!(handle.mode, ProxyMode::Standalone);
    assert_eq!(handle.local_addr.port(), port);

    manager.stop().await.unwrap();
    assert!(!manager.is_running());
}
