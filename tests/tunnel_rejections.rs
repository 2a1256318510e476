use http::StatusCode;
use localshow::entrypoint;

mod common;

use common::{http_get, read_until, test_config, wait_for_port, ServerHandle, TunnelClient};

/// Two clients requesting the same subdomain: the second request is replied
/// false and its error stream carries the subdomain conflict, rendered on
/// its session terminal.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn duplicate_subdomain_is_rejected() {
    let config = test_config(18122, 18180, true);
    let _server = ServerHandle(tokio::spawn(entrypoint(config)));
    wait_for_port("127.0.0.1:18122").await;

    let first = TunnelClient { body: "first" };
    let mut first_session = russh::client::connect(Default::default(), "127.0.0.1:18122", first)
        .await
        .expect("Failed to connect to SSH server");
    assert!(first_session
        .authenticate_none("user")
        .await
        .expect("SSH authentication failed")
        .success());
    first_session
        .tcpip_forward("foo", 80)
        .await
        .expect("tcpip_forward failed");

    let second = TunnelClient { body: "second" };
    let mut second_session = russh::client::connect(Default::default(), "127.0.0.1:18122", second)
        .await
        .expect("Failed to connect to SSH server");
    assert!(second_session
        .authenticate_none("user")
        .await
        .expect("SSH authentication failed")
        .success());
    let mut terminal = second_session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    assert!(
        second_session.tcpip_forward("foo", 80).await.is_err(),
        "duplicate subdomain forwarding should be replied false"
    );
    let output = read_until(&mut terminal, "subdomain already registered").await;
    assert!(output.contains("subdomain already registered"));

    // The winner keeps serving.
    let (status, body) = http_get("127.0.0.1:18180", "foo.example.test", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "first");
}

/// Forwarding ports other than 80/443 is refused at the request boundary,
/// with the error delivered on the session terminal, and no vhost appears.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unsupported_port_is_rejected() {
    let config = test_config(18123, 18181, true);
    let _server = ServerHandle(tokio::spawn(entrypoint(config)));
    wait_for_port("127.0.0.1:18123").await;

    let client = TunnelClient { body: "never" };
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18123", client)
        .await
        .expect("Failed to connect to SSH server");
    assert!(session
        .authenticate_none("user")
        .await
        .expect("SSH authentication failed")
        .success());
    let mut terminal = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    assert!(
        session.tcpip_forward("bar", 22).await.is_err(),
        "forwarding port 22 should be replied false"
    );
    let output = read_until(&mut terminal, "unsupported port: 22").await;
    assert!(output.contains("unsupported port: 22"));

    let (status, body) = http_get("127.0.0.1:18181", "bar.example.test", "/").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("bar.example.test"));
}

/// An empty bind address gets a generated `adjective-noun` subdomain, and
/// the banner names it.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn empty_subdomain_is_generated() {
    let config = test_config(18124, 18182, true);
    let _server = ServerHandle(tokio::spawn(entrypoint(config)));
    wait_for_port("127.0.0.1:18124").await;

    let client = TunnelClient { body: "generated" };
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18124", client)
        .await
        .expect("Failed to connect to SSH server");
    assert!(session
        .authenticate_none("user")
        .await
        .expect("SSH authentication failed")
        .success());
    session
        .tcpip_forward("localhost", 80)
        .await
        .expect("tcpip_forward failed");
    let mut terminal = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    let banner = read_until(&mut terminal, "http://").await;
    let start = banner.find("http://").unwrap();
    let url = &banner[start..];
    let fqdn = url
        .trim_start_matches("http://")
        .split(&[':', '\x1b'][..])
        .next()
        .unwrap();
    let subdomain = fqdn.split('.').next().unwrap();
    assert_ne!(subdomain, "localhost");
    assert!(
        subdomain.contains('-'),
        "generated subdomain {subdomain:?} should be adjective-noun"
    );

    let host = format!("{subdomain}.example.test");
    let (status, body) = http_get("127.0.0.1:18182", &host, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "generated");
}
