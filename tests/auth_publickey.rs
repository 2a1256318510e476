use std::sync::Arc;

use http::StatusCode;
use localshow::entrypoint;
use russh::keys::{key::PrivateKeyWithHashAlg, load_secret_key};

mod common;

use common::{data_path, http_get, test_config, wait_for_port, ServerHandle, TunnelClient};

/// With auth enabled, only keys from the authorized keys file may open
/// tunnels; unknown keys fail the handshake without affecting anyone else.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn authorized_key_tunnels_unknown_key_fails() {
    let config = test_config(18322, 18380, false);
    let _server = ServerHandle(tokio::spawn(entrypoint(config)));
    wait_for_port("127.0.0.1:18322").await;

    // The authorized key may forward.
    let key = load_secret_key(data_path("tests/data/client_keys/key1"), None)
        .expect("Missing file key1");
    let client = TunnelClient { body: "authorized" };
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18322", client)
        .await
        .expect("Failed to connect to SSH server");
    let hash_alg = session
        .best_supported_rsa_hash()
        .await
        .expect("rsa hash query failed")
        .flatten();
    assert!(
        session
            .authenticate_publickey("user", PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
            .await
            .expect("SSH authentication failed")
            .success(),
        "authorized key should authenticate"
    );
    session
        .tcpip_forward("locked", 80)
        .await
        .expect("tcpip_forward failed");
    let (status, body) = http_get("127.0.0.1:18380", "locked.example.test", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "authorized");

    // An unknown key is rejected.
    let unknown = load_secret_key(data_path("tests/data/client_keys/key2"), None)
        .expect("Missing file key2");
    let client = TunnelClient { body: "unauthorized" };
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18322", client)
        .await
        .expect("Failed to connect to SSH server");
    let hash_alg = session
        .best_supported_rsa_hash()
        .await
        .expect("rsa hash query failed")
        .flatten();
    let authenticated = session
        .authenticate_publickey(
            "user",
            PrivateKeyWithHashAlg::new(Arc::new(unknown), hash_alg),
        )
        .await;
    match authenticated {
        Ok(result) => assert!(!result.success(), "unknown key must not authenticate"),
        Err(_) => {}
    }
}
