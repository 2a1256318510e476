#![allow(dead_code)]

use std::{convert::Infallible, path::PathBuf, time::Duration};

use bytes::Bytes;
use http::{header::HOST, Request, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::{body::Incoming, service::service_fn, Response};
use hyper_util::rt::TokioIo;
use localshow::{
    config::{DebugServerConfig, HttpServerConfig, SshServerConfig, TlsConfig},
    Config,
};
use russh::{
    client::{self, Msg, Session},
    Channel, ChannelMsg,
};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

pub struct ServerHandle(pub tokio::task::JoinHandle<color_eyre::Result<()>>);

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub fn data_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(relative)
}

pub fn test_config(ssh_port: u16, http_port: u16, disable_auth: bool) -> Config {
    Config {
        ssh_server: SshServerConfig {
            bind_address: "127.0.0.1".into(),
            bind_port: ssh_port,
            host_key_path: data_path("tests/data/server_keys/ssh"),
            authorized_keys_path: Some(data_path("tests/data/authorized_keys")),
            disable_auth,
        },
        http_server: HttpServerConfig {
            bind_address: "127.0.0.1".into(),
            bind_port: http_port,
            domain_name: "example.test".into(),
            excluded_subdomains: Vec::new(),
            use_tls: false,
            tls_bind_port: 0,
            tls: None,
        },
        debug_server: DebugServerConfig::default(),
        database: None,
    }
}

pub fn with_tls(mut config: Config, tls_port: u16) -> Config {
    config.http_server.use_tls = true;
    config.http_server.tls_bind_port = tls_port;
    config.http_server.tls = Some(TlsConfig {
        certificate: data_path("tests/data/certificates/cert.pem"),
        key: data_path("tests/data/certificates/key.pem"),
    });
    config
}

pub async fn wait_for_port(address: &str) {
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect(address).await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for localshow to start on {address}.");
    }
}

// SSH client that answers every forwarded-tcpip channel with a one-route
// HTTP server returning a fixed body.
pub struct TunnelClient {
    pub body: &'static str,
}

impl client::Handler for TunnelClient {
    type Error = color_eyre::eyre::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let body = self.body;
        let service = service_fn(move |_request: Request<Incoming>| async move {
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
        });
        tokio::spawn(async move {
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(channel.into_stream()), service)
                .await;
        });
        Ok(())
    }
}

// Reads channel data until `expected` shows up in the collected output.
pub async fn read_until(channel: &mut Channel<Msg>, expected: &str) -> String {
    let mut collected = String::new();
    let result = timeout(Duration::from_secs(5), async {
        while let Some(message) = channel.wait().await {
            if let ChannelMsg::Data { data } = message {
                collected.push_str(&String::from_utf8_lossy(&data));
                if collected.contains(expected) {
                    return;
                }
            }
        }
    })
    .await;
    if result.is_err() {
        panic!("Timeout waiting for {expected:?}; got {collected:?}");
    }
    collected
}

// One HTTP/1.1 request against the gateway with an explicit Host header.
pub async fn http_get(address: &str, host: &str, path: &str) -> (StatusCode, String) {
    let stream = TcpStream::connect(address)
        .await
        .expect("TCP connection failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("HTTP handshake failed");
    let driver = tokio::spawn(async move {
        let _ = conn.await;
    });
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .header(HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = timeout(Duration::from_secs(5), sender.send_request(request))
        .await
        .expect("Timeout waiting for HTTP response")
        .expect("Error sending HTTP request");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Error collecting response body")
        .to_bytes();
    driver.abort();
    (status, String::from_utf8_lossy(&body).into_owned())
}
