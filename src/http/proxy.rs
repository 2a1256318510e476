use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, OnceLock},
    time::Instant,
};

use axum::{
    body::Body,
    response::{Html, IntoResponse},
    Router,
};
use bytes::Bytes;
use dashmap::DashMap;
use http::{
    header::{HOST, ORIGIN, UPGRADE, USER_AGENT},
    Request, Response, StatusCode, Uri,
};
use hyper_util::rt::TokioIo;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use tokio::{
    io::{copy_bidirectional, AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};
use tokio_rustls::TlsConnector;
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::{error::ServerError, http::template::bad_gateway_html, messages::NotifyMessage};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpstreamScheme {
    Http,
    Https,
}

impl UpstreamScheme {
    pub(crate) fn from_port(port: u16) -> Self {
        if port == 443 {
            UpstreamScheme::Https
        } else {
            UpstreamScheme::Http
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Https => "https",
        }
    }
}

// One registered virtual host, pointing at a tunnel's local upstream.
pub(crate) struct ProxyTarget {
    pub(crate) scheme: UpstreamScheme,
    // Authority form of the tunnel's local listener, e.g. "127.0.11.1:43581".
    pub(crate) upstream: String,
    pub(crate) subdomain: String,
    pub(crate) notify_tx: mpsc::Sender<NotifyMessage>,
}

pub(crate) type VhostMap = DashMap<String, Arc<ProxyTarget>>;

pub(crate) struct ProxyContext {
    pub(crate) domain_name: String,
    pub(crate) root_router: Router,
}

// Dispatches one request: the apex domain goes to the built-in router,
// anything else is matched against the vhost table and reverse-proxied
// into the tunnel's local upstream.
pub(crate) async fn proxy_handler<B>(
    mut request: Request<B>,
    peer: SocketAddr,
    vhosts: Arc<VhostMap>,
    context: Arc<ProxyContext>,
) -> Result<Response<Body>, ServerError>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let timer = Instant::now();
    let host = request
        .headers()
        .get(HOST)
        .ok_or(ServerError::MissingHostHeader)?
        .to_str()
        .map_err(|_| ServerError::InvalidHostHeader)?
        .split(':')
        .next()
        .ok_or(ServerError::InvalidHostHeader)?
        .to_owned();
    if host == context.domain_name {
        let Ok(response) = context
            .root_router
            .clone()
            .oneshot(request.map(Body::new))
            .await
        else {
            unreachable!("axum routers are infallible");
        };
        return Ok(response);
    }
    let Some(target) = vhosts.get(&host).map(|entry| Arc::clone(entry.value())) else {
        return Ok(bad_gateway_response(&host));
    };

    request.headers_mut().insert(
        X_FORWARDED_FOR,
        peer.ip()
            .to_string()
            .parse()
            .expect("IP addresses are valid header values"),
    );
    request.headers_mut().insert(
        X_FORWARDED_HOST,
        host.parse()
            .expect("validated host is a valid header value"),
    );
    // The upstream sees its own authority in Host, and in Origin when the
    // request was same-origin against the public hostname.
    request.headers_mut().insert(
        HOST,
        target
            .upstream
            .parse()
            .expect("bind addresses are valid header values"),
    );
    let origin = request
        .headers()
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    if let Some(origin) = origin {
        if let Ok(uri) = origin.parse::<Uri>() {
            if uri.host() == Some(host.as_str()) {
                let rewritten = format!("{}://{}", target.scheme.as_str(), target.upstream);
                if let Ok(value) = rewritten.parse() {
                    request.headers_mut().insert(ORIGIN, value);
                }
            }
        }
    }

    log_request(&request, peer, timer, &target);

    let io = match open_upstream(target.scheme, &target.upstream).await {
        Ok(io) => io,
        Err(error) => {
            let error = ServerError::UpstreamUnavailable(error.to_string());
            warn!(%error, upstream = %target.upstream, "Upstream unavailable.");
            return Ok(bad_gateway_response(&host));
        }
    };
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(io)).await {
        Ok(pair) => pair,
        Err(error) => {
            warn!(%error, upstream = %target.upstream, "Upstream handshake failed.");
            return Ok(bad_gateway_response(&host));
        }
    };

    match request.headers().get(UPGRADE).cloned() {
        None => {
            tokio::spawn(async move {
                if let Err(error) = conn.await {
                    debug!(%error, "Upstream connection failed.");
                }
            });
            match sender.send_request(request).await {
                Ok(response) => Ok(response.into_response()),
                Err(error) => {
                    warn!(%error, "Upstream request failed.");
                    Ok(bad_gateway_response(&host))
                }
            }
        }
        // Upgrades (e.g. websockets) switch to a raw bidirectional copy
        // once both sides agree on the protocol.
        Some(requested_protocol) => {
            tokio::spawn(async move {
                if let Err(error) = conn.with_upgrades().await {
                    debug!(%error, "Upstream connection failed.");
                }
            });
            let upgraded_request = hyper::upgrade::on(&mut request);
            let mut response = match sender.send_request(request).await {
                Ok(response) => response,
                Err(error) => {
                    warn!(%error, "Upstream request failed.");
                    return Ok(bad_gateway_response(&host));
                }
            };
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                let protocol_matches = response
                    .headers()
                    .get(UPGRADE)
                    .ok_or(ServerError::MissingUpgradeHeader)?
                    == &requested_protocol;
                if protocol_matches {
                    let upgraded_response = hyper::upgrade::on(&mut response);
                    tokio::spawn(async move {
                        let Ok(request_io) = upgraded_request.await else {
                            return;
                        };
                        let Ok(response_io) = upgraded_response.await else {
                            return;
                        };
                        let mut request_io = TokioIo::new(request_io);
                        let mut response_io = TokioIo::new(response_io);
                        let _ = copy_bidirectional(&mut response_io, &mut request_io).await;
                    });
                }
            }
            Ok(response.into_response())
        }
    }
}

fn bad_gateway_response(host: &str) -> Response<Body> {
    (StatusCode::BAD_GATEWAY, Html(bad_gateway_html(host))).into_response()
}

// Emits one access-log line through the tunnel's notify sink. The proxy
// path must never block on a slow consumer: a full channel drops the line.
fn log_request<B>(request: &Request<B>, peer: SocketAddr, timer: Instant, target: &ProxyTarget) {
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-");
    let line = format!(
        "{} - - {} \"{} {} {:?}\" {} {}us",
        peer,
        chrono::Utc::now().format("%d/%b/%Y:%H:%M:%S %z"),
        request.method(),
        request.uri().path(),
        request.version(),
        user_agent,
        timer.elapsed().as_micros(),
    );
    if target
        .notify_tx
        .try_send(NotifyMessage::Log(line.into_bytes()))
        .is_err()
    {
        debug!(subdomain = %target.subdomain, "Dropped access log entry.");
    }
}

trait UpstreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpstreamIo for T {}

async fn open_upstream(
    scheme: UpstreamScheme,
    authority: &str,
) -> std::io::Result<Box<dyn UpstreamIo>> {
    let stream = TcpStream::connect(authority).await?;
    match scheme {
        UpstreamScheme::Http => Ok(Box::new(stream)),
        UpstreamScheme::Https => {
            let connector = TlsConnector::from(insecure_client_config());
            let server_name = server_name_for(authority)?;
            let tls_stream = connector.connect(server_name, stream).await?;
            Ok(Box::new(tls_stream))
        }
    }
}

fn server_name_for(authority: &str) -> std::io::Result<ServerName<'static>> {
    let host = authority.split(':').next().unwrap_or(authority);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_owned())
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidInput, error))
}

// The hop to the upstream runs inside an authenticated SSH channel, so
// x.509 validity of its (usually self-signed) certificate proves nothing.
fn insecure_client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    Arc::clone(CONFIG.get_or_init(|| {
        let mut config = ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
        Arc::new(config)
    }))
}

#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod proxy_handler_tests {
    use std::{convert::Infallible, sync::Arc};

    use bytes::Bytes;
    use http::{header::HOST, Request, Response, StatusCode};
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::{body::Incoming, service::service_fn};
    use hyper_util::rt::TokioIo;
    use tokio::{net::TcpListener, sync::mpsc};

    use crate::{
        error::ServerError,
        http::root::root_router,
        messages::{NotifyMessage, NOTIFY_CHANNEL_CAPACITY},
    };

    use super::{proxy_handler, ProxyContext, ProxyTarget, UpstreamScheme, VhostMap};

    fn context() -> Arc<ProxyContext> {
        Arc::new(ProxyContext {
            domain_name: "example.test".into(),
            root_router: root_router("example.test", None),
        })
    }

    #[tokio::test]
    async fn errors_on_missing_host_header() {
        let vhosts = Arc::new(VhostMap::new());
        let request = Request::builder()
            .method("GET")
            .uri("/index.html")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = proxy_handler(
            request,
            "127.0.0.1:12345".parse().unwrap(),
            vhosts,
            context(),
        )
        .await;
        assert_eq!(response.unwrap_err(), ServerError::MissingHostHeader);
    }

    #[tokio::test]
    async fn returns_bad_gateway_for_unknown_host() {
        let vhosts = Arc::new(VhostMap::new());
        let request = Request::builder()
            .method("GET")
            .uri("/index.html")
            .header(HOST, "baz.example.test")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = proxy_handler(
            request,
            "127.0.0.1:12345".parse().unwrap(),
            vhosts,
            context(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("baz.example.test"));
    }

    #[tokio::test]
    async fn dispatches_apex_domain_to_root_router() {
        let vhosts = Arc::new(VhostMap::new());
        let request = Request::builder()
            .method("GET")
            .uri("/")
            .header(HOST, "example.test:8080")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = proxy_handler(
            request,
            "127.0.0.1:12345".parse().unwrap(),
            vhosts,
            context(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn proxies_to_registered_upstream_and_logs() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(|request: Request<Incoming>| async move {
                // The Host header must carry the upstream authority.
                let host = request.headers().get(HOST).unwrap().to_str().unwrap();
                assert!(host.starts_with("127.0.0.1:"));
                assert!(request.headers().contains_key("x-forwarded-for"));
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("hello from upstream"))))
            });
            hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
                .unwrap();
        });
        let (notify_tx, mut notify_rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let vhosts = Arc::new(VhostMap::new());
        vhosts.insert(
            "foo.example.test".into(),
            Arc::new(ProxyTarget {
                scheme: UpstreamScheme::Http,
                upstream,
                subdomain: "foo".into(),
                notify_tx,
            }),
        );
        let request = Request::builder()
            .method("GET")
            .uri("/greeting")
            .header(HOST, "foo.example.test")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = proxy_handler(
            request,
            "127.0.0.1:12345".parse().unwrap(),
            vhosts,
            context(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello from upstream");
        match notify_rx.recv().await.unwrap() {
            NotifyMessage::Log(line) => {
                let line = String::from_utf8(line).unwrap();
                assert!(line.contains("GET /greeting"));
            }
            message => panic!("unexpected message {message:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway_not_an_error() {
        let (notify_tx, _notify_rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let vhosts = Arc::new(VhostMap::new());
        // A port nothing listens on.
        vhosts.insert(
            "down.example.test".into(),
            Arc::new(ProxyTarget {
                scheme: UpstreamScheme::Http,
                upstream: "127.0.0.1:1".into(),
                subdomain: "down".into(),
                notify_tx,
            }),
        );
        let request = Request::builder()
            .method("GET")
            .uri("/")
            .header(HOST, "down.example.test")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = proxy_handler(
            request,
            "127.0.0.1:12345".parse().unwrap(),
            vhosts,
            context(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn scheme_follows_requested_port() {
        assert_eq!(UpstreamScheme::from_port(80), UpstreamScheme::Http);
        assert_eq!(UpstreamScheme::from_port(443), UpstreamScheme::Https);
    }
}
