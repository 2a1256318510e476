use std::{sync::Arc, time::Duration};

pub(crate) mod debug;
pub(crate) mod proxy;
pub(crate) mod root;
pub(crate) mod template;

use axum::Router;
use color_eyre::eyre::Context as _;
use http::Request;
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use rustls_pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use tokio::{
    net::TcpListener,
    sync::mpsc,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

use crate::{
    config::{DebugServerConfig, HttpServerConfig, TlsConfig},
    error::ServerError,
    http::proxy::{proxy_handler, ProxyContext, ProxyTarget, UpstreamScheme, VhostMap},
    messages::{NotifyMessage, TunnelEvent, TunnelUrls},
};

// Grace period for in-flight requests on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);
// How long delivery to a per-tunnel channel may block.
const NOTIFY_SEND_TIMEOUT: Duration = Duration::from_secs(5);

// The HTTP(S) front end: plain and TLS listeners, the vhost table, and the
// event-bus consumer keeping that table in sync with the SSH registry.
pub(crate) struct HttpServer {
    http_config: HttpServerConfig,
    debug_config: DebugServerConfig,
    vhosts: Arc<VhostMap>,
}

impl HttpServer {
    pub(crate) fn new(http_config: HttpServerConfig, debug_config: DebugServerConfig) -> Self {
        HttpServer {
            http_config,
            debug_config,
            vhosts: Arc::new(VhostMap::new()),
        }
    }

    pub(crate) async fn serve(
        self,
        events_rx: mpsc::Receiver<TunnelEvent>,
        root_router: Router,
        cancellation_token: CancellationToken,
    ) -> color_eyre::Result<()> {
        let listener = TcpListener::bind(self.http_config.bind_address())
            .await
            .with_context(|| "Error listening on HTTP port")?;
        info!(address = %self.http_config.bind_address(), "Listening for HTTP connections.");
        let tls_listener = if self.http_config.use_tls {
            let tls = self
                .http_config
                .tls
                .as_ref()
                .ok_or(ServerError::InvalidConfig("missing tls section".into()))?;
            let acceptor = tls_acceptor(tls)?;
            let tls_listener = TcpListener::bind(self.http_config.tls_bind_address())
                .await
                .with_context(|| "Error listening on HTTPS port")?;
            info!(address = %self.http_config.tls_bind_address(), "Listening for HTTPS connections.");
            Some((tls_listener, acceptor))
        } else {
            None
        };
        if self.debug_config.enabled {
            let debug_listener = TcpListener::bind(self.debug_config.bind_address())
                .await
                .with_context(|| "Error listening on debug port")?;
            info!(address = %self.debug_config.bind_address(), "Listening for debug connections.");
            let router = debug::debug_router(Arc::clone(&self.vhosts));
            let token = cancellation_token.clone();
            tokio::spawn(async move {
                if let Err(error) = axum::serve(debug_listener, router)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await
                {
                    warn!(%error, "Debug server failed.");
                }
            });
        }

        let context = Arc::new(ProxyContext {
            domain_name: self.http_config.domain_name.clone(),
            root_router,
        });
        tokio::spawn(consume_events(
            Arc::clone(&self.vhosts),
            self.http_config.clone(),
            events_rx,
            cancellation_token.clone(),
        ));

        let tracker = TaskTracker::new();
        let mut accept_tasks = Vec::new();
        accept_tasks.push(tokio::spawn(accept_loop(
            listener,
            None,
            Arc::clone(&self.vhosts),
            Arc::clone(&context),
            tracker.clone(),
            cancellation_token.clone(),
        )));
        if let Some((tls_listener, acceptor)) = tls_listener {
            accept_tasks.push(tokio::spawn(accept_loop(
                tls_listener,
                Some(acceptor),
                Arc::clone(&self.vhosts),
                Arc::clone(&context),
                tracker.clone(),
                cancellation_token.clone(),
            )));
        }
        for task in accept_tasks {
            let _ = task.await;
        }
        // Listeners are closed; give in-flight requests a grace period.
        tracker.close();
        if timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
            warn!("Shutdown grace period expired with requests still in flight.");
        }
        info!("HTTP server stopped.");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    vhosts: Arc<VhostMap>,
    context: Arc<ProxyContext>,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            conn = listener.accept() => {
                let (stream, address) = match conn {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "Failed to accept HTTP connection.");
                        continue;
                    }
                };
                let vhosts = Arc::clone(&vhosts);
                let context = Arc::clone(&context);
                let acceptor = acceptor.clone();
                tracker.spawn(async move {
                    let service = service_fn(move |request: Request<Incoming>| {
                        proxy_handler(request, address, Arc::clone(&vhosts), Arc::clone(&context))
                    });
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                let _ = hyper::server::conn::http1::Builder::new()
                                    .serve_connection(TokioIo::new(tls_stream), service)
                                    .with_upgrades()
                                    .await;
                            }
                            Err(error) => {
                                warn!(%error, %address, "TLS handshake failed.");
                            }
                        },
                        None => {
                            let _ = hyper::server::conn::http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .with_upgrades()
                                .await;
                        }
                    }
                });
            }
        }
    }
}

fn tls_acceptor(tls: &TlsConfig) -> color_eyre::Result<TlsAcceptor> {
    let certs = CertificateDer::pem_file_iter(&tls.certificate)
        .with_context(|| "Error reading TLS certificate")?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| "Error parsing TLS certificate")?;
    let key =
        PrivateKeyDer::from_pem_file(&tls.key).with_context(|| "Error reading TLS key")?;
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .with_context(|| "Error building TLS configuration")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

// Sole writer of the vhost table. Tunnel events arrive from the SSH side;
// registration failures are reported back on the tunnel's error stream.
pub(crate) async fn consume_events(
    vhosts: Arc<VhostMap>,
    config: HttpServerConfig,
    mut events_rx: mpsc::Receiver<TunnelEvent>,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    TunnelEvent::Ready {
                        bind_addr,
                        requested_port,
                        requested_subdomain,
                        notify_sink,
                        error_sink,
                    } => {
                        if let Err(error) = register_tunnel(
                            &vhosts,
                            &config,
                            bind_addr,
                            requested_port,
                            &requested_subdomain,
                            notify_sink,
                        )
                        .await
                        {
                            warn!(%error, subdomain = %requested_subdomain, "Failed to register tunnel.");
                            if error_sink
                                .send_timeout(error, NOTIFY_SEND_TIMEOUT)
                                .await
                                .is_err()
                            {
                                warn!(subdomain = %requested_subdomain, "Failed to deliver registration error.");
                            }
                        }
                    }
                    TunnelEvent::Closed {
                        requested_subdomain,
                        ..
                    } => {
                        let fqdn = format!("{requested_subdomain}.{}", config.domain_name);
                        if vhosts.remove(&fqdn).is_some() {
                            info!(%fqdn, "Unregistered vhost.");
                        }
                    }
                }
            }
        }
    }
}

async fn register_tunnel(
    vhosts: &VhostMap,
    config: &HttpServerConfig,
    bind_addr: String,
    requested_port: u16,
    subdomain: &str,
    notify_sink: mpsc::Sender<NotifyMessage>,
) -> Result<(), ServerError> {
    if subdomain.contains('.') {
        return Err(ServerError::InvalidSubdomain(subdomain.into()));
    }
    let fqdn = format!("{subdomain}.{}", config.domain_name);
    if vhosts.contains_key(&fqdn) {
        return Err(ServerError::SubdomainTaken);
    }
    // Publish the URLs before installing the vhost, so the first message on
    // the client's terminal is always the banner.
    let urls = tunnel_urls(config, subdomain);
    if notify_sink
        .send_timeout(NotifyMessage::Url(urls), NOTIFY_SEND_TIMEOUT)
        .await
        .is_err()
    {
        warn!(%fqdn, "Failed to deliver URL notification.");
    }
    info!(%fqdn, upstream = %bind_addr, "Registered vhost.");
    vhosts.insert(
        fqdn,
        Arc::new(ProxyTarget {
            scheme: UpstreamScheme::from_port(requested_port),
            upstream: bind_addr,
            subdomain: subdomain.to_string(),
            notify_tx: notify_sink,
        }),
    );
    Ok(())
}

// User-visible URLs for a tunnel; explicit ports are omitted when they are
// the default for the scheme.
pub(crate) fn tunnel_urls(config: &HttpServerConfig, subdomain: &str) -> TunnelUrls {
    let fqdn = format!("{subdomain}.{}", config.domain_name);
    let http = if config.bind_port == 80 {
        format!("http://{fqdn}")
    } else {
        format!("http://{fqdn}:{}", config.bind_port)
    };
    let https = if config.use_tls {
        if config.tls_bind_port == 443 {
            format!("https://{fqdn}")
        } else {
            format!("https://{fqdn}:{}", config.tls_bind_port)
        }
    } else {
        String::new()
    };
    TunnelUrls { http, https }
}
