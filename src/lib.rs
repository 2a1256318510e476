use std::sync::Arc;

use color_eyre::eyre::Context;
use tokio::{net::TcpListener, pin, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod config;
mod droppable_handle;
pub mod error;
mod http;
mod message_handler;
pub mod messages;
mod registry;
mod ssh;
pub mod stats;
mod subdomain;

pub use config::Config;

use crate::{
    error::ServerError, messages::EVENT_BUS_CAPACITY, registry::TunnelRegistry,
    ssh::auth::Authenticator, stats::StatsDb,
};

// Services shared by every SSH connection handler.
pub(crate) struct LocalshowServer {
    pub(crate) registry: Arc<TunnelRegistry>,
    pub(crate) authenticator: Authenticator,
    pub(crate) stats: Option<Arc<StatsDb>>,
    pub(crate) tls_enabled: bool,
}

/// Runs the SSH and HTTP servers until SIGINT/SIGTERM. The configuration
/// must already be validated.
pub async fn entrypoint(config: Config) -> color_eyre::Result<()> {
    info!("Starting localshow...");
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let host_key = ssh::keys::load_or_generate_host_key(&config.ssh_server.host_key_path).await?;
    let authenticator = if config.ssh_server.disable_auth {
        Authenticator::AcceptAll
    } else {
        let path = config.ssh_server.authorized_keys_path.as_ref().ok_or(
            ServerError::InvalidConfig(
                "authorized keys path is required when auth is enabled".into(),
            ),
        )?;
        Authenticator::from_authorized_keys(path).await?
    };
    let stats = match config.database.as_ref() {
        Some(database) => {
            if database.geoip_db_file.is_some() {
                warn!("GeoIP enrichment is not supported; ignoring geoip_db_file.");
            }
            Some(Arc::new(StatsDb::connect(database).await?))
        }
        None => None,
    };

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUS_CAPACITY);
    let registry = Arc::new(TunnelRegistry::new(
        events_tx,
        config.http_server.excluded_subdomains.clone(),
    ));
    let server = Arc::new(LocalshowServer {
        registry,
        authenticator,
        stats: stats.clone(),
        tls_enabled: config.http_server.use_tls,
    });
    let cancellation_token = CancellationToken::new();

    let root_router = http::root::root_router(&config.http_server.domain_name, stats);
    let http_server = http::HttpServer::new(
        config.http_server.clone(),
        config.debug_server.clone(),
    );
    let http_token = cancellation_token.clone();
    let mut http_join =
        tokio::spawn(async move { http_server.serve(events_rx, root_router, http_token).await });

    let ssh_listener = TcpListener::bind(config.ssh_server.bind_address())
        .await
        .with_context(|| "Error listening on SSH port")?;
    info!(address = %config.ssh_server.bind_address(), "Listening for SSH connections.");
    let ssh_config = Arc::new(ssh::server_config(host_key));
    let mut ssh_join = tokio::spawn(ssh::serve(
        ssh_listener,
        ssh_config,
        server,
        cancellation_token.clone(),
    ));
    info!("localshow is now running.");

    let signal_handler = wait_for_signal();
    pin!(signal_handler);
    tokio::select! {
        _ = &mut signal_handler => {
            info!("Received termination signal.");
        }
        result = &mut http_join => {
            cancellation_token.cancel();
            let _ = ssh_join.await;
            return result.with_context(|| "HTTP server task failed")?;
        }
        _ = &mut ssh_join => {
            cancellation_token.cancel();
            let _ = http_join.await;
            return Ok(());
        }
    }
    info!("localshow is shutting down.");
    cancellation_token.cancel();
    let _ = ssh_join.await;
    http_join
        .await
        .with_context(|| "HTTP server task failed")??;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut signal_terminate = signal(SignalKind::terminate()).expect("signal handler installs");
    let mut signal_interrupt = signal(SignalKind::interrupt()).expect("signal handler installs");

    tokio::select! {
        _ = signal_terminate.recv() => info!("Received SIGTERM."),
        _ = signal_interrupt.recv() => info!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c().expect("signal handler installs");
    let mut signal_break = windows::ctrl_break().expect("signal handler installs");

    tokio::select! {
        _ = signal_c.recv() => info!("Received CTRL_C."),
        _ = signal_break.recv() => info!("Received CTRL_BREAK."),
    };
}
