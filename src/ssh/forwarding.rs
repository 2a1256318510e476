use std::{net::SocketAddr, sync::Arc};

use russh::server::Handle;
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::ServerError,
    messages::NotifyMessage,
    registry::Tunnel,
    LocalshowServer,
};

// Local address tunneled listeners bind to. Port 0: the kernel picks an
// ephemeral port, while the client is told it got the port it asked for.
const TUNNEL_BIND_ADDR: &str = "127.0.11.1:0";

pub(crate) struct RemoteForwardingContext<'a> {
    pub(crate) server: &'a Arc<LocalshowServer>,
    pub(crate) peer: &'a SocketAddr,
    pub(crate) notify_tx: &'a mpsc::Sender<NotifyMessage>,
    pub(crate) error_tx: &'a mpsc::Sender<ServerError>,
    pub(crate) cancellation_token: &'a CancellationToken,
}

// One `tcpip-forward` request from one SSH peer.
pub(crate) fn forwarder_key(peer: &SocketAddr, address: &str, port: u32) -> String {
    format!("{peer}:{address}:{port}")
}

// Handles a `tcpip-forward` request: allocate a local listener, register
// the tunnel, and start accepting connections for it. Returns the reply
// for the global request.
pub(crate) async fn open_remote_forward(
    context: &RemoteForwardingContext<'_>,
    address: &str,
    port: u32,
    handle: Handle,
) -> Result<bool, russh::Error> {
    if port != 80 && port != 443 {
        // Only HTTP and HTTPS forwardings are supported.
        let _ = context.error_tx.try_send(ServerError::UnsupportedPort(port));
        return Ok(false);
    }
    let key = forwarder_key(context.peer, address, port);
    if context.server.registry.contains(&key) {
        // Already forwarding this address:port pair for the same client.
        info!(%key, "Rejecting duplicate forwarding request.");
        return Ok(false);
    }
    let listener = match TcpListener::bind(TUNNEL_BIND_ADDR).await {
        Ok(listener) => listener,
        Err(error) => {
            warn!(%error, "Failed to bind tunnel listener.");
            return Ok(false);
        }
    };
    let local_port = match listener.local_addr() {
        Ok(local_addr) => local_addr.port(),
        Err(error) => {
            warn!(%error, "Failed to read tunnel listener address.");
            return Ok(false);
        }
    };
    let tunnel = Tunnel {
        forwarder_key: key.clone(),
        peer: *context.peer,
        subdomain: address.to_string(),
        requested_port: port as u16,
        bind_addr: format!("127.0.11.1:{local_port}"),
        notify_tx: context.notify_tx.clone(),
        error_tx: context.error_tx.clone(),
        cancellation_token: context.cancellation_token.child_token(),
    };
    let registered = match context.server.registry.try_register(tunnel).await {
        Ok(registered) => registered,
        Err(error) => {
            warn!(%key, %error, "Failed to register forwarder.");
            let _ = context.error_tx.try_send(error);
            return Ok(false);
        }
    };
    info!(%key, bind_addr = %registered.bind_addr, "Listening on local address.");
    let server = Arc::clone(context.server);
    tokio::spawn(serve_tunnel(
        server,
        registered,
        listener,
        handle,
        address.to_string(),
        port,
    ));
    Ok(true)
}

// Handles `cancel-tcpip-forward`. The reply is positive whether or not the
// forwarding was known; cancelling twice is not an error.
pub(crate) async fn cancel_remote_forward(
    server: &Arc<LocalshowServer>,
    peer: &SocketAddr,
    address: &str,
    port: u32,
) -> bool {
    let key = forwarder_key(peer, address, port);
    if server.registry.lookup(&key).is_some() {
        server.registry.unregister(&key).await;
    }
    true
}

// Accept loop for one tunnel. Exits when the tunnel is cancelled (via
// cancel-tcpip-forward, connection teardown, or shutdown) or the listener
// fails; every exit path unregisters the forwarder.
async fn serve_tunnel(
    server: Arc<LocalshowServer>,
    tunnel: Arc<Tunnel>,
    listener: TcpListener,
    handle: Handle,
    address: String,
    port: u32,
) {
    loop {
        tokio::select! {
            _ = tunnel.cancellation_token.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, origin)) => {
                        debug!(%origin, subdomain = %tunnel.subdomain, "Accepted tunnel connection.");
                        bridge_connection(
                            stream,
                            origin,
                            handle.clone(),
                            address.clone(),
                            port,
                            tunnel.cancellation_token.clone(),
                        );
                    }
                    Err(error) => {
                        warn!(%error, subdomain = %tunnel.subdomain, "Failed to accept on tunnel listener.");
                        break;
                    }
                }
            }
        }
    }
    server.registry.unregister(&tunnel.forwarder_key).await;
}

// Opens a `forwarded-tcpip` channel for one accepted connection and copies
// bytes both ways. The reported destination port is the requested one, not
// the ephemeral port actually bound.
fn bridge_connection(
    mut stream: TcpStream,
    origin: SocketAddr,
    handle: Handle,
    address: String,
    port: u32,
    cancellation_token: CancellationToken,
) {
    tokio::spawn(async move {
        let channel = match handle
            .channel_open_forwarded_tcpip(
                address,
                port,
                origin.ip().to_string(),
                u32::from(origin.port()),
            )
            .await
        {
            Ok(channel) => channel,
            Err(error) => {
                // The tunnel stays up; only this connection is dropped.
                info!(%error, %origin, "Failed to open forwarded-tcpip channel.");
                return;
            }
        };
        let mut channel_stream = channel.into_stream();
        tokio::select! {
            _ = cancellation_token.cancelled() => {}
            _ = copy_bidirectional(&mut stream, &mut channel_stream) => {}
        }
    });
}
