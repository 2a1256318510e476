use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ServerError;

// Capacity of the tunnel event bus between the SSH and HTTP servers.
pub(crate) const EVENT_BUS_CAPACITY: usize = 100;
// Capacity of the per-connection notification channel.
pub(crate) const NOTIFY_CHANNEL_CAPACITY: usize = 10;

/// The public URLs minted for a tunnel. In JSON framing this is serialized
/// verbatim; `https` stays empty when TLS is not configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TunnelUrls {
    pub http: String,
    pub https: String,
}

/// Out-of-band message delivered to a client's session terminal.
#[derive(Debug, Clone)]
pub enum NotifyMessage {
    /// Published once, when the tunnel's vhost comes up.
    Url(TunnelUrls),
    /// One access log line per proxied HTTP request.
    Log(Vec<u8>),
    /// Uninterpreted payload, forwarded as-is.
    Raw(Vec<u8>),
}

/// Tunnel lifecycle event, emitted by the SSH registry and consumed by the
/// HTTP front end. `Closed` for a tunnel always follows its `Ready`.
#[derive(Debug)]
pub enum TunnelEvent {
    Ready {
        bind_addr: String,
        requested_port: u16,
        requested_subdomain: String,
        notify_sink: mpsc::Sender<NotifyMessage>,
        error_sink: mpsc::Sender<ServerError>,
    },
    Closed {
        bind_addr: String,
        requested_subdomain: String,
    },
}
