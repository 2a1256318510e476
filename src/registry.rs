use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::ServerError,
    messages::{NotifyMessage, TunnelEvent},
    subdomain::SubdomainGenerator,
};

// How long an event-bus send may block before it is dropped. Keeps accept
// loops alive when the HTTP consumer has stalled or exited.
const EVENT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
// Retries when a generated subdomain collides with an active tunnel.
const GENERATED_SUBDOMAIN_RETRIES: usize = 3;

// One active remote forwarding. Owned by the registry; the SSH connection
// and the HTTP vhost hold non-owning handles (sinks and the upstream
// address), so teardown is always driven from here.
#[derive(Debug)]
pub(crate) struct Tunnel {
    pub(crate) forwarder_key: String,
    pub(crate) peer: SocketAddr,
    pub(crate) subdomain: String,
    pub(crate) requested_port: u16,
    // Local upstream the vhost proxies into, e.g. "127.0.11.1:43581".
    pub(crate) bind_addr: String,
    pub(crate) notify_tx: mpsc::Sender<NotifyMessage>,
    pub(crate) error_tx: mpsc::Sender<ServerError>,
    // Cancelling this stops the tunnel's accept loop and closes its listener.
    pub(crate) cancellation_token: CancellationToken,
}

#[derive(Default)]
struct RegistryInner {
    // forwarder-key -> tunnel
    forwarders: HashMap<String, Arc<Tunnel>>,
    // subdomain -> forwarder-key
    subdomains: HashMap<String, String>,
}

// Process-local registry of active tunnels. Both maps are mutated under a
// single lock; event emission happens after the lock is released.
pub(crate) struct TunnelRegistry {
    inner: Mutex<RegistryInner>,
    events: mpsc::Sender<TunnelEvent>,
    generator: SubdomainGenerator,
    excluded_subdomains: HashSet<String>,
}

impl TunnelRegistry {
    pub(crate) fn new(
        events: mpsc::Sender<TunnelEvent>,
        excluded_subdomains: impl IntoIterator<Item = String>,
    ) -> Self {
        TunnelRegistry {
            inner: Mutex::default(),
            events,
            generator: SubdomainGenerator,
            excluded_subdomains: excluded_subdomains.into_iter().collect(),
        }
    }

    // Registers a tunnel under its forwarder-key, substituting a generated
    // subdomain when the client did not provide a usable one. Emits `Ready`
    // on success; failure to deliver the event is logged but does not roll
    // back the registration.
    pub(crate) async fn try_register(&self, mut tunnel: Tunnel) -> Result<Arc<Tunnel>, ServerError> {
        let registered = {
            let mut inner = self.inner.lock().expect("registry lock not poisoned");
            if inner.forwarders.contains_key(&tunnel.forwarder_key) {
                return Err(ServerError::ForwarderExists);
            }
            tunnel.subdomain = self.resolve_subdomain(&inner, &tunnel.subdomain)?;
            let registered = Arc::new(tunnel);
            inner
                .subdomains
                .insert(registered.subdomain.clone(), registered.forwarder_key.clone());
            inner
                .forwarders
                .insert(registered.forwarder_key.clone(), Arc::clone(&registered));
            registered
        };
        info!(key = %registered.forwarder_key, subdomain = %registered.subdomain, "Registered tunnel.");
        let event = TunnelEvent::Ready {
            bind_addr: registered.bind_addr.clone(),
            requested_port: registered.requested_port,
            requested_subdomain: registered.subdomain.clone(),
            notify_sink: registered.notify_tx.clone(),
            error_sink: registered.error_tx.clone(),
        };
        tokio::select! {
            result = self.events.send_timeout(event, EVENT_SEND_TIMEOUT) => {
                if result.is_err() {
                    warn!(
                        key = %registered.forwarder_key,
                        "Failed to deliver tunnel ready event; vhost will be missing until the bus drains.",
                    );
                }
            }
            _ = registered.cancellation_token.cancelled() => {
                warn!(key = %registered.forwarder_key, "Tunnel canceled while emitting ready event.");
            }
        }
        Ok(registered)
    }

    // Removes a tunnel, closing its listener by cancelling the accept loop,
    // and emits `Closed`. Safe to call more than once for the same key.
    pub(crate) async fn unregister(&self, forwarder_key: &str) -> Option<Arc<Tunnel>> {
        let tunnel = {
            let mut inner = self.inner.lock().expect("registry lock not poisoned");
            let tunnel = inner.forwarders.remove(forwarder_key)?;
            inner.subdomains.remove(&tunnel.subdomain);
            tunnel
        };
        info!(key = %forwarder_key, subdomain = %tunnel.subdomain, "Unregistered tunnel.");
        tunnel.cancellation_token.cancel();
        let event = TunnelEvent::Closed {
            bind_addr: tunnel.bind_addr.clone(),
            requested_subdomain: tunnel.subdomain.clone(),
        };
        if self
            .events
            .send_timeout(event, EVENT_SEND_TIMEOUT)
            .await
            .is_err()
        {
            warn!(key = %forwarder_key, "Failed to deliver tunnel closed event.");
        }
        Some(tunnel)
    }

    // Tears down every tunnel owned by a disconnecting SSH peer.
    pub(crate) async fn unregister_peer(&self, peer: &SocketAddr) {
        let keys: Vec<String> = {
            let inner = self.inner.lock().expect("registry lock not poisoned");
            inner
                .forwarders
                .values()
                .filter(|tunnel| tunnel.peer == *peer)
                .map(|tunnel| tunnel.forwarder_key.clone())
                .collect()
        };
        for key in keys {
            self.unregister(&key).await;
        }
    }

    pub(crate) fn lookup(&self, forwarder_key: &str) -> Option<Arc<Tunnel>> {
        self.inner
            .lock()
            .expect("registry lock not poisoned")
            .forwarders
            .get(forwarder_key)
            .cloned()
    }

    pub(crate) fn contains(&self, forwarder_key: &str) -> bool {
        self.inner
            .lock()
            .expect("registry lock not poisoned")
            .forwarders
            .contains_key(forwarder_key)
    }

    fn resolve_subdomain(
        &self,
        inner: &RegistryInner,
        requested: &str,
    ) -> Result<String, ServerError> {
        if requested.is_empty() || requested == "localhost" {
            for _ in 0..GENERATED_SUBDOMAIN_RETRIES {
                let generated = self.generator.generate();
                if !inner.subdomains.contains_key(&generated)
                    && !self.excluded_subdomains.contains(&generated)
                {
                    return Ok(generated);
                }
            }
            return Err(ServerError::SubdomainTaken);
        }
        if self.excluded_subdomains.contains(requested) {
            return Err(ServerError::InvalidSubdomain(requested.into()));
        }
        if inner.subdomains.contains_key(requested) {
            return Err(ServerError::SubdomainTaken);
        }
        Ok(requested.to_string())
    }
}
