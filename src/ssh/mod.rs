use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

pub(crate) mod auth;
pub(crate) mod forwarding;
pub(crate) mod keys;

use russh::{
    keys::{ssh_key::Fingerprint, HashAlg, PrivateKey, PublicKey},
    server::{Auth, Handler, Msg, Session},
    Channel, ChannelId, MethodKind, MethodSet,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedSender},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    droppable_handle::DroppableHandle,
    error::ServerError,
    message_handler::{MessageFormat, MessageHandler},
    messages::{NotifyMessage, NOTIFY_CHANNEL_CAPACITY},
    ssh::forwarding::RemoteForwardingContext,
    LocalshowServer,
};

// Accepted connections wait here until the supervisor picks them up.
const CONNECTION_QUEUE_CAPACITY: usize = 10;

// Sender half of a session terminal; messages are written to the client's
// session channel by a dedicated task.
#[derive(Debug, Clone)]
pub(crate) struct ServerHandlerSender(pub(crate) Option<UnboundedSender<Vec<u8>>>);

impl ServerHandlerSender {
    pub(crate) fn send(&self, message: Vec<u8>) -> Result<(), std::io::Error> {
        if let Some(sender) = self.0.as_ref() {
            sender
                .send(message)
                .map_err(|error| std::io::Error::new(std::io::ErrorKind::BrokenPipe, error))?;
        }
        Ok(())
    }
}

pub(crate) fn server_config(key: PrivateKey) -> russh::server::Config {
    russh::server::Config {
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keepalive_interval: Some(Duration::from_secs(15)),
        keepalive_max: 4,
        keys: vec![key],
        ..Default::default()
    }
}

// Runs the SSH listener until shutdown. Accepted connections go through a
// bounded queue drained by a supervisor task, which hands each one to its
// own connection handler.
pub(crate) async fn serve(
    listener: TcpListener,
    config: Arc<russh::server::Config>,
    server: Arc<LocalshowServer>,
    cancellation_token: CancellationToken,
) {
    let (queue_tx, mut queue_rx) = mpsc::channel::<(TcpStream, SocketAddr)>(CONNECTION_QUEUE_CAPACITY);
    let supervisor_token = cancellation_token.clone();
    let supervisor = tokio::spawn(async move {
        while let Some((stream, address)) = queue_rx.recv().await {
            handle_connection(stream, address, Arc::clone(&config), &server, &supervisor_token);
        }
    });
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            conn = listener.accept() => {
                match conn {
                    Ok((stream, address)) => {
                        debug!(%address, "Accepted SSH connection.");
                        if queue_tx.send((stream, address)).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "Failed to accept incoming SSH connection.");
                        continue;
                    }
                }
            }
        }
    }
    drop(queue_tx);
    let _ = supervisor.await;
    info!("SSH server stopped.");
}

fn handle_connection(
    stream: TcpStream,
    address: SocketAddr,
    config: Arc<russh::server::Config>,
    server: &Arc<LocalshowServer>,
    parent_token: &CancellationToken,
) {
    let cancellation_token = parent_token.child_token();
    let handler = ServerHandler::new(address, cancellation_token.clone(), Arc::clone(server));
    tokio::spawn(async move {
        let mut session = match russh::server::run_stream(config, stream, handler).await {
            Ok(session) => session,
            Err(error) => {
                warn!(%error, %address, "SSH handshake failed.");
                return;
            }
        };
        info!(%address, "New SSH connection.");
        tokio::select! {
            result = &mut session => {
                if let Err(error) = result {
                    warn!(%error, %address, "Connection closed.");
                }
            }
            _ = cancellation_token.cancelled() => {
                info!(%address, "Disconnecting client...");
                let _ = session
                    .handle()
                    .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                    .await;
            }
        }
    });
}

// A line-reading terminal attached to one session channel.
struct SessionTerminal {
    consumer_id: String,
    tx: ServerHandlerSender,
    line: Vec<u8>,
    prompt: &'static str,
    _writer: DroppableHandle<()>,
}

// Per-connection SSH state. Session channels are only a notification and
// command surface; no shell is ever executed.
pub(crate) struct ServerHandler {
    peer: SocketAddr,
    user: Option<String>,
    key_fingerprint: Option<Fingerprint>,
    cancellation_token: CancellationToken,
    server: Arc<LocalshowServer>,
    notify_tx: mpsc::Sender<NotifyMessage>,
    notify_rx: Option<mpsc::Receiver<NotifyMessage>>,
    error_tx: mpsc::Sender<ServerError>,
    error_rx: Option<mpsc::Receiver<ServerError>>,
    message_handler: Option<Arc<MessageHandler>>,
    terminals: HashMap<ChannelId, SessionTerminal>,
}

impl ServerHandler {
    fn new(
        peer: SocketAddr,
        cancellation_token: CancellationToken,
        server: Arc<LocalshowServer>,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(1);
        ServerHandler {
            peer,
            user: None,
            key_fingerprint: None,
            cancellation_token,
            server,
            notify_tx,
            notify_rx: Some(notify_rx),
            error_tx,
            error_rx: Some(error_rx),
            message_handler: None,
            terminals: HashMap::new(),
        }
    }

    fn prompt(&self) -> &'static str {
        match self.user.as_deref() {
            Some("api") => "",
            _ => "> ",
        }
    }

    fn close_terminal(&mut self, channel: ChannelId) {
        if let Some(terminal) = self.terminals.remove(&channel) {
            if let Some(handler) = self.message_handler.as_ref() {
                handler.unregister(&terminal.consumer_id);
            }
            // The terminal going away takes the whole connection with it.
            self.cancellation_token.cancel();
        }
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.server.authenticator.accepts_anyone() {
            self.user = Some(user.into());
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.server.authenticator.accepts_anyone() {
            self.user = Some(user.into());
            return Ok(Auth::Accept);
        }
        // Password logins are never valid; feed the attempt to the
        // brute-force recorder when one is configured.
        if let Some(stats) = self.server.stats.as_ref() {
            if let Err(error) = stats
                .register_auth_attempt(user, password, &self.peer.ip().to_string())
                .await
            {
                warn!(%error, "Failed to record auth attempt.");
            }
        }
        info!(peer = %self.peer, %user, "Rejected password authentication.");
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.user = Some(user.into());
        match self.server.authenticator.accept(public_key) {
            Some(fingerprint) => {
                info!(peer = %self.peer, %user, %fingerprint, "SSH client authenticated with public key.");
                self.key_fingerprint = Some(fingerprint);
                Ok(Auth::Accept)
            }
            None => {
                info!(
                    peer = %self.peer, %user,
                    fingerprint = %public_key.fingerprint(HashAlg::Sha256),
                    "Unknown public key.",
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        let format = MessageFormat::for_user(self.user.as_deref().unwrap_or_default());
        let (Some(notify_rx), Some(error_rx)) = (self.notify_rx.take(), self.error_rx.take())
        else {
            return Ok(());
        };
        let handler = Arc::new(MessageHandler::new(
            notify_rx,
            error_rx,
            format,
            self.server.tls_enabled,
        ));
        // An error on the error stream terminates the handler, which in
        // turn terminates the session.
        let watcher = Arc::clone(&handler);
        let cancellation_token = self.cancellation_token.clone();
        tokio::spawn(async move {
            if let Some(error) = watcher.wait().await {
                debug!(%error, "Message handler terminated with error.");
            }
            // Give terminal writers a moment to flush before disconnecting.
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancellation_token.cancel();
        });
        self.message_handler = Some(handler);
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(message_handler) = self.message_handler.as_ref() else {
            return Ok(false);
        };
        let channel_id = channel.id();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if channel.data(&message[..]).await.is_err() {
                    break;
                }
            }
        });
        let sender = ServerHandlerSender(Some(tx));
        let consumer_id = message_handler.register(sender.clone());
        // Greet the terminal with the banner if the tunnel already exists.
        message_handler.replay_urls(&consumer_id);
        let prompt = self.prompt();
        if !prompt.is_empty() {
            let _ = sender.send(prompt.as_bytes().to_vec());
        }
        self.terminals.insert(
            channel_id,
            SessionTerminal {
                consumer_id,
                tx: sender,
                line: Vec::new(),
                prompt,
                _writer: DroppableHandle(writer),
            },
        );
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, "Received pty_request.");
        session.channel_success(channel)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, command = %String::from_utf8_lossy(data), "Ignoring exec request.");
        session.channel_failure(channel)
    }

    // Terminal input: line editing plus the `logs`/`nologs`/`quit` commands.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(terminal) = self.terminals.get_mut(&channel) else {
            return Ok(());
        };
        for &byte in data {
            match byte {
                b'\r' | b'\n' => {
                    let line = String::from_utf8_lossy(&terminal.line).trim().to_string();
                    terminal.line.clear();
                    let _ = terminal.tx.send(b"\r\n".to_vec());
                    match line.as_str() {
                        "logs" => {
                            if let Some(handler) = self.message_handler.as_ref() {
                                handler.set_logging(&terminal.consumer_id, true);
                            }
                            let _ = terminal.tx.send(b"Logging enabled\r\n".to_vec());
                        }
                        "nologs" => {
                            if let Some(handler) = self.message_handler.as_ref() {
                                handler.set_logging(&terminal.consumer_id, false);
                            }
                            let _ = terminal.tx.send(b"Logging disabled\r\n".to_vec());
                        }
                        "quit" => {
                            self.cancellation_token.cancel();
                            return Ok(());
                        }
                        "" => {}
                        command => {
                            debug!(peer = %self.peer, %command, "Unknown terminal command.");
                        }
                    }
                    if !terminal.prompt.is_empty() {
                        let _ = terminal.tx.send(terminal.prompt.as_bytes().to_vec());
                    }
                }
                // Ctrl+C ends the session and disconnects the client.
                0x03 => {
                    self.cancellation_token.cancel();
                    return Ok(());
                }
                // Backspace
                0x08 | 0x7f => {
                    if terminal.line.pop().is_some() {
                        let _ = terminal.tx.send(b"\x08 \x08".to_vec());
                    }
                }
                byte if !byte.is_ascii_control() => {
                    terminal.line.push(byte);
                    let _ = terminal.tx.send(vec![byte]);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.close_terminal(channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.close_terminal(channel);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // The reply always carries the requested port, never the ephemeral
        // one actually bound.
        forwarding::open_remote_forward(
            &RemoteForwardingContext {
                server: &self.server,
                peer: &self.peer,
                notify_tx: &self.notify_tx,
                error_tx: &self.error_tx,
                cancellation_token: &self.cancellation_token,
            },
            address.trim(),
            *port,
            session.handle(),
        )
        .await
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(forwarding::cancel_remote_forward(&self.server, &self.peer, address.trim(), port).await)
    }
}

// Tear down everything the connection owns: its tunnels (which emit
// `Closed` for each), its message handler, and its terminals.
impl Drop for ServerHandler {
    fn drop(&mut self) {
        let user = self.user.as_deref().unwrap_or("unknown");
        info!(
            peer = %self.peer, %user, fingerprint = ?self.key_fingerprint,
            "SSH client disconnected.",
        );
        if let Some(handler) = self.message_handler.take() {
            handler.close();
        }
        self.cancellation_token.cancel();
        let registry = Arc::clone(&self.server.registry);
        let peer = self.peer;
        tokio::spawn(async move {
            registry.unregister_peer(&peer).await;
        });
    }
}
