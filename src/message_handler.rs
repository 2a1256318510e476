use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use owo_colors::OwoColorize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    droppable_handle::DroppableHandle,
    error::ServerError,
    messages::{NotifyMessage, TunnelUrls},
    ssh::ServerHandlerSender,
};

// Framing for notification messages, chosen by the SSH user name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageFormat {
    String,
    Json,
}

impl MessageFormat {
    pub(crate) fn for_user(user: &str) -> Self {
        if user == "api" {
            MessageFormat::Json
        } else {
            MessageFormat::String
        }
    }
}

struct Consumer {
    tx: ServerHandlerSender,
    logging_enabled: bool,
}

struct HandlerShared {
    consumers: Mutex<HashMap<String, Consumer>>,
    // Rendered URL banner, cached so late-joining terminals can be greeted.
    urls: Mutex<Option<Vec<u8>>>,
    error: Mutex<Option<ServerError>>,
    done: CancellationToken,
    format: MessageFormat,
    tls_enabled: bool,
}

impl HandlerShared {
    // Writes to every consumer; `Log` messages only reach consumers that
    // enabled logging. A failed write never takes the handler down.
    fn broadcast(&self, message: &[u8], bypass_logging_toggle: bool) {
        let consumers = self.consumers.lock().expect("consumer lock not poisoned");
        for consumer in consumers.values() {
            if bypass_logging_toggle || consumer.logging_enabled {
                let _ = consumer.tx.send(message.to_vec());
            }
        }
    }
}

// Fans notification and error messages of one SSH connection out to its
// terminal consumers.
pub(crate) struct MessageHandler {
    shared: Arc<HandlerShared>,
    _join: DroppableHandle<()>,
}

impl MessageHandler {
    pub(crate) fn new(
        mut notify_rx: mpsc::Receiver<NotifyMessage>,
        mut error_rx: mpsc::Receiver<ServerError>,
        format: MessageFormat,
        tls_enabled: bool,
    ) -> Self {
        let shared = Arc::new(HandlerShared {
            consumers: Mutex::default(),
            urls: Mutex::default(),
            error: Mutex::default(),
            done: CancellationToken::new(),
            format,
            tls_enabled,
        });
        let loop_shared = Arc::clone(&shared);
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_shared.done.cancelled() => break,
                    error = error_rx.recv() => {
                        let Some(error) = error else { break };
                        let message = format!("{}\r\n", error.to_string().red());
                        loop_shared.broadcast(message.as_bytes(), true);
                        *loop_shared.error.lock().expect("error lock not poisoned") = Some(error);
                        break;
                    }
                    message = notify_rx.recv() => {
                        let Some(message) = message else { break };
                        match message {
                            NotifyMessage::Url(urls) => {
                                let rendered = render_urls(
                                    &urls,
                                    loop_shared.format,
                                    loop_shared.tls_enabled,
                                );
                                *loop_shared.urls.lock().expect("urls lock not poisoned") =
                                    Some(rendered.clone());
                                loop_shared.broadcast(&rendered, true);
                            }
                            NotifyMessage::Log(mut line) | NotifyMessage::Raw(mut line) => {
                                if !line.ends_with(b"\n") {
                                    line.extend_from_slice(b"\r\n");
                                }
                                loop_shared.broadcast(&line, false);
                            }
                        }
                    }
                }
            }
            loop_shared.done.cancel();
        });
        MessageHandler {
            shared,
            _join: DroppableHandle(join),
        }
    }

    // Attaches a terminal sink and returns its consumer id. Logging starts
    // disabled; the URL banner is still delivered.
    pub(crate) fn register(&self, tx: ServerHandlerSender) -> String {
        let id = Uuid::new_v4().to_string();
        self.shared
            .consumers
            .lock()
            .expect("consumer lock not poisoned")
            .insert(
                id.clone(),
                Consumer {
                    tx,
                    logging_enabled: false,
                },
            );
        id
    }

    pub(crate) fn unregister(&self, id: &str) {
        self.shared
            .consumers
            .lock()
            .expect("consumer lock not poisoned")
            .remove(id);
    }

    pub(crate) fn set_logging(&self, id: &str, enabled: bool) {
        if let Some(consumer) = self
            .shared
            .consumers
            .lock()
            .expect("consumer lock not poisoned")
            .get_mut(id)
        {
            consumer.logging_enabled = enabled;
        }
    }

    // Greets a just-opened terminal with the cached URL banner, if any.
    pub(crate) fn replay_urls(&self, id: &str) {
        let urls = self.shared.urls.lock().expect("urls lock not poisoned");
        let Some(ref banner) = *urls else { return };
        if let Some(consumer) = self
            .shared
            .consumers
            .lock()
            .expect("consumer lock not poisoned")
            .get(id)
        {
            let _ = consumer.tx.send(banner.clone());
        }
    }

    // Blocks until the handler terminates and returns the stored error, if
    // the termination was caused by one.
    pub(crate) async fn wait(&self) -> Option<ServerError> {
        self.shared.done.cancelled().await;
        self.shared
            .error
            .lock()
            .expect("error lock not poisoned")
            .clone()
    }

    // Idempotent.
    pub(crate) fn close(&self) {
        self.shared.done.cancel();
    }
}

impl Drop for MessageHandler {
    fn drop(&mut self) {
        self.shared.done.cancel();
    }
}

fn render_urls(urls: &TunnelUrls, format: MessageFormat, tls_enabled: bool) -> Vec<u8> {
    match format {
        MessageFormat::Json => {
            let mut rendered =
                serde_json::to_vec(urls).expect("urls serialization cannot fail");
            rendered.extend_from_slice(b"\r\n");
            rendered
        }
        MessageFormat::String => {
            let mut banner = String::from("###\r\n");
            banner.push_str(&format!(
                "### HTTP tunnel successfully created on {}\r\n",
                urls.http.green()
            ));
            if tls_enabled && !urls.https.is_empty() {
                banner.push_str(&format!(
                    "### HTTPS tunnel successfully created on {}\r\n",
                    urls.https.green()
                ));
            }
            banner.push_str("###\r\n");
            banner.into_bytes()
        }
    }
}

#[cfg(test)]
mod message_handler_tests {
    use tokio::sync::mpsc;

    use crate::{
        error::ServerError,
        messages::{NotifyMessage, TunnelUrls, NOTIFY_CHANNEL_CAPACITY},
        ssh::ServerHandlerSender,
    };

    use super::{MessageFormat, MessageHandler};

    fn handler(
        format: MessageFormat,
        tls_enabled: bool,
    ) -> (
        MessageHandler,
        mpsc::Sender<NotifyMessage>,
        mpsc::Sender<ServerError>,
    ) {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(1);
        let handler = MessageHandler::new(notify_rx, error_rx, format, tls_enabled);
        (handler, notify_tx, error_tx)
    }

    fn consumer() -> (
        ServerHandlerSender,
        tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ServerHandlerSender(Some(tx)), rx)
    }

    fn urls() -> TunnelUrls {
        TunnelUrls {
            http: "http://foo.example.test:8080".into(),
            https: String::new(),
        }
    }

    #[tokio::test]
    async fn delivers_banner_to_registered_consumer() {
        let (handler, notify_tx, _error_tx) = handler(MessageFormat::String, false);
        let (tx, mut rx) = consumer();
        handler.register(tx);
        notify_tx.send(NotifyMessage::Url(urls())).await.unwrap();
        let banner = String::from_utf8(rx.recv().await.unwrap()).unwrap();
        assert!(banner.contains("HTTP tunnel successfully created"));
        assert!(banner.contains("http://foo.example.test:8080"));
        assert!(!banner.contains("HTTPS tunnel"));
    }

    #[tokio::test]
    async fn banner_includes_https_line_when_tls_enabled() {
        let (handler, notify_tx, _error_tx) = handler(MessageFormat::String, true);
        let (tx, mut rx) = consumer();
        handler.register(tx);
        notify_tx
            .send(NotifyMessage::Url(TunnelUrls {
                http: "http://q.example.test:8080".into(),
                https: "https://q.example.test:8443".into(),
            }))
            .await
            .unwrap();
        let banner = String::from_utf8(rx.recv().await.unwrap()).unwrap();
        assert!(banner.contains("http://q.example.test:8080"));
        assert!(banner.contains("https://q.example.test:8443"));
    }

    #[tokio::test]
    async fn json_framing_is_the_literal_object() {
        let (handler, notify_tx, _error_tx) = handler(MessageFormat::Json, false);
        let (tx, mut rx) = consumer();
        handler.register(tx);
        notify_tx.send(NotifyMessage::Url(urls())).await.unwrap();
        let message = String::from_utf8(rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            message.trim_end(),
            r#"{"http":"http://foo.example.test:8080","https":""}"#
        );
    }

    #[tokio::test]
    async fn replays_cached_banner_to_late_consumer() {
        let (handler, notify_tx, _error_tx) = handler(MessageFormat::String, false);
        notify_tx.send(NotifyMessage::Url(urls())).await.unwrap();
        // Wait for the loop to process and cache the banner.
        tokio::task::yield_now().await;
        let (tx, mut rx) = consumer();
        let id = handler.register(tx);
        handler.replay_urls(&id);
        let banner = String::from_utf8(rx.recv().await.unwrap()).unwrap();
        assert!(banner.contains("http://foo.example.test:8080"));
    }

    #[tokio::test]
    async fn log_messages_respect_logging_toggle() {
        let (handler, notify_tx, _error_tx) = handler(MessageFormat::String, false);
        let (tx, mut rx) = consumer();
        let id = handler.register(tx);
        notify_tx
            .send(NotifyMessage::Log(b"GET / 200".to_vec()))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        // Enabling twice has the same effect as once.
        handler.set_logging(&id, true);
        handler.set_logging(&id, true);
        notify_tx
            .send(NotifyMessage::Log(b"GET /again 200".to_vec()))
            .await
            .unwrap();
        let line = String::from_utf8(rx.recv().await.unwrap()).unwrap();
        assert!(line.contains("GET /again 200"));
        handler.set_logging(&id, false);
        notify_tx
            .send(NotifyMessage::Log(b"GET /hidden 200".to_vec()))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_reaches_every_consumer_and_terminates() {
        let (handler, _notify_tx, error_tx) = handler(MessageFormat::String, false);
        let (tx1, mut rx1) = consumer();
        let (tx2, mut rx2) = consumer();
        handler.register(tx1);
        handler.register(tx2);
        error_tx.send(ServerError::SubdomainTaken).await.unwrap();
        let first = String::from_utf8(rx1.recv().await.unwrap()).unwrap();
        let second = String::from_utf8(rx2.recv().await.unwrap()).unwrap();
        assert!(first.contains("subdomain already registered"));
        assert!(second.contains("subdomain already registered"));
        assert_eq!(handler.wait().await, Some(ServerError::SubdomainTaken));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (handler, _notify_tx, _error_tx) = handler(MessageFormat::String, false);
        handler.close();
        handler.close();
        assert_eq!(handler.wait().await, None);
    }

    #[test]
    fn format_is_chosen_by_user_name() {
        assert_eq!(MessageFormat::for_user("api"), MessageFormat::Json);
        assert_eq!(MessageFormat::for_user("alice"), MessageFormat::String);
    }
}
