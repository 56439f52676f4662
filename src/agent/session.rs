//! Duplex session client.
//!
//! Maintains the single WebSocket link to the server: authenticated
//! handshake, framed reads with an idle deadline, deadline-bounded writes,
//! and an event-driven reconnect loop. Reliable frames are best-effort over
//! the live session; the durable outbox is the only persistence, drained in
//! order after every successful (re)connect.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use opsfabric_core::error::{FabricError, Result};
use opsfabric_core::outbox::FileOutbox;
use opsfabric_core::protocol::Frame;

const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const READ_IDLE_DEADLINE: Duration = Duration::from_secs(60);
const HANDSHAKE_PROTOCOL: &str = "agent-token";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Invoked when the handshake is rejected as unauthorized/not-found; a
/// successful re-registration returns the new agent id.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn re_register(&self) -> Result<String>;
}

pub struct SessionClient {
    token: parking_lot::RwLock<String>,
    /// Full ws URL returned by registration; falls back to the configured
    /// base when empty.
    override_url: parking_lot::RwLock<String>,
    base_url: String,
    backup_url: Option<String>,
    backoff_initial: Duration,
    backoff_max: Duration,
    max_retries: u32,

    writer: Mutex<Option<WsSink>>,
    connected: AtomicBool,
    agent_id: parking_lot::RwLock<String>,

    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
    inbound_tx: mpsc::UnboundedSender<Frame>,

    outbox: Arc<FileOutbox>,
    flush_batch: usize,
    cancel: CancellationToken,
}

impl SessionClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: String,
        backup_url: Option<String>,
        token: String,
        outbox: Arc<FileOutbox>,
        flush_batch: usize,
        backoff_initial: Duration,
        backoff_max: Duration,
        max_retries: u32,
        cancel: CancellationToken,
    ) -> (Arc<SessionClient>, mpsc::UnboundedReceiver<Frame>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);

        let client = Arc::new(SessionClient {
            token: parking_lot::RwLock::new(token),
            override_url: parking_lot::RwLock::new(String::new()),
            base_url,
            backup_url: backup_url.filter(|u| !u.is_empty()),
            backoff_initial,
            backoff_max,
            max_retries,
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            agent_id: parking_lot::RwLock::new(String::new()),
            reconnect_tx,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            inbound_tx,
            outbox,
            flush_batch: flush_batch.max(1),
            cancel,
        });
        (client, inbound_rx)
    }

    pub fn set_identity(&self, agent_id: &str, ws_url: &str, token: &str) {
        *self.agent_id.write() = agent_id.to_string();
        *self.override_url.write() = ws_url.to_string();
        if !token.is_empty() {
            *self.token.write() = token.to_string();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Nudges the reconnect loop. A full trigger channel means a sequence
    /// is already pending, which is exactly what we want.
    pub fn trigger_reconnect(&self) {
        let _ = self.reconnect_tx.try_send(());
    }

    /// Sends a fire-and-forget frame over the live session.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let json = serde_json::to_string(frame)?;

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(FabricError::NotConnected)?;

        match timeout(WRITE_DEADLINE, sink.send(WsMessage::Text(json.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                drop(writer);
                self.mark_disconnected("write error");
                Err(FabricError::ConnectionFailed {
                    message: e.to_string(),
                })
            }
            Err(_) => {
                drop(writer);
                self.mark_disconnected("write deadline");
                Err(FabricError::ConnectionTimeout)
            }
        }
    }

    /// Assigns a message id and sends. Best-effort: persistence on failure
    /// is the caller's outbox.
    pub async fn send_reliable(&self, mut frame: Frame) -> Result<()> {
        frame.ensure_message_id();
        self.send(&frame).await
    }

    /// Reliable emit with outbox fallback: the single path used for logs
    /// and task results.
    pub async fn emit_reliable(&self, mut frame: Frame) {
        frame.ensure_message_id();
        if self.is_connected() {
            match self.send(&frame).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, kind = frame.type_name(), "reliable send failed, spooling to outbox");
                }
            }
        }
        self.outbox.enqueue(frame);
        self.trigger_reconnect();
    }

    /// Drains the outbox in order over the live session. A failed send puts
    /// the unsent tail back at the head and stops.
    pub async fn flush_outbox(&self) {
        if !self.is_connected() {
            return;
        }
        loop {
            let batch = self.outbox.drain(self.flush_batch);
            if batch.is_empty() {
                return;
            }
            let mut iter = batch.into_iter();
            while let Some(frame) = iter.next() {
                if let Err(e) = self.send(&frame).await {
                    warn!(error = %e, "outbox flush interrupted, requeueing tail");
                    let mut tail = vec![frame];
                    tail.extend(iter);
                    self.outbox.requeue_front(tail);
                    return;
                }
            }
        }
    }

    /// Connects to one endpoint and spawns the read loop.
    async fn connect_endpoint(self: &Arc<Self>, url: &str) -> Result<()> {
        let mut request = url
            .into_client_request()
            .map_err(|e| FabricError::invalid_param(format!("bad session url {url}: {e}")))?;

        let protocol = format!("{HANDSHAKE_PROTOCOL},{}", self.token.read());
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(&protocol)
                .map_err(|_| FabricError::invalid_param("token not header-safe"))?,
        );

        let (stream, _resp) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(tungstenite::Error::Http(resp)) => {
                let status = resp.status().as_u16();
                return if matches!(status, 401 | 403 | 404) {
                    Err(FabricError::AuthOrNotFound)
                } else {
                    Err(FabricError::ConnectionFailed {
                        message: format!("handshake status {status}"),
                    })
                };
            }
            Err(e) => {
                return Err(FabricError::ConnectionFailed {
                    message: e.to_string(),
                })
            }
        };

        let (sink, source) = stream.split();
        *self.writer.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);
        info!(url, "session connected");

        let client = Arc::clone(self);
        tokio::spawn(async move { client.read_loop(source).await });
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut source: WsSource) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = timeout(READ_IDLE_DEADLINE, source.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    warn!("session read idle deadline expired");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "session read error");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match message {
                WsMessage::Text(text) => match serde_json::from_str::<Frame>(text.as_str()) {
                    Ok(frame) => {
                        if self.inbound_tx.send(frame).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropped undecodable frame"),
                },
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        self.mark_disconnected("read loop exited");
    }

    fn mark_disconnected(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(reason, "session disconnected");
        }
        self.trigger_reconnect();
    }

    /// Event-driven reconnect loop. At most one sequence runs at a time; a
    /// sequence alternates primary and backup endpoints with exponential
    /// backoff, re-registers on auth failure, and drains the outbox on
    /// success before waiting for the next trigger.
    pub async fn run_reconnect_loop(self: Arc<Self>, registrar: Arc<dyn Registrar>) {
        let mut rx = match self.reconnect_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                error!("reconnect loop already running");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                trigger = rx.recv() => {
                    if trigger.is_none() {
                        return;
                    }
                }
            }
            if self.is_connected() {
                continue;
            }
            warn!("session down, starting reconnect sequence");
            if !self.reconnect_sequence(registrar.as_ref()).await {
                warn!("reconnect loop terminated");
                return;
            }
        }
    }

    /// Returns false when the loop must terminate (unrecoverable
    /// re-registration failure or shutdown).
    async fn reconnect_sequence(self: &Arc<Self>, registrar: &dyn Registrar) -> bool {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if self.is_connected() {
                return true;
            }

            let url = self.endpoint_for_attempt(attempt);
            match self.connect_endpoint(&url).await {
                Ok(()) => {
                    self.flush_outbox().await;
                    return true;
                }
                Err(FabricError::AuthOrNotFound) => {
                    warn!("handshake rejected, re-registering");
                    match registrar.re_register().await {
                        Ok(new_id) => {
                            *self.agent_id.write() = new_id;
                            info!("re-registered, retrying immediately");
                            continue;
                        }
                        Err(e) => {
                            error!(error = %e, "re-registration failed, stopping reconnect loop");
                            return false;
                        }
                    }
                }
                Err(e) => {
                    attempt += 1;
                    if self.max_retries > 0 && attempt >= self.max_retries {
                        warn!(attempts = attempt, "reconnect gave up after max attempts");
                        return true;
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "reconnect attempt failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn endpoint_for_attempt(&self, attempt: u32) -> String {
        let primary = {
            let override_url = self.override_url.read();
            if override_url.is_empty() {
                let agent_id = self.agent_id.read().clone();
                derive_ws_url(&self.base_url, &agent_id)
            } else {
                override_url.clone()
            }
        };
        match &self.backup_url {
            Some(backup) if attempt % 2 == 1 => {
                let agent_id = self.agent_id.read().clone();
                derive_ws_url(backup, &agent_id)
            }
            _ => primary,
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_initial.saturating_mul(1u32 << shift);
        delay.min(self.backoff_max)
    }

    /// Closes the live session, leaving reconnect to the loop (or not, if
    /// the root token is cancelled).
    pub async fn disconnect(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            let _ = sink.close().await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Maps an http(s)/ws(s) base to the session endpoint for an agent.
pub fn derive_ws_url(base: &str, agent_id: &str) -> String {
    if base.contains("/ws/agent/") {
        return base.to_string();
    }
    let scheme_swapped = if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        base.to_string()
    };
    format!(
        "{}/ws/agent/{agent_id}",
        scheme_swapped.trim_end_matches('/')
    )
}

/// Maps a ws(s)/http(s) base to the registration endpoint base.
pub fn derive_http_url(base: &str) -> String {
    let swapped = if let Some(rest) = base.strip_prefix("ws://") {
        format!("http://{rest}")
    } else if let Some(rest) = base.strip_prefix("wss://") {
        format!("https://{rest}")
    } else {
        base.to_string()
    };
    swapped.trim_end_matches('/').to_string()
}
