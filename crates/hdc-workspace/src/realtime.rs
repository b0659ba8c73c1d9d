use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use hdc_core::channel_ipc::{
    decode_text, encode_text, ChannelEnvelope, ChannelMsg, HelloPayload, SessionPayload,
};
use hdc_core::PendingChatNotification;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::escalation::EscalationApi;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const INBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("realtime channel has been disposed")]
    Disposed,
    #[error("invalid channel url: {0}")]
    InvalidUrl(String),
}

/// What the rest of the workspace needs to hear about from the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    HandOff(PendingChatNotification),
    SessionJoined(String),
    RemoteLeft(String),
}

/// Turns raw channel messages into [`ChannelSignal`]s. Holds no state beyond the agent id.
#[derive(Debug, Clone)]
pub struct RealtimeAdapter {
    agent_id: String,
}

impl RealtimeAdapter {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// `bound_session` is the session of the live chat, if any. Lookup failures are
    /// logged and the event is dropped.
    pub async fn normalize<A: EscalationApi + ?Sized>(
        &self,
        msg: ChannelMsg,
        bound_session: Option<&str>,
        api: &A,
    ) -> Option<ChannelSignal> {
        match msg {
            ChannelMsg::ChatStarted(payload) => {
                if payload.agent_id != self.agent_id {
                    debug!(
                        event = "handoff_for_other_agent",
                        agent_id = %payload.agent_id,
                        escalation_id = %payload.escalation_id
                    );
                    return None;
                }
                match api.summary(&payload.escalation_id).await {
                    Ok(summary) => Some(ChannelSignal::HandOff(PendingChatNotification {
                        escalation_id: payload.escalation_id,
                        summary,
                    })),
                    Err(err) => {
                        warn!(
                            event = "handoff_lookup_failed",
                            escalation_id = %payload.escalation_id,
                            error = %err
                        );
                        None
                    }
                }
            }
            ChannelMsg::SessionJoined(payload) => {
                matches_bound(bound_session, &payload.session_id)
                    .then_some(ChannelSignal::SessionJoined(payload.session_id))
            }
            ChannelMsg::CustomerDisconnected(payload) => {
                if !matches_bound(bound_session, &payload.session_id) {
                    debug!(event = "disconnect_for_unbound_session", session_id = %payload.session_id);
                    return None;
                }
                Some(ChannelSignal::RemoteLeft(payload.session_id))
            }
            other => {
                debug!(event = "channel_msg_ignored", kind = other.kind());
                None
            }
        }
    }
}

fn matches_bound(bound_session: Option<&str>, session_id: &str) -> bool {
    bound_session == Some(session_id)
}

/// Outbound half of the push channel as seen by the workspace.
#[async_trait]
pub trait ChannelLink: Send {
    async fn send(&mut self, msg: ChannelMsg) -> Result<(), ChannelError>;
    async fn dispose(&mut self);
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: Url,
    pub agent_id: String,
    pub max_frame_bytes: usize,
    pub max_backoff: Duration,
}

struct Connection {
    outbound: mpsc::UnboundedSender<ChannelEnvelope>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the single shared websocket connection. The socket is opened lazily on first
/// use, reconnects with backoff, and is closed only by [`ChannelLink::dispose`].
pub struct ConnectionManager {
    config: ChannelConfig,
    inbound: mpsc::Sender<ChannelMsg>,
    bound_session: Arc<Mutex<Option<String>>>,
    connection: Option<Connection>,
    disposed: bool,
}

impl ConnectionManager {
    pub fn new(config: ChannelConfig) -> (Self, mpsc::Receiver<ChannelMsg>) {
        let (inbound, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let manager = Self {
            config,
            inbound,
            bound_session: Arc::new(Mutex::new(None)),
            connection: None,
            disposed: false,
        };
        (manager, rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| !connection.task.is_finished())
    }

    pub fn connect(&mut self) -> Result<(), ChannelError> {
        if self.disposed {
            return Err(ChannelError::Disposed);
        }
        if self.connection.is_some() {
            return Ok(());
        }
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connection_loop(
            self.config.clone(),
            self.inbound.clone(),
            outbound_rx,
            shutdown_rx,
            self.bound_session.clone(),
        ));
        info!(event = "channel_started", url = %self.config.url);
        self.connection = Some(Connection {
            outbound,
            shutdown,
            task,
        });
        Ok(())
    }

    fn track_binding(&self, msg: &ChannelMsg) {
        let mut bound = self
            .bound_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match msg {
            ChannelMsg::JoinSession(payload) => *bound = Some(payload.session_id.clone()),
            ChannelMsg::LeaveSession(payload) => {
                if bound.as_deref() == Some(payload.session_id.as_str()) {
                    *bound = None;
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl ChannelLink for ConnectionManager {
    async fn send(&mut self, msg: ChannelMsg) -> Result<(), ChannelError> {
        self.connect()?;
        self.track_binding(&msg);
        let Some(connection) = self.connection.as_ref() else {
            return Err(ChannelError::Disposed);
        };
        if connection.outbound.send(ChannelEnvelope::new(msg)).is_err() {
            warn!(event = "channel_send_dropped");
        }
        Ok(())
    }

    async fn dispose(&mut self) {
        self.disposed = true;
        if let Some(connection) = self.connection.take() {
            let _ = connection.shutdown.send(true);
            drop(connection.outbound);
            if tokio::time::timeout(Duration::from_secs(2), connection.task)
                .await
                .is_err()
            {
                warn!(event = "channel_shutdown_timeout");
            }
        }
        info!(event = "channel_disposed");
    }
}

async fn connection_loop(
    config: ChannelConfig,
    inbound: mpsc::Sender<ChannelMsg>,
    mut outbound: mpsc::UnboundedReceiver<ChannelEnvelope>,
    mut shutdown: watch::Receiver<bool>,
    bound_session: Arc<Mutex<Option<String>>>,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut unsent: Option<ChannelEnvelope> = None;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let connect = tokio::select! {
            result = connect_async(config.url.as_str()) => result,
            _ = shutdown.changed() => return,
        };
        let (mut ws, _) = match connect {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "channel_connect_error", error = %err);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return,
                }
                backoff = next_backoff(backoff, config.max_backoff);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;
        info!(event = "channel_connected", url = %config.url);

        let mut greeting = vec![ChannelMsg::Hello(HelloPayload {
            agent_id: config.agent_id.clone(),
        })];
        let rejoin = bound_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(session_id) = rejoin {
            greeting.push(ChannelMsg::JoinSession(SessionPayload { session_id }));
        }
        let mut greeted = true;
        for msg in greeting {
            let mut hello = Some(ChannelEnvelope::new(msg));
            if !deliver(&mut ws, &mut hello, config.max_frame_bytes).await {
                greeted = false;
                break;
            }
        }
        if !greeted {
            warn!(event = "channel_hello_error");
            let _ = ws.close(None).await;
            continue;
        }
        if unsent.is_some() && !deliver(&mut ws, &mut unsent, config.max_frame_bytes).await {
            warn!(event = "channel_resend_error");
            let _ = ws.close(None).await;
            continue;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = ws.close(None).await;
                    return;
                }
                next = outbound.recv() => {
                    let Some(envelope) = next else {
                        let _ = ws.close(None).await;
                        return;
                    };
                    let kind = envelope.msg.kind();
                    unsent = Some(envelope);
                    if !deliver(&mut ws, &mut unsent, config.max_frame_bytes).await {
                        warn!(event = "channel_send_error", kind);
                        break;
                    }
                }
                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match decode_text(&text, config.max_frame_bytes) {
                                Ok(envelope) => {
                                    if inbound.send(envelope.msg).await.is_err() {
                                        let _ = ws.close(None).await;
                                        return;
                                    }
                                }
                                Err(err) => warn!(event = "channel_decode_error", error = %err),
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!(event = "channel_closed_by_peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(event = "channel_read_error", error = %err);
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Writes the envelope held in `slot`. A transport failure leaves it there so the
/// next connection can send it again; frames that cannot be encoded are dropped.
async fn deliver<S>(ws: &mut S, slot: &mut Option<ChannelEnvelope>, max_frame_bytes: usize) -> bool
where
    S: Sink<Message> + Unpin,
{
    let Some(envelope) = slot.as_ref() else {
        return true;
    };
    let text = match encode_text(envelope, max_frame_bytes) {
        Ok(text) => text,
        Err(err) => {
            warn!(event = "channel_encode_error", kind = envelope.msg.kind(), error = %err);
            *slot = None;
            return true;
        }
    };
    if ws.send(Message::Text(text)).await.is_err() {
        return false;
    }
    *slot = None;
    true
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current.saturating_mul(2);
    if next > max {
        max
    } else {
        next
    }
}

pub fn parse_channel_url(raw: &str) -> Result<Url, ChannelError> {
    let url = Url::parse(raw.trim()).map_err(|err| ChannelError::InvalidUrl(err.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ChannelError::InvalidUrl(format!(
            "unsupported scheme '{other}'"
        ))),
    }
}
