use hdc_core::{ChatEndReason, ChatPhase, ChatWindowState};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("chat {active} is still live; end it before accepting {requested}")]
    Conflict { active: String, requested: String },
    #[error("chat assignment is missing an escalation id")]
    MissingEscalation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatAssignment {
    pub escalation_id: String,
    pub session_id: String,
    pub business_id: String,
    pub customer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEnded {
    pub escalation_id: String,
    pub session_id: Option<String>,
    pub reason: ChatEndReason,
}

/// Owns the single live-chat state.
///
/// `Idle -> Assigned -> Connected -> (Disconnected | ended) -> Idle`. Observers get
/// every published state through [`ChatSessionController::subscribe`].
pub struct ChatSessionController {
    state: ChatWindowState,
    last_ended: Option<ChatEnded>,
    tx: watch::Sender<ChatWindowState>,
}

impl Default for ChatSessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSessionController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ChatWindowState::default());
        Self {
            state: ChatWindowState::default(),
            last_ended: None,
            tx,
        }
    }

    pub fn state(&self) -> &ChatWindowState {
        &self.state
    }

    pub fn phase(&self) -> ChatPhase {
        self.state.phase()
    }

    pub fn last_ended(&self) -> Option<&ChatEnded> {
        self.last_ended.as_ref()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatWindowState> {
        self.tx.subscribe()
    }

    pub fn assign(&mut self, assignment: ChatAssignment) -> Result<&ChatWindowState, ChatError> {
        if let Some(active) = self.state.escalation_id.as_ref() {
            return Err(ChatError::Conflict {
                active: active.clone(),
                requested: assignment.escalation_id,
            });
        }
        if assignment.escalation_id.trim().is_empty() {
            return Err(ChatError::MissingEscalation);
        }

        self.state = ChatWindowState {
            visible: true,
            escalation_id: Some(assignment.escalation_id),
            session_id: non_empty(assignment.session_id),
            business_id: non_empty(assignment.business_id),
            customer_name: non_empty(assignment.customer_name),
            connected: false,
            disconnected: false,
        };
        info!(
            event = "chat_assigned",
            escalation_id = ?self.state.escalation_id,
            session_id = ?self.state.session_id
        );
        self.publish();
        Ok(&self.state)
    }

    /// Transport confirmed the join. Only meaningful while `Assigned`.
    pub fn mark_connected(&mut self) -> bool {
        if self.phase() != ChatPhase::Assigned {
            debug!(event = "chat_connect_ignored", phase = %self.phase());
            return false;
        }
        self.state.connected = true;
        self.publish();
        true
    }

    /// Remote party left. Only meaningful while `Connected`.
    pub fn mark_disconnected(&mut self) -> bool {
        if self.phase() != ChatPhase::Connected {
            debug!(event = "chat_disconnect_ignored", phase = %self.phase());
            return false;
        }
        self.state.connected = false;
        self.state.disconnected = true;
        info!(event = "chat_customer_left", escalation_id = ?self.state.escalation_id);
        self.publish();
        true
    }

    /// Agent-initiated end. Idempotent: returns `None` when already idle.
    pub fn end_chat(&mut self) -> Option<ChatEnded> {
        self.teardown(ChatEndReason::AgentEnded)
    }

    /// Disconnect watcher. Tears the session down once the remote party is gone; a no-op
    /// in every other phase, so it is safe to run after any event.
    pub fn teardown_if_disconnected(&mut self) -> Option<ChatEnded> {
        if self.phase() != ChatPhase::Disconnected {
            return None;
        }
        self.teardown(ChatEndReason::CustomerLeft)
    }

    fn teardown(&mut self, reason: ChatEndReason) -> Option<ChatEnded> {
        let previous = std::mem::take(&mut self.state);
        let escalation_id = previous.escalation_id?;
        let ended = ChatEnded {
            escalation_id,
            session_id: previous.session_id,
            reason,
        };
        info!(
            event = "chat_ended",
            escalation_id = %ended.escalation_id,
            reason = ?ended.reason
        );
        self.last_ended = Some(ended.clone());
        self.publish();
        Some(ended)
    }

    fn publish(&self) {
        self.tx.send_replace(self.state.clone());
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
