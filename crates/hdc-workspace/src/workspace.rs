use hdc_core::channel_ipc::{ChannelMsg, SessionPayload};
use hdc_core::{
    case_tab_id, chat_tab_id, ChatWindowState, EscalationStatus, PendingChatNotification, Tab,
    TabKind, TabSnapshot, PARAM_ESCALATION_ID,
};
use hdc_storage::SnapshotStore;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::{NotificationBroker, Notifier, ToastSubscription};
use crate::chat::{ChatAssignment, ChatEnded, ChatError, ChatSessionController};
use crate::escalation::{
    CaseStatusBoard, EscalationApi, EscalationQuery, EscalationRecord, LookupError,
};
use crate::realtime::{ChannelError, ChannelLink, ChannelSignal, RealtimeAdapter};
use crate::tabs::{RestoreReport, TabError, TabRegistry, TabResolver};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Tab(#[from] TabError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("no pending chat for escalation {0}")]
    NotPending(String),
    #[error("a status change for {0} is still waiting on the server")]
    StatusInFlight(String),
    #[error("workspace has been disposed")]
    Disposed,
}

impl WorkspaceError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Chat(ChatError::Conflict { .. }))
    }
}

/// Root of one agent's desk. Owns every component and is the only place events enter.
///
/// Each call runs to completion before the next one is accepted (`&mut self`), and ends
/// with the disconnect watcher so a customer leaving is torn down in the same step.
pub struct Workspace<S, A, L> {
    tabs: TabRegistry<S>,
    chat: ChatSessionController,
    broker: NotificationBroker,
    adapter: RealtimeAdapter,
    statuses: CaseStatusBoard,
    api: A,
    link: L,
    disposed: bool,
}

impl<S, A, L> Workspace<S, A, L>
where
    S: SnapshotStore,
    A: EscalationApi,
    L: ChannelLink,
{
    pub fn new(agent_id: impl Into<String>, store: S, api: A, link: L, notifier: Notifier) -> Self {
        Self {
            tabs: TabRegistry::new(store),
            chat: ChatSessionController::new(),
            broker: NotificationBroker::new(notifier),
            adapter: RealtimeAdapter::new(agent_id),
            statuses: CaseStatusBoard::default(),
            api,
            link,
            disposed: false,
        }
    }

    /// Restores saved tabs, then asks the backend whether each restored case still exists.
    ///
    /// Only a not-found answer drops a tab; transport failures keep it.
    pub async fn init(&mut self, resolver: &dyn TabResolver) -> RestoreReport {
        let already_initialized = self.tabs.is_initialized();
        let mut report = self.tabs.init(resolver);
        if !already_initialized {
            self.verify_restored_tabs(&mut report).await;
        }
        info!(
            event = "workspace_ready",
            agent_id = %self.adapter.agent_id(),
            tabs = report.restored,
            dropped = report.dropped.len()
        );
        report
    }

    async fn verify_restored_tabs(&mut self, report: &mut RestoreReport) {
        let restored: Vec<(String, String)> = self
            .tabs
            .tabs()
            .iter()
            .filter(|tab| matches!(tab.kind, TabKind::Case | TabKind::Email | TabKind::Notes))
            .filter_map(|tab| {
                tab.param(PARAM_ESCALATION_ID)
                    .map(|escalation_id| (tab.id.clone(), escalation_id.to_string()))
            })
            .collect();

        let mut known: HashMap<String, bool> = HashMap::new();
        let mut missing = Vec::new();
        for (tab_id, escalation_id) in restored {
            let exists = match known.get(&escalation_id) {
                Some(exists) => *exists,
                None => {
                    let exists = match self.api.summary(&escalation_id).await {
                        Ok(_) => true,
                        Err(LookupError::NotFound(_)) => false,
                        Err(err) => {
                            warn!(
                                event = "tab_restore_unverified",
                                tab_id = %tab_id,
                                escalation_id = %escalation_id,
                                error = %err
                            );
                            true
                        }
                    };
                    known.insert(escalation_id.clone(), exists);
                    exists
                }
            };
            if !exists {
                debug!(
                    event = "tab_restore_dropped",
                    tab_id = %tab_id,
                    escalation_id = %escalation_id
                );
                missing.push(tab_id);
            }
        }
        if missing.is_empty() {
            return;
        }

        match self.tabs.discard(&missing) {
            Ok(_) => {
                report.dropped.extend(missing);
                report.restored = self.tabs.tabs().len();
            }
            Err(err) => warn!(event = "tab_restore_discard_failed", error = %err),
        }
    }

    /// Feeds one message from the push channel through the adapter.
    pub async fn handle_channel(&mut self, msg: ChannelMsg) -> Option<ChannelSignal> {
        if self.disposed {
            debug!(event = "channel_msg_after_dispose", kind = msg.kind());
            return None;
        }
        let bound = self.chat.state().session_id.clone();
        let signal = self
            .adapter
            .normalize(msg, bound.as_deref(), &self.api)
            .await;
        match &signal {
            Some(ChannelSignal::HandOff(pending)) => self.receive_handoff(pending.clone()),
            Some(ChannelSignal::SessionJoined(_)) => {
                self.chat.mark_connected();
            }
            Some(ChannelSignal::RemoteLeft(_)) => {
                self.chat.mark_disconnected();
            }
            None => {}
        }
        self.run_effects().await;
        signal
    }

    fn receive_handoff(&mut self, pending: PendingChatNotification) {
        let message = handoff_message(&pending);
        if self.broker.enqueue(pending) {
            self.broker.notifier().info(message, None);
        }
    }

    /// Accepts a queued hand-off. On conflict the entry stays queued.
    pub async fn accept_chat(&mut self, escalation_id: &str) -> Result<ChatWindowState, WorkspaceError> {
        self.ensure_live()?;
        if !self.tabs.is_initialized() {
            return Err(TabError::NotInitialized.into());
        }
        let pending = self
            .broker
            .get(escalation_id)
            .cloned()
            .ok_or_else(|| WorkspaceError::NotPending(escalation_id.to_string()))?;
        let session_id = pending
            .summary
            .session_id
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| pending.escalation_id.clone());
        let business_id = pending.summary.business_id.clone().unwrap_or_default();

        self.chat.assign(ChatAssignment {
            escalation_id: pending.escalation_id.clone(),
            session_id: session_id.clone(),
            business_id: business_id.clone(),
            customer_name: pending.summary.customer_name.clone(),
        })?;
        self.broker.take(escalation_id);
        self.tabs.open(Tab::chat(
            &pending.escalation_id,
            &session_id,
            &business_id,
            &pending.summary.customer_name,
        ))?;
        self.send(ChannelMsg::JoinSession(SessionPayload { session_id }))
            .await;
        Ok(self.chat.state().clone())
    }

    pub fn dismiss_chat(&mut self, escalation_id: &str) -> bool {
        self.broker.dismiss_chat(escalation_id)
    }

    /// Agent-initiated end. A no-op when no chat is live.
    pub async fn end_chat(&mut self) -> Option<ChatEnded> {
        let ended = self.chat.end_chat()?;
        self.leave(&ended).await;
        Some(ended)
    }

    async fn run_effects(&mut self) {
        if let Some(ended) = self.chat.teardown_if_disconnected() {
            self.leave(&ended).await;
            self.broker
                .notifier()
                .warning("The customer left the chat", None);
        }
    }

    async fn leave(&mut self, ended: &ChatEnded) {
        if let Some(session_id) = ended.session_id.clone() {
            self.send(ChannelMsg::LeaveSession(SessionPayload { session_id }))
                .await;
        }
    }

    async fn send(&mut self, msg: ChannelMsg) {
        let kind = msg.kind();
        if let Err(err) = self.link.send(msg).await {
            warn!(event = "channel_send_failed", kind, error = %err);
        }
    }

    pub fn open_tab(&mut self, tab: Tab) -> Result<Tab, WorkspaceError> {
        self.ensure_live()?;
        Ok(self.tabs.open(tab)?.clone())
    }

    pub fn open_case(&mut self, escalation_id: &str, case_number: &str) -> Result<Tab, WorkspaceError> {
        self.open_tab(Tab::case(escalation_id, case_number))
    }

    pub fn activate_tab(&mut self, id: &str) -> Result<bool, WorkspaceError> {
        self.ensure_live()?;
        Ok(self.tabs.activate(id)?)
    }

    pub fn close_tab(&mut self, id: &str) -> Result<bool, WorkspaceError> {
        self.ensure_live()?;
        Ok(self.tabs.close(id)?)
    }

    pub fn close_other_tabs(&mut self, id: &str) -> Result<bool, WorkspaceError> {
        self.ensure_live()?;
        Ok(self.tabs.close_others(id)?)
    }

    pub fn close_all_tabs(&mut self) -> Result<(), WorkspaceError> {
        self.ensure_live()?;
        Ok(self.tabs.close_all()?)
    }

    pub fn patch_tab(
        &mut self,
        id: &str,
        title: Option<String>,
        params: BTreeMap<String, String>,
    ) -> Result<bool, WorkspaceError> {
        self.ensure_live()?;
        Ok(self.tabs.patch(id, title, params)?)
    }

    pub fn tabs(&self) -> &[Tab] {
        self.tabs.tabs()
    }

    pub fn active_tab_id(&self) -> Option<&str> {
        self.tabs.active_tab_id()
    }

    pub fn tab_snapshot(&self) -> TabSnapshot {
        self.tabs.snapshot()
    }

    /// The open tab showing the live chat, if any.
    pub fn live_tab_id(&self) -> Option<String> {
        let escalation_id = self.chat.state().escalation_id.as_deref()?;
        [chat_tab_id(escalation_id), case_tab_id(escalation_id)]
            .into_iter()
            .find(|id| self.tabs.contains(id))
    }

    pub fn chat_state(&self) -> &ChatWindowState {
        self.chat.state()
    }

    pub fn last_ended(&self) -> Option<&ChatEnded> {
        self.chat.last_ended()
    }

    pub fn pending(&self) -> Vec<PendingChatNotification> {
        self.broker.pending().cloned().collect()
    }

    pub fn notifier(&self) -> &Notifier {
        self.broker.notifier()
    }

    pub fn subscribe_toasts(&self) -> ToastSubscription {
        self.broker.notifier().subscribe()
    }

    pub fn watch_chat(&self) -> watch::Receiver<ChatWindowState> {
        self.chat.subscribe()
    }

    pub fn watch_pending(&self) -> watch::Receiver<Vec<PendingChatNotification>> {
        self.broker.watch_pending()
    }

    /// Loads one page of a business's cases and seeds the status board with them.
    pub async fn refresh_cases(
        &mut self,
        business_id: &str,
        query: &EscalationQuery,
    ) -> Result<Vec<EscalationRecord>, WorkspaceError> {
        self.ensure_live()?;
        let records = self.api.list(business_id, query).await?;
        self.statuses.seed(&records);
        Ok(records)
    }

    pub async fn case_count(&self, business_id: &str) -> Result<u64, WorkspaceError> {
        Ok(self.api.count(business_id).await?)
    }

    pub fn case_status(&self, escalation_id: &str) -> Option<EscalationStatus> {
        self.statuses.status(escalation_id)
    }

    /// Shows `requested` at once, then settles on whatever the server answers.
    pub async fn set_case_status(
        &mut self,
        escalation_id: &str,
        requested: EscalationStatus,
    ) -> Result<EscalationStatus, WorkspaceError> {
        self.ensure_live()?;
        let outcome = self
            .statuses
            .set_status(&self.api, escalation_id, requested)
            .await
            .ok_or_else(|| WorkspaceError::StatusInFlight(escalation_id.to_string()))?;
        let notifier = self.broker.notifier();
        match outcome {
            Ok(status) => {
                notifier.success(format!("Case marked {status}"), None);
                Ok(status)
            }
            Err(err) => {
                notifier.error(format!("Could not update case: {err}"), None);
                Err(err.into())
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Logout. Leaves any live session, drops queued hand-offs and toasts, closes the
    /// channel. Safe to call twice.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.end_chat().await;
        self.broker.dispose();
        self.link.dispose().await;
        self.disposed = true;
        info!(event = "workspace_disposed", agent_id = %self.adapter.agent_id());
    }

    fn ensure_live(&self) -> Result<(), WorkspaceError> {
        if self.disposed {
            Err(WorkspaceError::Disposed)
        } else {
            Ok(())
        }
    }
}

fn handoff_message(pending: &PendingChatNotification) -> String {
    let summary = &pending.summary;
    let who = if summary.customer_name.trim().is_empty() {
        pending.escalation_id.as_str()
    } else {
        summary.customer_name.as_str()
    };
    if summary.concern.trim().is_empty() {
        format!("Incoming chat from {who}")
    } else {
        format!("Incoming chat from {who}: {}", summary.concern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdc_core::CaseSummary;

    #[test]
    fn handoff_message_falls_back_to_escalation_id() {
        let pending = PendingChatNotification {
            escalation_id: "E1".to_string(),
            summary: CaseSummary::default(),
        };
        assert_eq!(handoff_message(&pending), "Incoming chat from E1");

        let pending = PendingChatNotification {
            escalation_id: "E1".to_string(),
            summary: CaseSummary {
                customer_name: "Ada".to_string(),
                concern: "Refund".to_string(),
                ..CaseSummary::default()
            },
        };
        assert_eq!(handoff_message(&pending), "Incoming chat from Ada: Refund");
    }

    #[test]
    fn conflict_errors_are_recognised() {
        let err = WorkspaceError::from(ChatError::Conflict {
            active: "E1".to_string(),
            requested: "E2".to_string(),
        });
        assert!(err.is_conflict());
        assert!(!WorkspaceError::Disposed.is_conflict());
    }
}
