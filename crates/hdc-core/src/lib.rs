use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod channel_ipc;

pub const OVERVIEW_TAB_ID: &str = "overview";
pub const OVERVIEW_TAB_TITLE: &str = "Overview";
pub const DEFAULT_TOAST_TTL_MS: u64 = 4_000;

pub const PARAM_ESCALATION_ID: &str = "escalationId";
pub const PARAM_SESSION_ID: &str = "sessionId";
pub const PARAM_BUSINESS_ID: &str = "businessId";
pub const PARAM_CASE_NUMBER: &str = "caseNumber";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TabKind {
    Overview,
    Case,
    Chat,
    Email,
    Notes,
    Custom,
}

impl TabKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabKind::Overview => "overview",
            TabKind::Case => "case",
            TabKind::Chat => "chat",
            TabKind::Email => "email",
            TabKind::Notes => "notes",
            TabKind::Custom => "custom",
        }
    }
}

impl fmt::Display for TabKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, independently addressable view kept open in the workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tab {
    pub id: String,
    pub kind: TabKind,
    pub title: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default = "default_closable")]
    pub closable: bool,
}

fn default_closable() -> bool {
    true
}

impl Tab {
    pub fn new(id: impl Into<String>, kind: TabKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            params: BTreeMap::new(),
            closable: kind != TabKind::Overview,
        }
    }

    pub fn overview() -> Self {
        Self::new(OVERVIEW_TAB_ID, TabKind::Overview, OVERVIEW_TAB_TITLE)
    }

    pub fn case(escalation_id: &str, case_number: &str) -> Self {
        let title = if case_number.trim().is_empty() {
            format!("Case {escalation_id}")
        } else {
            format!("Case #{case_number}")
        };
        Self::new(case_tab_id(escalation_id), TabKind::Case, title)
            .with_param(PARAM_ESCALATION_ID, escalation_id)
            .with_param(PARAM_CASE_NUMBER, case_number)
    }

    pub fn chat(
        escalation_id: &str,
        session_id: &str,
        business_id: &str,
        customer_name: &str,
    ) -> Self {
        let title = if customer_name.trim().is_empty() {
            "Live chat".to_string()
        } else {
            format!("Chat: {customer_name}")
        };
        Self::new(chat_tab_id(escalation_id), TabKind::Chat, title)
            .with_param(PARAM_ESCALATION_ID, escalation_id)
            .with_param(PARAM_SESSION_ID, session_id)
            .with_param(PARAM_BUSINESS_ID, business_id)
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        if !value.trim().is_empty() {
            self.params.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn is_overview(&self) -> bool {
        self.kind == TabKind::Overview && self.id == OVERVIEW_TAB_ID
    }
}

pub fn case_tab_id(escalation_id: &str) -> String {
    format!("case:{escalation_id}")
}

pub fn chat_tab_id(escalation_id: &str) -> String {
    format!("chat:{escalation_id}")
}

/// Persisted shape of the tab registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TabSnapshot {
    #[serde(default)]
    pub tabs: Vec<Tab>,
    #[serde(default)]
    pub active_tab_id: Option<String>,
}

impl Default for TabSnapshot {
    fn default() -> Self {
        Self {
            tabs: vec![Tab::overview()],
            active_tab_id: Some(OVERVIEW_TAB_ID.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatPhase {
    #[default]
    Idle,
    Assigned,
    Connected,
    Disconnected,
}

impl ChatPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatPhase::Idle => "idle",
            ChatPhase::Assigned => "assigned",
            ChatPhase::Connected => "connected",
            ChatPhase::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ChatPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatEndReason {
    AgentEnded,
    CustomerLeft,
}

/// Shared view of the single live chat. Owned and mutated by the chat controller only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatWindowState {
    pub visible: bool,
    pub escalation_id: Option<String>,
    pub session_id: Option<String>,
    pub business_id: Option<String>,
    pub customer_name: Option<String>,
    pub connected: bool,
    pub disconnected: bool,
}

impl ChatWindowState {
    pub fn phase(&self) -> ChatPhase {
        if self.escalation_id.is_none() {
            ChatPhase::Idle
        } else if self.disconnected {
            ChatPhase::Disconnected
        } else if self.connected {
            ChatPhase::Connected
        } else {
            ChatPhase::Assigned
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase() == ChatPhase::Idle
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaseSummary {
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub concern: String,
    #[serde(default)]
    pub case_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingChatNotification {
    pub escalation_id: String,
    pub summary: CaseSummary,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ToastSeverity {
    Success,
    Error,
    Info,
    Warning,
}

impl ToastSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToastSeverity::Success => "success",
            ToastSeverity::Error => "error",
            ToastSeverity::Info => "info",
            ToastSeverity::Warning => "warning",
        }
    }
}

impl fmt::Display for ToastSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Toast {
    pub id: u64,
    pub message: String,
    pub severity: ToastSeverity,
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    #[default]
    Open,
    Pending,
    Resolved,
    Closed,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Open => "open",
            EscalationStatus::Pending => "pending",
            EscalationStatus::Resolved => "resolved",
            EscalationStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "open" => Ok(EscalationStatus::Open),
            "pending" | "in-progress" | "in_progress" => Ok(EscalationStatus::Pending),
            "resolved" => Ok(EscalationStatus::Resolved),
            "closed" => Ok(EscalationStatus::Closed),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_with_camel_case_keys() {
        let snapshot = TabSnapshot {
            tabs: vec![Tab::overview(), Tab::case("esc-42", "42")],
            active_tab_id: Some(case_tab_id("esc-42")),
        };
        let raw = serde_json::to_value(&snapshot).expect("serialize snapshot");
        assert_eq!(raw["activeTabId"], "case:esc-42");
        assert_eq!(raw["tabs"][1]["kind"], "case");
        assert_eq!(raw["tabs"][1]["params"]["escalationId"], "esc-42");
        assert_eq!(raw["tabs"][0]["closable"], false);
    }

    #[test]
    fn tab_without_closable_field_defaults_to_closable() {
        let tab: Tab = serde_json::from_str(
            r#"{"id":"case:9","kind":"case","title":"Case #9","params":{"escalationId":"9"}}"#,
        )
        .expect("parse tab");
        assert!(tab.closable);
        assert_eq!(tab.param(PARAM_ESCALATION_ID), Some("9"));
    }

    #[test]
    fn chat_phase_follows_flags() {
        let mut state = ChatWindowState::default();
        assert_eq!(state.phase(), ChatPhase::Idle);

        state.escalation_id = Some("E1".to_string());
        state.visible = true;
        assert_eq!(state.phase(), ChatPhase::Assigned);

        state.connected = true;
        assert_eq!(state.phase(), ChatPhase::Connected);

        state.connected = false;
        state.disconnected = true;
        assert_eq!(state.phase(), ChatPhase::Disconnected);
    }

    #[test]
    fn chat_tab_skips_blank_params() {
        let tab = Tab::chat("E1", "S1", "", "Ada");
        assert_eq!(tab.id, "chat:E1");
        assert_eq!(tab.title, "Chat: Ada");
        assert_eq!(tab.param(PARAM_SESSION_ID), Some("S1"));
        assert_eq!(tab.param(PARAM_BUSINESS_ID), None);
    }
}
