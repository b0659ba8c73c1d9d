//! Agent workspace for the helpdesk cockpit: tabs, the live chat, hand-off queue, toasts,
//! and the push channel that feeds them.

pub mod broker;
pub mod chat;
pub mod config;
pub mod escalation;
pub mod realtime;
pub mod tabs;
pub mod workspace;

pub use broker::{NotificationBroker, Notifier, ToastEvent, ToastSubscription};
pub use chat::{ChatAssignment, ChatEnded, ChatError, ChatSessionController};
pub use config::{ConfigError, DeskConfig};
pub use escalation::{
    CaseStatusBoard, EscalationApi, EscalationQuery, EscalationRecord, HttpEscalationClient,
    LookupError,
};
pub use realtime::{
    ChannelConfig, ChannelError, ChannelLink, ChannelSignal, ConnectionManager, RealtimeAdapter,
};
pub use tabs::{DefaultTabResolver, RestoreReport, TabError, TabRegistry, TabResolver};
pub use workspace::{Workspace, WorkspaceError};
