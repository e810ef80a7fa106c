//! Offline-capable realtime chat engine: local store synchronisation,
//! realtime transport, history reconciliation and the outbox.

pub mod api;
pub mod config;
pub mod conversation;
pub mod error;
pub mod history;
pub mod live;
pub mod notify;
pub mod outbox;
pub mod session;
pub mod transport;

pub use api::{ChatApi, HttpChatApi, HttpReportSink, MediaUpload, ReportDraft, ReportSink};
pub use config::{load_settings, prepare_database_url, ClientSettings};
pub use conversation::{ConversationContext, ConversationViewModel};
pub use error::{ChatError, TransportError};
pub use history::{HistoryReconciler, ReconcileReport};
pub use live::{LiveEventHandler, RoomGuard, SessionEvent, SessionState};
pub use notify::{notification_sound, LogNotifier, Notifier};
pub use outbox::{
    AudioClip, DrainReport, OutboxManager, OutgoingPayload, ReportOutcome, SendOutcome,
};
pub use session::{ChatSession, SessionDeps};
pub use transport::{
    websocket_url, ConnectionState, RealtimeTransport, TransportEvent, WsTransport,
};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
