use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

use shared::{
    domain::{Identity, NotificationId, UserId},
    protocol::NotificationRecord,
};
use storage::Storage;

use crate::{
    api::{ChatApi, HttpChatApi, HttpReportSink, ReportSink},
    config::{prepare_database_url, ClientSettings},
    conversation::{ConversationContext, ConversationViewModel},
    error::ChatError,
    history::HistoryReconciler,
    live::{LiveEventHandler, SessionEvent, SessionState},
    notify::Notifier,
    outbox::OutboxManager,
    transport::{websocket_url, ConnectionState, RealtimeTransport, WsTransport},
};

/// Collaborators for [`ChatSession::start`].
pub struct SessionDeps {
    pub identity: Identity,
    pub storage: Storage,
    pub api: Arc<dyn ChatApi>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub reports: Arc<dyn ReportSink>,
    pub notifier: Arc<dyn Notifier>,
}

/// One authenticated session: a realtime connection plus the tasks that keep
/// the local store in step with it. Shut it down on logout or identity change.
pub struct ChatSession {
    identity: Identity,
    storage: Storage,
    api: Arc<dyn ChatApi>,
    transport: Arc<dyn RealtimeTransport>,
    state: Arc<SessionState>,
    outbox: Arc<OutboxManager>,
    context: ConversationContext,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatSession {
    /// Opens the local store and the realtime connection described by
    /// `settings`. A store that cannot be opened degrades to an in-memory one.
    pub async fn connect(
        settings: &ClientSettings,
        identity: Identity,
        token: Option<String>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let database_url = prepare_database_url(&settings.database_url)?;
        let storage = match Storage::new(&database_url).await {
            Ok(storage) => storage,
            Err(err) => {
                warn!(%database_url, error = %err, "store: falling back to in-memory store");
                Storage::new("sqlite::memory:")
                    .await
                    .context("failed to open in-memory fallback store")?
            }
        };

        let api = HttpChatApi::new(&settings.server_url, token.clone(), settings.http_timeout())?;
        let reports: Arc<dyn ReportSink> = Arc::new(HttpReportSink::new(api.clone()));
        let url = websocket_url(&settings.server_url, &identity, token.as_deref())?;
        let transport: Arc<dyn RealtimeTransport> =
            Arc::new(WsTransport::spawn(url, settings.reconnect_backoff()));

        Ok(Self::start(
            SessionDeps {
                identity,
                storage,
                api: Arc::new(api),
                transport,
                reports,
                notifier,
            },
            settings,
        ))
    }

    /// Wires the components together and spawns the live handler and the
    /// outbox trigger loop. Must run inside a tokio runtime.
    pub fn start(deps: SessionDeps, settings: &ClientSettings) -> Self {
        let SessionDeps {
            identity,
            storage,
            api,
            transport,
            reports,
            notifier,
        } = deps;
        let me = identity.user_id.clone();
        let state = SessionState::new(me.clone(), notifier);

        let handler = Arc::new(LiveEventHandler::new(
            storage.clone(),
            Arc::clone(&api),
            Arc::clone(&state),
        ));
        let events = transport.subscribe();
        let already_connected = transport.is_connected();
        let mut tasks = vec![Arc::clone(&handler).spawn(events)];
        if already_connected {
            tasks.push(tokio::spawn(async move {
                if let Err(err) = handler.seed_from_server().await {
                    warn!(error = %err, "realtime: initial seed failed");
                }
            }));
        }

        let outbox = Arc::new(OutboxManager::new(
            me,
            storage.clone(),
            Arc::clone(&api),
            Arc::clone(&transport),
            reports,
        ));
        tasks.push(Arc::clone(&outbox).spawn_trigger_loop());

        let history = HistoryReconciler::new(
            storage.clone(),
            Arc::clone(&api),
            settings.history_page_size,
            settings.history_max_pages,
        );
        let context = ConversationContext {
            storage: storage.clone(),
            api: Arc::clone(&api),
            transport: Arc::clone(&transport),
            outbox: Arc::clone(&outbox),
            history,
            state: Arc::clone(&state),
            watch_min_interval: settings.watch_min_interval(),
        };

        info!(user_id = %identity.user_id, role = identity.role.as_str(), "session: started");
        Self {
            identity,
            storage,
            api,
            transport,
            state,
            outbox,
            context,
            tasks,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn outbox(&self) -> &Arc<OutboxManager> {
        &self.outbox
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.state()
    }

    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        self.state.set_notifier(notifier);
    }

    pub async fn open_conversation(&self, counterpart: UserId) -> ConversationViewModel {
        ConversationViewModel::open(self.context.clone(), counterpart).await
    }

    pub async fn notifications(&self) -> Result<Vec<NotificationRecord>> {
        self.storage.list_notifications().await
    }

    /// Local flag first; a failed server call keeps it.
    pub async fn mark_notification_read(&self, id: NotificationId) -> Result<(), ChatError> {
        self.storage
            .mark_notification_read(id)
            .await
            .map_err(ChatError::Storage)?;
        if let Err(err) = self.api.mark_notification_read(id).await {
            warn!(%id, error = %err, "session: notification read not confirmed by server");
        }
        Ok(())
    }

    /// Waits up to `timeout` for the realtime connection to come up.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.transport.state();
        let connected = async {
            loop {
                if *state.borrow_and_update() == ConnectionState::Connected {
                    return true;
                }
                if state.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, connected).await.unwrap_or(false)
    }

    /// Detaches every listener and closes the socket.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.transport.close().await;
        info!(user_id = %self.identity.user_id, "session: shut down");
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
