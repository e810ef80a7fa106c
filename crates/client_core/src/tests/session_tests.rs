use super::*;
use shared::{
    domain::{MessageId, Role},
    protocol::ServerEvent,
};

use crate::{
    outbox::{OutgoingPayload, SendOutcome},
    test_support::{at, memory_store, record, FakeChatApi, FakeReportSink, FakeTransport, RecordingNotifier},
};

struct Fixture {
    session: ChatSession,
    api: Arc<FakeChatApi>,
    transport: Arc<FakeTransport>,
    notifier: Arc<RecordingNotifier>,
}

async fn start(transport: Arc<FakeTransport>) -> Fixture {
    start_with(transport, FakeChatApi::new("alice")).await
}

async fn start_with(transport: Arc<FakeTransport>, api: Arc<FakeChatApi>) -> Fixture {
    let notifier = Arc::new(RecordingNotifier::default());
    let settings = ClientSettings {
        watch_min_interval_ms: 5,
        ..ClientSettings::default()
    };
    let session = ChatSession::start(
        SessionDeps {
            identity: Identity {
                user_id: UserId::new("alice"),
                role: Role::Supervisor,
                user_name: "Alice".into(),
            },
            storage: memory_store().await,
            api: api.clone(),
            transport: transport.clone(),
            reports: Arc::new(FakeReportSink::default()),
            notifier: notifier.clone(),
        },
        &settings,
    );
    Fixture {
        session,
        api,
        transport,
        notifier,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn offline_send_drains_when_connection_returns() {
    let f = start(FakeTransport::disconnected()).await;
    let view = f.session.open_conversation(UserId::new("bob")).await;

    let outcome = view
        .send(OutgoingPayload::Text("written in the basement".into()))
        .await
        .expect("send");
    assert!(matches!(outcome, SendOutcome::Queued { .. }));
    assert_eq!(f.session.outbox().pending_count().await.expect("count"), 1);

    f.transport.set_connected(true);

    let api = f.api.clone();
    assert!(eventually(move || api.posted_texts() == vec!["written in the basement".to_string()]).await);
    let mut drained = false;
    for _ in 0..100 {
        if f.session.outbox().pending_count().await.expect("count") == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(drained);

    let messages = view.messages().await.expect("messages");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_durable());
    f.session.shutdown().await;
}

#[tokio::test]
async fn live_events_reach_the_store_and_notifier() {
    let f = start(FakeTransport::connected()).await;
    let mut events = f.session.subscribe();

    f.transport.push(ServerEvent::PrivateMessage {
        message: record(3, "bob", Some("alice"), "status?", 1_000),
    });

    let storage = f.session.storage().clone();
    let mut stored = false;
    for _ in 0..200 {
        if storage
            .get_chat_message_by_id(MessageId(3))
            .await
            .expect("get")
            .is_some()
        {
            stored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(stored);

    let notifier = f.notifier.clone();
    assert!(eventually(move || notifier.sound_count() == 1).await);
    assert!(f.session.state().has_unread(&UserId::new("bob")));

    let mut saw_notification = false;
    while let Ok(event) = events.try_recv() {
        saw_notification |= matches!(event, SessionEvent::ChatNotification { .. });
    }
    assert!(saw_notification);
    f.session.shutdown().await;
}

#[tokio::test]
async fn notification_read_is_local_then_confirmed() {
    let f = start(FakeTransport::connected()).await;
    f.session
        .storage()
        .put_notification(&NotificationRecord {
            id: NotificationId(8),
            title: "Shift change".into(),
            message: "Night crew on site".into(),
            kind: "roster".into(),
            read: false,
            created_at: at(1_000),
            link: None,
        })
        .await
        .expect("put");

    f.session
        .mark_notification_read(NotificationId(8))
        .await
        .expect("mark read");

    let cached = f.session.notifications().await.expect("list");
    assert!(cached[0].read);
    assert_eq!(
        f.api.notifications_read.lock().expect("lock").clone(),
        vec![NotificationId(8)]
    );
    f.session.shutdown().await;
}

#[tokio::test]
async fn start_while_connected_seeds_unread_state() {
    let api = FakeChatApi::new("alice");
    *api.unread_senders.lock().expect("lock") = vec![UserId::new("carol")];
    let f = start_with(FakeTransport::connected(), api).await;

    let state = f.session.state().clone();
    assert!(eventually(move || state.has_unread(&UserId::new("carol"))).await);
    assert!(f.session.wait_connected(Duration::from_millis(50)).await);

    f.session.shutdown().await;
    assert_eq!(*f.transport.state().borrow(), ConnectionState::Closed);
}
