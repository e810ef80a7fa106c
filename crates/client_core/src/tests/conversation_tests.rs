use super::*;
use std::sync::atomic::Ordering;

use crate::test_support::{record, FakeTransport, Harness};
use shared::protocol::HistoryPage;
use storage::NewChatMessage;

fn alice() -> UserId {
    UserId::new("alice")
}

fn bob() -> UserId {
    UserId::new("bob")
}

async fn seed(h: &Harness, message: shared::protocol::MessageRecord) {
    h.storage
        .put_chat_message(&NewChatMessage::from_record(&message, &alice(), &bob()))
        .await
        .expect("seed");
}

#[tokio::test]
async fn open_joins_room_and_reconciles_history() {
    let h = Harness::new("alice", FakeTransport::connected()).await;
    *h.api.history_pages.lock().expect("lock") = vec![HistoryPage {
        messages: vec![record(1, "bob", None, "earlier", 1_000)],
        has_more: false,
    }];

    let mut view = ConversationViewModel::open(h.context(), bob()).await;
    view.reconciled().await;

    assert_eq!(h.transport.joined(), vec![bob()]);
    assert!(h.state.is_room_open(view.room()));
    let messages = view.messages().await.expect("messages");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].read);

    let room = view.room().clone();
    drop(view);
    assert!(!h.state.is_room_open(&room));
}

#[tokio::test]
async fn watch_yields_current_list_then_updates() {
    let h = Harness::new("alice", FakeTransport::connected()).await;
    let view = ConversationViewModel::open(h.context(), bob()).await;
    let mut updates = view.watch();

    let initial = tokio::time::timeout(Duration::from_secs(2), updates.next())
        .await
        .expect("initial list")
        .expect("stream open");
    assert!(initial.is_empty());

    seed(&h, record(5, "bob", Some("alice"), "new", 5_000)).await;

    let next = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let list = updates.next().await.expect("stream open");
            if !list.is_empty() {
                return list;
            }
        }
    })
    .await
    .expect("update");
    assert_eq!(next[0].id, Some(MessageId(5)));
}

#[tokio::test]
async fn interleaved_inserts_come_out_time_ordered() {
    let h = Harness::new("alice", FakeTransport::connected()).await;
    let view = ConversationViewModel::open(h.context(), bob()).await;

    for (id, ms) in [(3, 3_000), (1, 1_000), (4, 3_000), (2, 2_000)] {
        seed(&h, record(id, "bob", Some("alice"), "x", ms)).await;
    }

    let messages = view.messages().await.expect("messages");
    let ids: Vec<_> = messages.iter().filter_map(|m| m.id).map(|id| id.0).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert!(messages
        .windows(2)
        .all(|pair| pair[0].created_at <= pair[1].created_at));
}

#[tokio::test]
async fn edit_is_kept_locally_when_server_rejects() {
    let h = Harness::new("alice", FakeTransport::connected()).await;
    seed(&h, record(8, "alice", Some("bob"), "draft", 1_000)).await;
    h.api.edit_fails.store(true, Ordering::SeqCst);
    let view = ConversationViewModel::open(h.context(), bob()).await;

    view.edit(MessageId(8), "final").await.expect("edit");

    let row = h
        .storage
        .get_chat_message_by_id(MessageId(8))
        .await
        .expect("get")
        .expect("row");
    assert_eq!(row.text.as_deref(), Some("final"));
    assert!(h.transport.sent().iter().any(|request| matches!(
        request,
        ClientRequest::MessageEdited { message_id, new_text }
            if *message_id == MessageId(8) && new_text == "final"
    )));
}

#[tokio::test]
async fn delete_scopes_differ_only_in_broadcast() {
    let h = Harness::new("alice", FakeTransport::connected()).await;
    seed(&h, record(1, "alice", Some("bob"), "one", 1_000)).await;
    seed(&h, record(2, "alice", Some("bob"), "two", 2_000)).await;
    let view = ConversationViewModel::open(h.context(), bob()).await;

    view.delete(MessageId(1), DeleteScope::Me).await.expect("delete me");
    assert!(h.transport.sent().is_empty());

    view.delete(MessageId(2), DeleteScope::Everyone)
        .await
        .expect("delete everyone");
    assert!(matches!(
        h.transport.sent().as_slice(),
        [ClientRequest::MessageDeleted { message_id }] if *message_id == MessageId(2)
    ));

    assert_eq!(
        h.api.deletes.lock().expect("lock").clone(),
        vec![
            (MessageId(1), DeleteScope::Me),
            (MessageId(2), DeleteScope::Everyone)
        ]
    );
    assert!(view.messages().await.expect("messages").is_empty());
}

#[tokio::test]
async fn mark_read_flips_counterpart_messages_and_clears_unread() {
    let h = Harness::new("alice", FakeTransport::connected()).await;
    seed(&h, record(1, "bob", Some("alice"), "hey", 1_000)).await;
    seed(&h, record(2, "alice", Some("bob"), "mine", 2_000)).await;
    let view = ConversationViewModel::open(h.context(), bob()).await;
    h.state.set_unread(&bob(), true);

    let flipped = view.mark_read().await.expect("mark read");

    assert_eq!(flipped, 1);
    assert!(!h.state.has_unread(&bob()));
    let mine = h
        .storage
        .get_chat_message_by_id(MessageId(2))
        .await
        .expect("get")
        .expect("row");
    assert!(!mine.read);
}

#[tokio::test]
async fn offline_send_is_visible_through_the_view() {
    let h = Harness::new("alice", FakeTransport::disconnected()).await;
    let view = ConversationViewModel::open(h.context(), bob()).await;

    let outcome = view
        .send(OutgoingPayload::Text("from the field".into()))
        .await
        .expect("send");

    let messages = view.messages().await.expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].client_ref.as_deref(), Some(outcome.client_ref()));
    assert!(!messages[0].is_durable());
}

#[tokio::test]
async fn room_is_left_when_its_last_view_closes() {
    let h = Harness::new("alice", FakeTransport::connected()).await;
    let first = ConversationViewModel::open(h.context(), bob()).await;
    let second = ConversationViewModel::open(h.context(), bob()).await;

    drop(first);
    assert!(h.transport.left().is_empty());
    assert!(h.state.is_room_open(&RoomName::between(&alice(), &bob())));

    drop(second);
    assert_eq!(h.transport.left(), vec![bob()]);
    assert!(!h.state.is_room_open(&RoomName::between(&alice(), &bob())));
}
