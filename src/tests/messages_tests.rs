use super::support::{FakeBackend, drain, errors, payload};
use crate::messages::MessageStream;
use crate::model::{ContactId, DeliveryStatus, Message};
use crate::notify::{NoticeReceiver, Notifier};
use crate::{Error, FetchOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn setup() -> (Arc<FakeBackend>, MessageStream, NoticeReceiver) {
    let backend = Arc::new(FakeBackend::new());
    let (notifier, rx) = Notifier::channel();
    let stream = MessageStream::new(backend.clone(), notifier, CancellationToken::new());
    (backend, stream, rx)
}

fn incoming(contact: &str, id: &str, timestamp: i64) -> Message {
    Message::from_payload(ContactId::new(contact), payload(id, "hello", timestamp))
}

fn echo(contact: &str, content: &str) -> Message {
    Message {
        id: None,
        correlation_id: None,
        from_me: true,
        content: content.to_string(),
        ..incoming(contact, "unused", 0)
    }
}

fn ids(messages: &[Message]) -> Vec<Option<&str>> {
    messages.iter().map(|m| m.id.as_deref()).collect()
}

#[tokio::test]
async fn test_history_is_sorted_by_timestamp() {
    let (backend, stream, _rx) = setup();
    backend.set_history("c1", vec![payload("B", "b", 2000), payload("A", "a", 1000)]);

    let outcome = stream
        .load_history(ContactId::new("c1"))
        .await
        .expect("Failed to load history");

    assert_eq!(outcome, FetchOutcome::Applied);
    assert_eq!(ids(&stream.messages().await), vec![Some("A"), Some("B")]);
}

#[tokio::test]
async fn test_push_after_history_with_same_id_is_dropped() {
    let (backend, stream, _rx) = setup();
    backend.set_history("c1", vec![payload("A", "a", 1000), payload("X", "x", 1500)]);
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");

    assert!(!stream.append_incoming(incoming("c1", "X", 1500)).await);

    let messages = stream.messages().await;
    assert_eq!(messages.iter().filter(|m| m.id.as_deref() == Some("X")).count(), 1);
}

#[tokio::test]
async fn test_history_after_push_with_same_id_keeps_one_copy() {
    let (backend, stream, _rx) = setup();
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");
    assert!(stream.append_incoming(incoming("c1", "X", 1500)).await);

    backend.set_history("c1", vec![payload("A", "a", 1000), payload("X", "x", 1500)]);
    stream.load_history(ContactId::new("c1")).await.expect("Failed to reload");

    assert_eq!(ids(&stream.messages().await), vec![Some("A"), Some("X")]);
}

#[tokio::test]
async fn test_duplicate_push_only_moves_status_forward() {
    let (_backend, stream, _rx) = setup();
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");
    stream.append_incoming(incoming("c1", "X", 1000)).await;

    let mut read = incoming("c1", "X", 1000);
    read.status = DeliveryStatus::Read;
    assert!(!stream.append_incoming(read).await);
    assert_eq!(stream.messages().await[0].status, DeliveryStatus::Read);

    // A late, older status never downgrades
    assert!(!stream.append_incoming(incoming("c1", "X", 1000)).await);
    assert_eq!(stream.messages().await[0].status, DeliveryStatus::Read);
}

#[tokio::test]
async fn test_live_messages_are_inserted_in_timestamp_order() {
    let (backend, stream, _rx) = setup();
    backend.set_history("c1", vec![payload("A", "a", 1000), payload("C", "c", 3000)]);
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");

    stream.append_incoming(incoming("c1", "B", 2000)).await;
    stream.append_incoming(incoming("c1", "D", 4000)).await;

    let messages = stream.messages().await;
    assert_eq!(ids(&messages), vec![Some("A"), Some("B"), Some("C"), Some("D")]);
    assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_optimistic_entry_is_appended_even_when_clock_lags() {
    let (_backend, stream, _rx) = setup();
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");
    let future = chrono::Utc::now().timestamp_millis() + 3_600_000;
    stream.append_incoming(incoming("c1", "F", future)).await;

    let pending = stream.append_optimistic("on my way").await.expect("Failed to append");

    let messages = stream.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].correlation_id, pending.correlation_id);
    assert_eq!(messages[1].status, DeliveryStatus::Pending);
    // The only permitted ordering exception: an optimistic entry after a newer one
    assert!(messages[1].timestamp < messages[0].timestamp);
    assert!(messages[1].is_optimistic());
}

#[tokio::test]
async fn test_message_for_other_contact_is_ignored() {
    let (_backend, stream, _rx) = setup();
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");

    assert!(!stream.append_incoming(incoming("c2", "Z", 1000)).await);
    assert!(stream.messages().await.is_empty());
}

#[tokio::test]
async fn test_optimistic_requires_open_conversation() {
    let (_backend, stream, _rx) = setup();
    let err = stream.append_optimistic("hi").await.expect_err("Should fail");
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn test_switching_contact_empties_stream_at_once() {
    let (backend, stream, _rx) = setup();
    backend.set_history("c1", vec![payload("A", "a", 1000)]);
    backend.set_history("c2", vec![payload("B", "b", 1000)]);
    backend.delay_history("c2", Duration::from_millis(300));
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");

    let loader = stream.clone();
    let handle = tokio::spawn(async move { loader.load_history(ContactId::new("c2")).await });
    tokio::task::yield_now().await;

    assert_eq!(stream.contact().await, Some(ContactId::new("c2")));
    assert!(stream.messages().await.is_empty());

    handle.await.expect("join").expect("Failed to load");
    assert_eq!(ids(&stream.messages().await), vec![Some("B")]);
}

#[tokio::test(start_paused = true)]
async fn test_stale_history_response_is_discarded() {
    let (backend, stream, _rx) = setup();
    backend.set_history("c1", vec![payload("A", "a", 1000)]);
    backend.delay_history("c1", Duration::from_millis(500));
    backend.set_history("c2", vec![payload("B", "b", 1000)]);

    let loader = stream.clone();
    let slow = tokio::spawn(async move { loader.load_history(ContactId::new("c1")).await });
    tokio::task::yield_now().await;

    stream.load_history(ContactId::new("c2")).await.expect("Failed to load");
    let outcome = slow.await.expect("join").expect("Failed to load");

    assert_eq!(outcome, FetchOutcome::Superseded);
    assert_eq!(stream.contact().await, Some(ContactId::new("c2")));
    assert_eq!(ids(&stream.messages().await), vec![Some("B")]);
}

#[tokio::test]
async fn test_echo_is_absorbed_by_optimistic_entry() {
    let (_backend, stream, _rx) = setup();
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");
    stream.append_optimistic("hi").await.expect("Failed to append");

    assert!(!stream.append_incoming(echo("c1", "hi")).await);
    assert_eq!(stream.messages().await.len(), 1);

    // A second echo has nothing left to absorb it
    assert!(stream.append_incoming(echo("c1", "hi")).await);
    assert_eq!(stream.messages().await.len(), 2);
}

#[tokio::test]
async fn test_echo_without_optimistic_entry_is_shown() {
    let (_backend, stream, _rx) = setup();
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");

    assert!(stream.append_incoming(echo("c1", "sent from phone")).await);
    let messages = stream.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].from_me);
}

#[tokio::test]
async fn test_confirm_sets_server_id_and_dedups_later_push() {
    let (_backend, stream, _rx) = setup();
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");
    let pending = stream.append_optimistic("hi").await.expect("Failed to append");
    let correlation_id = pending.correlation_id.expect("correlation id");

    assert!(
        stream
            .confirm_optimistic(correlation_id, Some("S1".to_string()), DeliveryStatus::ServerAck)
            .await
    );
    let messages = stream.messages().await;
    assert_eq!(messages[0].id.as_deref(), Some("S1"));
    assert_eq!(messages[0].status, DeliveryStatus::ServerAck);

    let mut push = incoming("c1", "S1", messages[0].timestamp);
    push.from_me = true;
    assert!(!stream.append_incoming(push).await);
    assert_eq!(stream.messages().await.len(), 1);
}

#[tokio::test]
async fn test_confirm_after_push_won_race_keeps_single_copy() {
    let (_backend, stream, _rx) = setup();
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");
    let pending = stream.append_optimistic("hi").await.expect("Failed to append");

    let mut push = incoming("c1", "S1", pending.timestamp);
    push.from_me = true;
    push.content = "hi".to_string();
    assert!(stream.append_incoming(push).await);

    stream
        .confirm_optimistic(
            pending.correlation_id.expect("correlation id"),
            Some("S1".to_string()),
            DeliveryStatus::Sent,
        )
        .await;

    let messages = stream.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_deref(), Some("S1"));
    assert!(messages[0].correlation_id.is_none());
}

#[tokio::test]
async fn test_confirm_without_server_id_marks_sent() {
    let (_backend, stream, _rx) = setup();
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");
    let pending = stream.append_optimistic("hi").await.expect("Failed to append");

    stream
        .confirm_optimistic(pending.correlation_id.expect("correlation id"), None, DeliveryStatus::Pending)
        .await;

    let messages = stream.messages().await;
    assert_eq!(messages[0].id, None);
    assert_eq!(messages[0].status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn test_rollback_removes_entry() {
    let (_backend, stream, _rx) = setup();
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");
    let pending = stream.append_optimistic("hi").await.expect("Failed to append");

    assert!(stream.rollback_optimistic(pending.correlation_id.expect("correlation id")).await);
    assert!(stream.messages().await.is_empty());
    assert!(!stream.rollback_optimistic(pending.correlation_id.expect("correlation id")).await);
}

#[tokio::test]
async fn test_reload_keeps_pending_optimistic_entry() {
    let (backend, stream, _rx) = setup();
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");
    stream.append_optimistic("still sending").await.expect("Failed to append");

    backend.set_history("c1", vec![payload("A", "a", 1000)]);
    stream.load_history(ContactId::new("c1")).await.expect("Failed to reload");

    let messages = stream.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id.as_deref(), Some("A"));
    assert!(messages[1].is_optimistic());
}

#[tokio::test]
async fn test_clear_drops_conversation() {
    let (backend, stream, _rx) = setup();
    backend.set_history("c1", vec![payload("A", "a", 1000)]);
    stream.load_history(ContactId::new("c1")).await.expect("Failed to load");

    stream.clear().await;

    assert_eq!(stream.contact().await, None);
    assert!(stream.messages().await.is_empty());
    assert!(!stream.append_incoming(incoming("c1", "B", 2000)).await);
}

#[tokio::test]
async fn test_cancelled_load_reports_cancelled_without_notice() {
    let backend = Arc::new(FakeBackend::new());
    let (notifier, mut rx) = Notifier::channel();
    let cancel = CancellationToken::new();
    let stream = MessageStream::new(backend, notifier, cancel.clone());

    cancel.cancel();
    let err = stream
        .load_history(ContactId::new("c1"))
        .await
        .expect_err("Should be cancelled");

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(errors(&drain(&mut rx)), 0);
}
