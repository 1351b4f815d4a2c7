use super::*;
use chrono::TimeZone;

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_704_067_200 + seconds, 0)
        .single()
        .expect("timestamp")
}

fn me() -> UserId {
    UserId::new("me")
}

fn peer() -> UserId {
    UserId::new("peer")
}

fn reconciler() -> Reconciler {
    Reconciler::new(me(), peer())
}

fn peer_message(id: &str, text: &str, seconds: i64) -> Message {
    Message::confirmed(
        MessageId::new(id),
        text,
        peer(),
        at(seconds),
        MessageStatus::Sent,
    )
}

fn own_message(id: &str, text: &str, seconds: i64, status: MessageStatus) -> Message {
    Message::confirmed(MessageId::new(id), text, me(), at(seconds), status)
}

fn ids(reconciler: &Reconciler) -> Vec<&str> {
    reconciler
        .messages()
        .iter()
        .map(|message| message.id.as_str())
        .collect()
}

fn assert_sorted(reconciler: &Reconciler) {
    assert!(reconciler
        .messages()
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));
}

#[test]
fn history_is_sorted_ascending_on_load() {
    let mut reconciler = reconciler();
    let inserted = reconciler.load_history(vec![
        peer_message("c", "third", 30),
        peer_message("a", "first", 10),
        own_message("b", "second", 20, MessageStatus::Read),
    ]);

    assert_eq!(inserted, 3);
    assert_eq!(ids(&reconciler), vec!["a", "b", "c"]);
}

#[test]
fn replaying_the_same_event_keeps_one_entry() {
    let mut reconciler = reconciler();
    reconciler.load_history(vec![peer_message("a", "hello", 10)]);

    for _ in 0..5 {
        reconciler.apply_received(peer_message("b", "again", 20));
        reconciler.apply_received(peer_message("a", "hello", 10));
    }

    assert_eq!(ids(&reconciler), vec!["a", "b"]);
}

#[test]
fn live_event_racing_history_is_not_duplicated() {
    let mut reconciler = reconciler();
    reconciler.apply_received(peer_message("b", "live", 20));

    let inserted = reconciler.load_history(vec![
        peer_message("a", "old", 10),
        peer_message("b", "live", 20),
    ]);

    assert_eq!(inserted, 1);
    assert_eq!(ids(&reconciler), vec!["a", "b"]);
}

#[test]
fn out_of_order_events_are_inserted_by_timestamp_with_ties_in_arrival_order() {
    let mut reconciler = reconciler();
    for (id, seconds) in [("e", 50), ("a", 10), ("c", 30), ("b", 30), ("d", 40), ("z", 0)] {
        reconciler.apply_received(peer_message(id, id, seconds));
        assert_sorted(&reconciler);
    }

    assert_eq!(ids(&reconciler), vec!["z", "a", "c", "b", "d", "e"]);
    assert_eq!(reconciler.get(&MessageId::new("b")).map(|m| m.text.as_str()), Some("b"));
}

#[test]
fn status_never_regresses() {
    let mut reconciler = reconciler();
    reconciler.load_history(vec![own_message("a", "hi", 10, MessageStatus::Sent)]);
    let id = MessageId::new("a");

    assert_eq!(
        reconciler.apply_status(&id, MessageStatus::Read),
        MergeOutcome::Updated { position: 0 }
    );
    assert_eq!(
        reconciler.apply_status(&id, MessageStatus::Sent),
        MergeOutcome::Unchanged
    );
    assert_eq!(
        reconciler.apply_status(&id, MessageStatus::Delivered),
        MergeOutcome::Unchanged
    );
    reconciler.apply_received(own_message("a", "hi", 10, MessageStatus::Delivered));

    assert_eq!(reconciler.get(&id).map(|m| m.status), Some(MessageStatus::Read));
}

#[test]
fn status_update_for_unknown_id_is_ignored() {
    let mut reconciler = reconciler();
    assert_eq!(
        reconciler.apply_status(&MessageId::new("missing"), MessageStatus::Read),
        MergeOutcome::Ignored
    );
    assert!(reconciler.is_empty());
}

#[test]
fn optimistic_send_is_confirmed_in_place_by_echo() {
    let mut reconciler = reconciler();
    reconciler.load_history(vec![peer_message("a", "hello", 10)]);

    let provisional = reconciler.push_provisional("hi", at(20)).expect("push");
    assert!(provisional.provisional);
    assert_eq!(provisional.status, MessageStatus::Sent);
    assert_eq!(reconciler.len(), 2);
    assert_eq!(reconciler.messages()[1].id, provisional.id);

    let outcome =
        reconciler.apply_received(own_message("srv-1", "hi", 21, MessageStatus::Delivered));

    assert_eq!(
        outcome,
        MergeOutcome::Confirmed {
            local_id: provisional.id.clone(),
            position: 1,
        }
    );
    assert_eq!(reconciler.len(), 2);
    let confirmed = &reconciler.messages()[1];
    assert_eq!(confirmed.id, MessageId::new("srv-1"));
    assert!(!confirmed.provisional);
    assert_eq!(confirmed.status, MessageStatus::Delivered);
    assert_eq!(confirmed.render_key(), &provisional.id);
    assert_eq!(reconciler.pending_count(), 0);
    assert!(reconciler.get(&provisional.id).is_none());
}

#[test]
fn echo_matches_the_most_recent_pending_send_with_same_text() {
    let mut reconciler = reconciler();
    let first = reconciler.push_provisional("hi", at(10)).expect("push");
    let second = reconciler.push_provisional("hi", at(11)).expect("push");

    reconciler.apply_received(own_message("srv-1", "hi", 11, MessageStatus::Sent));

    assert!(reconciler.is_pending(&first.id));
    assert!(!reconciler.is_pending(&second.id));
    assert_eq!(reconciler.messages()[1].id, MessageId::new("srv-1"));
}

#[test]
fn send_response_confirms_then_echo_only_updates_status() {
    let mut reconciler = reconciler();
    let provisional = reconciler.push_provisional("hi", at(10)).expect("push");

    reconciler.confirm_send(
        &provisional.id,
        SendReceipt {
            id: MessageId::new("srv-1"),
            timestamp: Some(at(10)),
            status: MessageStatus::Sent,
        },
    );
    reconciler.apply_received(own_message("srv-1", "hi", 10, MessageStatus::Delivered));
    reconciler.apply_received(own_message("srv-1", "hi", 10, MessageStatus::Delivered));

    assert_eq!(ids(&reconciler), vec!["srv-1"]);
    assert_eq!(reconciler.messages()[0].status, MessageStatus::Delivered);
}

#[test]
fn echo_then_send_response_does_not_duplicate() {
    let mut reconciler = reconciler();
    let provisional = reconciler.push_provisional("hi", at(10)).expect("push");
    reconciler.apply_received(own_message("srv-1", "hi", 10, MessageStatus::Sent));

    let outcome = reconciler.confirm_send(
        &provisional.id,
        SendReceipt {
            id: MessageId::new("srv-1"),
            timestamp: None,
            status: MessageStatus::Sent,
        },
    );

    assert_eq!(outcome, MergeOutcome::Unchanged);
    assert_eq!(ids(&reconciler), vec!["srv-1"]);
}

#[test]
fn send_response_for_an_id_already_present_drops_the_provisional_copy() {
    let mut reconciler = reconciler();
    let provisional = reconciler.push_provisional("hi", at(10)).expect("push");
    // Echo text differs from what was typed (server-side trimming), so it
    // lands as its own entry.
    reconciler.apply_received(own_message("srv-1", "hi ", 10, MessageStatus::Delivered));
    assert_eq!(reconciler.len(), 2);

    reconciler.confirm_send(
        &provisional.id,
        SendReceipt {
            id: MessageId::new("srv-1"),
            timestamp: None,
            status: MessageStatus::Sent,
        },
    );

    assert_eq!(ids(&reconciler), vec!["srv-1"]);
    assert_eq!(reconciler.messages()[0].status, MessageStatus::Delivered);
}

#[test]
fn confirmed_timestamp_is_clamped_between_neighbours() {
    let mut reconciler = reconciler();
    reconciler.load_history(vec![peer_message("a", "hello", 10)]);
    let provisional = reconciler.push_provisional("hi", at(20)).expect("push");
    reconciler.apply_received(peer_message("b", "later", 30));

    reconciler.confirm_send(
        &provisional.id,
        SendReceipt {
            id: MessageId::new("srv-1"),
            timestamp: Some(at(5)),
            status: MessageStatus::Sent,
        },
    );

    assert_eq!(ids(&reconciler), vec!["a", "srv-1", "b"]);
    assert_eq!(reconciler.messages()[1].timestamp, at(10));
    assert_sorted(&reconciler);
}

#[test]
fn failed_send_rolls_back_to_previous_length() {
    let mut reconciler = reconciler();
    reconciler.load_history(vec![peer_message("a", "hello", 10)]);
    let before = reconciler.len();

    let provisional = reconciler.push_provisional("hi", at(20)).expect("push");
    reconciler.apply_received(peer_message("b", "after", 30));
    let outcome = reconciler.rollback_send(&provisional.id);

    assert_eq!(
        outcome,
        MergeOutcome::RolledBack {
            local_id: provisional.id.clone()
        }
    );
    assert_eq!(reconciler.len(), before + 1);
    assert_eq!(ids(&reconciler), vec!["a", "b"]);
    assert_eq!(reconciler.get(&MessageId::new("b")).map(|m| m.text.as_str()), Some("after"));
    assert_eq!(reconciler.pending_count(), 0);
}

#[test]
fn rollback_after_confirmation_is_a_no_op() {
    let mut reconciler = reconciler();
    let provisional = reconciler.push_provisional("hi", at(10)).expect("push");
    reconciler.apply_received(own_message("srv-1", "hi", 10, MessageStatus::Sent));

    assert_eq!(reconciler.rollback_send(&provisional.id), MergeOutcome::Unchanged);
    assert_eq!(reconciler.len(), 1);
}

#[test]
fn blank_text_is_rejected_before_anything_is_appended() {
    let mut reconciler = reconciler();
    assert_eq!(
        reconciler.push_provisional("   \n", at(10)),
        Err(ChatError::EmptyMessage)
    );
    assert!(reconciler.is_empty());
}

#[test]
fn provisional_never_sorts_before_newest_entry() {
    let mut reconciler = reconciler();
    reconciler.apply_received(peer_message("a", "from the future", 100));
    let provisional = reconciler.push_provisional("hi", at(50)).expect("push");

    assert_eq!(provisional.timestamp, at(100));
    assert_eq!(reconciler.messages()[1].id, provisional.id);
}

#[test]
fn messages_from_other_conversations_are_ignored() {
    let mut reconciler = reconciler();
    let stranger = Message::confirmed(
        MessageId::new("x"),
        "wrong chat",
        UserId::new("someone-else"),
        at(10),
        MessageStatus::Sent,
    );

    assert_eq!(reconciler.apply_received(stranger), MergeOutcome::Ignored);
    assert!(reconciler.is_empty());
}

#[test]
fn read_receipt_is_reported_once_per_status() {
    let mut reconciler = reconciler();
    reconciler.apply_received(peer_message("a", "hello", 10));

    assert_eq!(
        reconciler.take_read_receipt(),
        Some((MessageId::new("a"), MessageStatus::Sent))
    );
    assert_eq!(reconciler.take_read_receipt(), None);
    assert_eq!(reconciler.take_read_receipt(), None);

    reconciler.apply_status(&MessageId::new("a"), MessageStatus::Delivered);
    assert_eq!(
        reconciler.take_read_receipt(),
        Some((MessageId::new("a"), MessageStatus::Delivered))
    );

    reconciler.apply_status(&MessageId::new("a"), MessageStatus::Read);
    assert_eq!(reconciler.take_read_receipt(), None);
}

#[test]
fn released_read_receipt_is_reported_again() {
    let mut reconciler = reconciler();
    reconciler.apply_received(peer_message("a", "hello", 10));

    let (id, status) = reconciler.take_read_receipt().expect("receipt");
    reconciler.release_read_receipt(&id, status);
    assert_eq!(reconciler.take_read_receipt(), Some((id.clone(), status)));

    // A stale release does not reopen a newer receipt.
    reconciler.apply_received(peer_message("b", "again", 20));
    let newer = reconciler.take_read_receipt().expect("receipt");
    reconciler.release_read_receipt(&id, status);
    assert_eq!(newer.0, MessageId::new("b"));
    assert_eq!(reconciler.take_read_receipt(), None);
}

#[test]
fn read_receipt_skips_when_newest_entry_is_own() {
    let mut reconciler = reconciler();
    reconciler.apply_received(peer_message("a", "hello", 10));
    reconciler.push_provisional("reply", at(20)).expect("push");

    assert_eq!(reconciler.take_read_receipt(), None);
}

#[test]
fn clear_drops_entries_and_pending_sends() {
    let mut reconciler = reconciler();
    reconciler.apply_received(peer_message("a", "hello", 10));
    reconciler.push_provisional("reply", at(20)).expect("push");

    reconciler.clear();

    assert!(reconciler.is_empty());
    assert_eq!(reconciler.pending_count(), 0);
    assert!(reconciler.get(&MessageId::new("a")).is_none());
}
