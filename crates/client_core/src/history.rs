use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, MessageStatus, UserId},
    protocol::{WireMessageRecord, WireSender, WireTimestamp},
};
use tracing::warn;
use uuid::Uuid;

use crate::types::Message;

/// Maps a backend record onto the canonical message, applying defaults:
/// missing id is derived from the record's content, missing status is
/// `sent`, missing timestamp is `received_at`. Records without text or
/// sender are dropped.
pub fn normalize_record(record: WireMessageRecord, received_at: DateTime<Utc>) -> Option<Message> {
    let record_id = record.record_id();
    let Some(text) = record.message.filter(|text| !text.trim().is_empty()) else {
        warn!(message_id = ?record_id, "history: dropping record without text");
        return None;
    };
    let Some(sender) = record.sender.as_ref().and_then(WireSender::user_id) else {
        warn!(message_id = ?record_id, "history: dropping record without sender");
        return None;
    };

    let sent_at = record.timestamp.as_ref().and_then(WireTimestamp::to_datetime);
    let id = record_id.unwrap_or_else(|| derived_id(&sender, sent_at, &text));
    let status = match record.status.as_deref() {
        None => MessageStatus::Sent,
        Some(raw) => MessageStatus::parse(raw).unwrap_or_else(|| {
            warn!(message_id = %id, status = raw, "history: unknown status; using sent");
            MessageStatus::Sent
        }),
    };

    let timestamp = sent_at.unwrap_or(received_at);
    Some(Message::confirmed(id, text, sender, timestamp, status))
}

/// Stable id for a record the backend sent without one, so the same record
/// fetched twice merges into one entry.
fn derived_id(sender: &UserId, sent_at: Option<DateTime<Utc>>, text: &str) -> MessageId {
    let sent_at = sent_at.map(|at| at.to_rfc3339()).unwrap_or_default();
    let key = format!("{sender}\n{sent_at}\n{text}");
    MessageId(format!("gen-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())))
}

/// Normalizes a history page and orders it ascending by timestamp, keeping
/// server order for equal timestamps.
pub fn normalize_history(
    records: Vec<WireMessageRecord>,
    fetched_at: DateTime<Utc>,
) -> Vec<Message> {
    let mut messages: Vec<Message> = records
        .into_iter()
        .filter_map(|record| normalize_record(record, fetched_at))
        .collect();
    messages.sort_by_key(|message| message.timestamp);
    messages
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
