use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{MessageId, MessageStatus, UserId};
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{ChatError, ChatResult},
    types::Message,
};

const LOCAL_ID_PREFIX: &str = "local-";

/// Result of feeding one input into the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted { position: usize },
    Updated { position: usize },
    Confirmed { local_id: MessageId, position: usize },
    RolledBack { local_id: MessageId },
    Unchanged,
    Ignored,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Unchanged | Self::Ignored)
    }
}

#[derive(Debug, Clone)]
struct PendingSend {
    text: String,
    seq: u64,
}

/// Server-side facts about a confirmed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub id: MessageId,
    pub timestamp: Option<DateTime<Utc>>,
    pub status: MessageStatus,
}

/// Ordered, duplicate-free message sequence of one conversation.
///
/// All three input sources (history, live events, local sends) go through
/// this type. Entries are kept sorted by timestamp with ties in arrival
/// order, and `index` maps every id to its position.
#[derive(Debug)]
pub struct Reconciler {
    current_user: UserId,
    peer: UserId,
    messages: Vec<Message>,
    index: HashMap<MessageId, usize>,
    pending: HashMap<MessageId, PendingSend>,
    next_pending_seq: u64,
    last_read_receipt: Option<(MessageId, MessageStatus)>,
}

impl Reconciler {
    pub fn new(current_user: UserId, peer: UserId) -> Self {
        Self {
            current_user,
            peer,
            messages: Vec::new(),
            index: HashMap::new(),
            pending: HashMap::new(),
            next_pending_seq: 0,
            last_read_receipt: None,
        }
    }

    pub fn current_user(&self) -> &UserId {
        &self.current_user
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.index.get(id).map(|position| &self.messages[*position])
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, local_id: &MessageId) -> bool {
        self.pending.contains_key(local_id)
    }

    /// Seeds the sequence with fetched history. Entries already known by id
    /// (for example live events that raced the fetch) are only status-merged.
    pub fn load_history(&mut self, mut history: Vec<Message>) -> usize {
        history.sort_by_key(|message| message.timestamp);
        let mut inserted = 0;
        for message in history {
            if let MergeOutcome::Inserted { .. } = self.merge_confirmed(message) {
                inserted += 1;
            }
        }
        debug!(
            peer = %self.peer,
            inserted,
            total = self.messages.len(),
            "reconciler: history merged"
        );
        inserted
    }

    /// Appends a provisional entry for a local send and returns it.
    pub fn push_provisional(&mut self, text: &str, now: DateTime<Utc>) -> ChatResult<Message> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let local_id = MessageId(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()));
        let timestamp = self
            .messages
            .last()
            .map_or(now, |last| last.timestamp.max(now));
        let message = Message::provisional(
            local_id.clone(),
            text,
            self.current_user.clone(),
            timestamp,
        );

        let position = self.messages.len();
        self.messages.push(message.clone());
        self.index.insert(local_id.clone(), position);
        self.pending.insert(
            local_id,
            PendingSend {
                text: text.to_string(),
                seq: self.next_pending_seq,
            },
        );
        self.next_pending_seq += 1;
        Ok(message)
    }

    /// Merges an inbound `receive_message` event.
    pub fn apply_received(&mut self, incoming: Message) -> MergeOutcome {
        if self.index.contains_key(&incoming.id) {
            return self.merge_confirmed(incoming);
        }

        if incoming.sender == self.current_user {
            if let Some(local_id) = self.latest_pending_matching(&incoming.text) {
                let receipt = SendReceipt {
                    id: incoming.id,
                    timestamp: Some(incoming.timestamp),
                    status: incoming.status,
                };
                return self.confirm_in_place(&local_id, receipt);
            }
        } else if incoming.sender != self.peer {
            debug!(
                peer = %self.peer,
                sender = %incoming.sender,
                message_id = %incoming.id,
                "reconciler: ignoring message from another conversation"
            );
            return MergeOutcome::Ignored;
        }

        self.merge_confirmed(incoming)
    }

    /// Confirms a provisional send from the send request's response.
    pub fn confirm_send(&mut self, local_id: &MessageId, receipt: SendReceipt) -> MergeOutcome {
        if !self.pending.contains_key(local_id) {
            return MergeOutcome::Unchanged;
        }

        if self.index.contains_key(&receipt.id) {
            // The echo landed as its own entry first; the provisional copy goes.
            let status = receipt.status;
            self.remove_entry(local_id);
            if let Some(position) = self.index.get(&receipt.id).copied() {
                raise_status(&mut self.messages[position].status, status);
            }
            return MergeOutcome::RolledBack {
                local_id: local_id.clone(),
            };
        }

        self.confirm_in_place(local_id, receipt)
    }

    /// Removes a provisional entry whose send failed. Confirmed entries are
    /// never removed.
    pub fn rollback_send(&mut self, local_id: &MessageId) -> MergeOutcome {
        if !self.pending.contains_key(local_id) {
            return MergeOutcome::Unchanged;
        }
        self.remove_entry(local_id);
        MergeOutcome::RolledBack {
            local_id: local_id.clone(),
        }
    }

    /// Applies a `message_status_updated` event. Unknown ids and regressions
    /// are ignored.
    pub fn apply_status(&mut self, id: &MessageId, status: MessageStatus) -> MergeOutcome {
        let Some(position) = self.index.get(id).copied() else {
            return MergeOutcome::Ignored;
        };
        if raise_status(&mut self.messages[position].status, status) {
            MergeOutcome::Updated { position }
        } else {
            MergeOutcome::Unchanged
        }
    }

    /// Newest entry and its status if it needs a read receipt. Each
    /// (message, status) pair is handed out once unless released.
    pub fn take_read_receipt(&mut self) -> Option<(MessageId, MessageStatus)> {
        let newest = self.messages.last()?;
        if newest.sender != self.peer || newest.status == MessageStatus::Read {
            return None;
        }
        let key = (newest.id.clone(), newest.status);
        if self.last_read_receipt.as_ref() == Some(&key) {
            return None;
        }
        self.last_read_receipt = Some(key.clone());
        Some(key)
    }

    /// Hands a receipt that could not be delivered back, so the next
    /// `take_read_receipt` reports it again.
    pub fn release_read_receipt(&mut self, id: &MessageId, status: MessageStatus) {
        if self
            .last_read_receipt
            .as_ref()
            .is_some_and(|(taken, taken_status)| taken == id && *taken_status == status)
        {
            self.last_read_receipt = None;
        }
    }

    /// Drops every entry and pending send.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
        self.pending.clear();
        self.last_read_receipt = None;
    }

    fn latest_pending_matching(&self, text: &str) -> Option<MessageId> {
        self.pending
            .iter()
            .filter(|(_, pending)| pending.text == text)
            .max_by_key(|(_, pending)| pending.seq)
            .map(|(local_id, _)| local_id.clone())
    }

    fn merge_confirmed(&mut self, incoming: Message) -> MergeOutcome {
        if let Some(position) = self.index.get(&incoming.id).copied() {
            return if raise_status(&mut self.messages[position].status, incoming.status) {
                MergeOutcome::Updated { position }
            } else {
                MergeOutcome::Unchanged
            };
        }

        let position = self
            .messages
            .partition_point(|existing| existing.timestamp <= incoming.timestamp);
        self.messages.insert(position, incoming);
        self.reindex_from(position);
        MergeOutcome::Inserted { position }
    }

    fn confirm_in_place(&mut self, local_id: &MessageId, receipt: SendReceipt) -> MergeOutcome {
        let Some(position) = self.index.remove(local_id) else {
            return MergeOutcome::Unchanged;
        };
        self.pending.remove(local_id);

        let lower = position
            .checked_sub(1)
            .map(|previous| self.messages[previous].timestamp);
        let upper = self
            .messages
            .get(position + 1)
            .map(|next| next.timestamp);

        let entry = &mut self.messages[position];
        entry.id = receipt.id.clone();
        entry.provisional = false;
        raise_status(&mut entry.status, receipt.status);
        if let Some(server_time) = receipt.timestamp {
            entry.timestamp = clamp_timestamp(server_time, lower, upper);
        }
        self.index.insert(receipt.id, position);

        MergeOutcome::Confirmed {
            local_id: local_id.clone(),
            position,
        }
    }

    fn remove_entry(&mut self, local_id: &MessageId) {
        self.pending.remove(local_id);
        if let Some(position) = self.index.remove(local_id) {
            self.messages.remove(position);
            self.reindex_from(position);
        }
    }

    fn reindex_from(&mut self, start: usize) {
        for (offset, message) in self.messages[start..].iter().enumerate() {
            self.index.insert(message.id.clone(), start + offset);
        }
    }
}

/// Raises `current` to `next` if that moves forward; returns whether it did.
fn raise_status(current: &mut MessageStatus, next: MessageStatus) -> bool {
    if next > *current {
        *current = next;
        true
    } else {
        false
    }
}

/// Keeps a confirmed entry between its neighbours so the sequence stays
/// sorted without moving the entry.
fn clamp_timestamp(
    value: DateTime<Utc>,
    lower: Option<DateTime<Utc>>,
    upper: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let value = lower.map_or(value, |lower| value.max(lower));
    upper.map_or(value, |upper| value.min(upper))
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
