use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use shared::domain::{MessageId, MessageStatus, PeerRef, UserId};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelEvent, ChannelHandler, ChannelManager, OutboundMessage},
    config::ClientSettings,
    credentials::CredentialProvider,
    error::{ChatError, ChatResult},
    history::normalize_record,
    reconciler::Reconciler,
    rest::{ChatApi, HttpChatApi},
    transport::{ChannelConnector, WebSocketConnector},
    types::{ChannelState, Message, SessionPhase},
    ClientEvent,
};

/// Collaborators every conversation session is built from.
#[derive(Clone)]
pub struct SessionContext {
    pub api: Arc<dyn ChatApi>,
    pub connector: Arc<dyn ChannelConnector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub auth_timeout: Duration,
}

impl SessionContext {
    /// HTTP backend plus WebSocket channel, both addressed by `settings`.
    pub fn from_settings(
        settings: &ClientSettings,
        credentials: Arc<dyn CredentialProvider>,
    ) -> ChatResult<Self> {
        let socket_url = settings.socket_url()?;
        Ok(Self {
            api: Arc::new(HttpChatApi::new(settings.clone(), Arc::clone(&credentials))),
            connector: Arc::new(WebSocketConnector::new(socket_url, settings.connect_timeout)),
            credentials,
            auth_timeout: settings.auth_timeout,
        })
    }
}

struct SessionState {
    reconciler: Reconciler,
    phase: SessionPhase,
    /// Bumped by open, reconnect and close. Guards channel and history results.
    generation: u64,
    /// Bumped by open and close only. Guards send results, which stay valid
    /// across a reconnect because the sequence is kept.
    lifetime: u64,
}

impl SessionState {
    /// Applies readiness flags and returns the new phase if it changed.
    fn advance(
        &mut self,
        history_loaded: Option<bool>,
        channel_ready: Option<bool>,
    ) -> Option<SessionPhase> {
        let (mut history, mut channel) = match self.phase {
            SessionPhase::Closed => return None,
            SessionPhase::Opening {
                history_loaded,
                channel_ready,
            } => (history_loaded, channel_ready),
            SessionPhase::Active => (true, true),
        };
        if let Some(value) = history_loaded {
            history = value;
        }
        if let Some(value) = channel_ready {
            channel = value;
        }
        let next = if history && channel {
            SessionPhase::Active
        } else {
            SessionPhase::Opening {
                history_loaded: history,
                channel_ready: channel,
            }
        };
        if next == self.phase {
            return None;
        }
        self.phase = next;
        Some(next)
    }
}

/// One open conversation between the current user and a peer.
///
/// Owns its live channel and its message sequence. Every mutation of the
/// sequence happens under `inner`. Channel and history results are checked
/// against the generation they were started under and send results against
/// the session lifetime, so results belonging to a closed or reopened
/// session are dropped instead of merged.
pub struct ConversationSession {
    current_user: UserId,
    peer: PeerRef,
    api: Arc<dyn ChatApi>,
    channel: Arc<ChannelManager>,
    inner: Mutex<SessionState>,
    view: watch::Sender<Vec<Message>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ConversationSession {
    pub fn new(
        context: &SessionContext,
        current_user: UserId,
        peer: PeerRef,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let channel = ChannelManager::new(
            Arc::clone(&context.connector),
            Arc::clone(&context.credentials),
            context.auth_timeout,
        );
        let (view, _) = watch::channel(Vec::new());
        Arc::new(Self {
            inner: Mutex::new(SessionState {
                reconciler: Reconciler::new(current_user.clone(), peer.user_id.clone()),
                phase: SessionPhase::Closed,
                generation: 0,
                lifetime: 0,
            }),
            current_user,
            peer,
            api: Arc::clone(&context.api),
            channel,
            view,
            events,
        })
    }

    pub fn current_user(&self) -> &UserId {
        &self.current_user
    }

    pub fn peer(&self) -> &PeerRef {
        &self.peer
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Read-only, ordered view of the conversation; updated on every change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.view.subscribe()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.view.borrow().clone()
    }

    /// Loads history and connects the channel concurrently. History failure
    /// leaves the conversation empty but usable; channel failure leaves it
    /// readable with sending disabled. Only unrecoverable errors are returned.
    pub async fn open(self: &Arc<Self>) -> ChatResult<()> {
        let generation = {
            let mut state = self.inner.lock().await;
            if state.phase != SessionPhase::Closed {
                debug!(peer = %self.peer.username, "session: already open");
                return Ok(());
            }
            state.generation += 1;
            state.lifetime += 1;
            state.phase = SessionPhase::opening();
            state.reconciler.clear();
            self.publish(&state);
            state.generation
        };
        info!(
            peer = %self.peer.username,
            generation,
            "session: opening conversation"
        );
        self.emit_phase(SessionPhase::opening());
        self.connect(generation).await
    }

    /// Re-establishes the channel after a disconnect or failed handshake and
    /// merges a fresh history fetch into the current sequence.
    pub async fn reconnect(self: &Arc<Self>) -> ChatResult<()> {
        let generation = {
            let mut state = self.inner.lock().await;
            if state.phase == SessionPhase::Closed {
                return Err(ChatError::SessionClosed);
            }
            state.generation += 1;
            state.phase = SessionPhase::opening();
            state.generation
        };
        info!(peer = %self.peer.username, generation, "session: reconnecting");
        self.emit_phase(SessionPhase::opening());
        self.channel.close().await;
        self.connect(generation).await
    }

    async fn connect(self: &Arc<Self>, generation: u64) -> ChatResult<()> {
        self.channel
            .on_message(Arc::new(SessionHandler {
                session: Arc::downgrade(self),
                generation,
            }))
            .await;
        self.emit_channel_state(ChannelState::Connecting);

        let (history, channel) = tokio::join!(
            self.api.fetch_history(&self.peer),
            self.channel.open(&self.current_user)
        );

        let history = match history {
            Ok(messages) => messages,
            Err(err) => {
                warn!(
                    peer = %self.peer.username,
                    generation,
                    "session: history unavailable; continuing with live messages only: {err}"
                );
                self.notice(err);
                Vec::new()
            }
        };
        let applied = self
            .with_generation(generation, |session, state| {
                let inserted = state.reconciler.load_history(history);
                session.publish(state);
                info!(
                    peer = %session.peer.username,
                    generation,
                    inserted,
                    "session: history loaded"
                );
                state.advance(Some(true), None)
            })
            .await;
        let Some(phase) = applied else {
            debug!(generation, "session: discarding history for superseded session");
            return Err(ChatError::SessionClosed);
        };
        if let Some(phase) = phase {
            self.emit_phase(phase);
        }

        match channel {
            Ok(()) => {
                self.channel_ready(generation).await;
                Ok(())
            }
            Err(ChatError::SessionClosed) => Err(ChatError::SessionClosed),
            Err(err) => {
                warn!(
                    peer = %self.peer.username,
                    generation,
                    "session: channel unavailable; sending disabled: {err}"
                );
                self.emit_channel_state(self.channel.state());
                // Handshake rejections already reach the handler as AuthFailed.
                if !matches!(err, ChatError::ChannelAuth { .. }) {
                    self.notice(err.clone());
                }
                if err.is_recoverable() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Sends `text` to the peer: the message appears at once as provisional,
    /// then is confirmed by the send response or removed if the send fails.
    pub async fn send(&self, text: &str) -> ChatResult<MessageId> {
        let (local_id, lifetime) = {
            let mut state = self.inner.lock().await;
            if state.phase == SessionPhase::Closed {
                return Err(ChatError::SessionClosed);
            }
            if text.trim().is_empty() {
                return Err(ChatError::EmptyMessage);
            }
            if self.channel.state() != ChannelState::Ready {
                return Err(ChatError::ChannelNotReady);
            }
            let provisional = state.reconciler.push_provisional(text, Utc::now())?;
            self.publish(&state);
            (provisional.id, state.lifetime)
        };
        debug!(message_id = %local_id, peer = %self.peer.username, "session: provisional send");

        match self.api.send_message(&self.peer, text).await {
            Ok(receipt) => {
                let server_id = receipt.id.clone();
                let merged = self
                    .with_lifetime(lifetime, |session, state| {
                        let outcome = state.reconciler.confirm_send(&local_id, receipt);
                        if outcome.changed() {
                            session.publish(state);
                        }
                        outcome
                    })
                    .await;
                match merged {
                    Some(outcome) => info!(
                        message_id = %server_id,
                        local_id = %local_id,
                        ?outcome,
                        "session: send confirmed"
                    ),
                    None => debug!(
                        message_id = %server_id,
                        lifetime,
                        "session: send confirmed after the session closed"
                    ),
                }

                let relay = OutboundMessage {
                    text: text.to_string(),
                    recipient: self.peer.user_id.clone(),
                    sender: self.current_user.clone(),
                    message_id: Some(server_id.clone()),
                };
                if let Err(err) = self.channel.send(relay).await {
                    warn!(message_id = %server_id, "session: live relay skipped: {err}");
                }
                Ok(server_id)
            }
            Err(err) => {
                self.with_lifetime(lifetime, |session, state| {
                    if state.reconciler.rollback_send(&local_id).changed() {
                        session.publish(state);
                    }
                })
                .await;
                warn!(
                    local_id = %local_id,
                    "session: send failed; provisional message removed: {err}"
                );
                self.notice(err.clone());
                Err(err)
            }
        }
    }

    /// Closes the channel and clears the conversation. Safe to call more
    /// than once.
    pub async fn close(&self) {
        let was_open = {
            let mut state = self.inner.lock().await;
            let was_open = state.phase != SessionPhase::Closed;
            state.generation += 1;
            state.lifetime += 1;
            state.phase = SessionPhase::Closed;
            state.reconciler.clear();
            self.publish(&state);
            was_open
        };
        self.channel.close().await;
        if was_open {
            info!(peer = %self.peer.username, "session: closed");
            self.emit_phase(SessionPhase::Closed);
            self.emit_channel_state(ChannelState::Disconnected);
        }
    }

    async fn handle_channel_event(&self, generation: u64, epoch: u64, event: ChannelEvent) {
        match event {
            ChannelEvent::Authenticated => self.channel_ready(generation).await,
            ChannelEvent::AuthFailed { reason } => {
                let phase = self
                    .with_generation(generation, |_, state| state.advance(None, Some(false)))
                    .await;
                let Some(phase) = phase else {
                    return self.discard(generation, epoch);
                };
                if let Some(phase) = phase {
                    self.emit_phase(phase);
                }
                self.emit_channel_state(ChannelState::Authenticating);
                self.notice(ChatError::ChannelAuth { reason });
            }
            ChannelEvent::MessageReceived(record) => {
                let Some(message) = normalize_record(record, Utc::now()) else {
                    return;
                };
                let message_id = message.id.clone();
                let outcome = self
                    .with_generation(generation, |session, state| {
                        let outcome = state.reconciler.apply_received(message);
                        if outcome.changed() {
                            session.publish(state);
                        }
                        outcome
                    })
                    .await;
                match outcome {
                    Some(outcome) => {
                        debug!(message_id = %message_id, ?outcome, "session: live message merged");
                        self.flush_read_receipt(generation).await;
                    }
                    None => self.discard(generation, epoch),
                }
            }
            ChannelEvent::StatusUpdated { message_id, status } => {
                let Some(message_id) = message_id.into_string().map(MessageId) else {
                    return;
                };
                let Some(status) = MessageStatus::parse(&status) else {
                    warn!(
                        message_id = %message_id,
                        status = %status,
                        "session: unknown status ignored"
                    );
                    return;
                };
                let outcome = self
                    .with_generation(generation, |session, state| {
                        let outcome = state.reconciler.apply_status(&message_id, status);
                        if outcome.changed() {
                            session.publish(state);
                        }
                        outcome
                    })
                    .await;
                match outcome {
                    Some(_) => self.flush_read_receipt(generation).await,
                    None => self.discard(generation, epoch),
                }
            }
            ChannelEvent::Error { reason } => {
                if self.is_current(generation).await {
                    self.notice(ChatError::Transport(reason));
                } else {
                    self.discard(generation, epoch);
                }
            }
            ChannelEvent::Disconnected { reason } => {
                let phase = self
                    .with_generation(generation, |_, state| state.advance(None, Some(false)))
                    .await;
                let Some(phase) = phase else {
                    return self.discard(generation, epoch);
                };
                warn!(
                    peer = %self.peer.username,
                    generation,
                    ?reason,
                    "session: channel lost; reopen to resume live updates"
                );
                if let Some(phase) = phase {
                    self.emit_phase(phase);
                }
                self.emit_channel_state(ChannelState::Disconnected);
                self.notice(ChatError::Transport(
                    reason.unwrap_or_else(|| "connection closed".to_string()),
                ));
            }
        }
    }

    async fn channel_ready(&self, generation: u64) {
        let phase = self
            .with_generation(generation, |_, state| state.advance(None, Some(true)))
            .await;
        let Some(phase) = phase else {
            return;
        };
        if let Some(phase) = phase {
            self.emit_channel_state(ChannelState::Ready);
            self.emit_phase(phase);
        }
        self.flush_read_receipt(generation).await;
    }

    /// Sends `message_read` for the newest peer message if it has not been
    /// reported at its current status.
    async fn flush_read_receipt(&self, generation: u64) {
        if self.channel.state() != ChannelState::Ready {
            return;
        }
        let receipt = self
            .with_generation(generation, |_, state| {
                let lifetime = state.lifetime;
                state
                    .reconciler
                    .take_read_receipt()
                    .map(|(message_id, status)| (message_id, status, lifetime))
            })
            .await
            .flatten();
        let Some((message_id, status, lifetime)) = receipt else {
            return;
        };
        match self.channel.send_read(message_id.clone()).await {
            Ok(()) => {
                debug!(message_id = %message_id, "session: read receipt sent");
                let _ = self.events.send(ClientEvent::ReadReceiptSent {
                    peer: self.peer.user_id.clone(),
                    message_id,
                });
            }
            Err(err) => {
                warn!(message_id = %message_id, "session: read receipt not sent: {err}");
                self.with_lifetime(lifetime, |_, state| {
                    state.reconciler.release_read_receipt(&message_id, status)
                })
                .await;
            }
        }
    }

    /// Runs `apply` under the state lock if `generation` is still current.
    async fn with_generation<R>(
        &self,
        generation: u64,
        apply: impl FnOnce(&Self, &mut SessionState) -> R,
    ) -> Option<R> {
        let mut state = self.inner.lock().await;
        if state.generation != generation || state.phase == SessionPhase::Closed {
            return None;
        }
        Some(apply(self, &mut *state))
    }

    /// Runs `apply` under the state lock unless the session was closed or
    /// reopened since `lifetime`.
    async fn with_lifetime<R>(
        &self,
        lifetime: u64,
        apply: impl FnOnce(&Self, &mut SessionState) -> R,
    ) -> Option<R> {
        let mut state = self.inner.lock().await;
        if state.lifetime != lifetime || state.phase == SessionPhase::Closed {
            return None;
        }
        Some(apply(self, &mut *state))
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.with_generation(generation, |_, _| ()).await.is_some()
    }

    fn discard(&self, generation: u64, epoch: u64) {
        debug!(
            peer = %self.peer.username,
            generation,
            epoch,
            "session: discarding event from superseded channel"
        );
    }

    fn publish(&self, state: &SessionState) {
        self.view.send_replace(state.reconciler.messages().to_vec());
    }

    fn notice(&self, error: ChatError) {
        let _ = self.events.send(ClientEvent::Notice {
            peer: self.peer.user_id.clone(),
            error,
        });
    }

    fn emit_phase(&self, phase: SessionPhase) {
        let _ = self.events.send(ClientEvent::SessionPhaseChanged {
            peer: self.peer.user_id.clone(),
            phase,
        });
    }

    fn emit_channel_state(&self, state: ChannelState) {
        let _ = self.events.send(ClientEvent::ChannelStateChanged {
            peer: self.peer.user_id.clone(),
            state,
        });
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        if self.channel.state() == ChannelState::Disconnected {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channel = Arc::clone(&self.channel);
            runtime.spawn(async move { channel.close().await });
        }
    }
}

struct SessionHandler {
    session: Weak<ConversationSession>,
    generation: u64,
}

#[async_trait]
impl ChannelHandler for SessionHandler {
    async fn on_channel_event(&self, epoch: u64, event: ChannelEvent) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        session
            .handle_channel_event(self.generation, epoch, event)
            .await;
    }
}

/// Keeps at most one conversation open and switches it as the selected peer
/// or the signed-in identity changes.
pub struct ConversationController {
    context: SessionContext,
    events: broadcast::Sender<ClientEvent>,
    active: Mutex<Option<Arc<ConversationSession>>>,
}

impl ConversationController {
    pub fn new(context: SessionContext) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            context,
            events,
            active: Mutex::new(None),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn active(&self) -> Option<Arc<ConversationSession>> {
        self.active.lock().await.clone()
    }

    /// Opens the conversation with `peer`, closing any other one first.
    /// Reselecting the open peer reconnects its channel if it was lost.
    pub async fn select_peer(
        &self,
        current_user: &UserId,
        peer: PeerRef,
    ) -> ChatResult<Arc<ConversationSession>> {
        let (session, previous) = {
            let mut active = self.active.lock().await;
            let reselected = active
                .as_ref()
                .filter(|session| session.peer() == &peer && session.current_user() == current_user)
                .cloned();
            if let Some(session) = reselected {
                drop(active);
                if session.channel_state() != ChannelState::Ready {
                    session.reconnect().await?;
                }
                return Ok(session);
            }
            let session = ConversationSession::new(
                &self.context,
                current_user.clone(),
                peer,
                self.events.clone(),
            );
            let previous = active.replace(Arc::clone(&session));
            (session, previous)
        };

        if let Some(previous) = previous {
            info!(
                from = %previous.peer().username,
                to = %session.peer().username,
                "controller: switching conversation"
            );
            previous.close().await;
        }
        session.open().await?;
        Ok(session)
    }

    /// Reacts to sign-in, sign-out or a change of account. A different (or
    /// no) identity closes the open conversation; the same identity
    /// reconnects it.
    pub async fn identity_changed(&self, current_user: Option<&UserId>) -> ChatResult<()> {
        let session = self.active.lock().await.clone();
        let Some(session) = session else {
            return Ok(());
        };
        match current_user {
            Some(user) if user == session.current_user() => {
                if session.channel_state() != ChannelState::Ready {
                    session.reconnect().await?;
                }
                Ok(())
            }
            _ => {
                info!(user = ?current_user, "controller: identity changed; closing conversation");
                self.close().await;
                Ok(())
            }
        }
    }

    pub async fn close(&self) {
        let session = self.active.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
