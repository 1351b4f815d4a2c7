use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{MessageId, UserId},
    protocol::{ClientFrame, ServerFrame, WireId, WireMessageRecord},
};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    credentials::CredentialProvider,
    error::{ChatError, ChatResult},
    transport::{ChannelConnector, ChannelLink, TransportEvent},
    types::ChannelState,
};

/// Application-level events of one channel, tagged with the channel epoch
/// they were received on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Authenticated,
    AuthFailed { reason: String },
    MessageReceived(WireMessageRecord),
    StatusUpdated { message_id: WireId, status: String },
    Error { reason: String },
    Disconnected { reason: Option<String> },
}

#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn on_channel_event(&self, epoch: u64, event: ChannelEvent);
}

/// Outbound chat payload for the live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    pub recipient: UserId,
    pub sender: UserId,
    pub message_id: Option<MessageId>,
}

enum ChannelSlot {
    Empty,
    Opening { epoch: u64 },
    Open(ActiveChannel),
}

struct ActiveChannel {
    epoch: u64,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    authenticated: bool,
    auth_waiter: Option<oneshot::Sender<Result<(), String>>>,
    pump: JoinHandle<()>,
    link_tasks: Vec<JoinHandle<()>>,
}

impl ActiveChannel {
    fn shutdown(self) {
        self.pump.abort();
        for task in self.link_tasks {
            task.abort();
        }
    }
}

/// Owns the single live connection of a conversation session: the
/// authentication handshake, outbound frames, and forwarding of inbound
/// events to one registered handler.
pub struct ChannelManager {
    connector: Arc<dyn ChannelConnector>,
    credentials: Arc<dyn CredentialProvider>,
    auth_timeout: Duration,
    inner: Mutex<ChannelSlot>,
    handler: RwLock<Option<Arc<dyn ChannelHandler>>>,
    state: watch::Sender<ChannelState>,
    epochs: AtomicU64,
}

impl ChannelManager {
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        credentials: Arc<dyn CredentialProvider>,
        auth_timeout: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Arc::new(Self {
            connector,
            credentials,
            auth_timeout,
            inner: Mutex::new(ChannelSlot::Empty),
            handler: RwLock::new(None),
            state,
            epochs: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Epoch of the connection currently held, if any.
    pub async fn current_epoch(&self) -> Option<u64> {
        match &*self.inner.lock().await {
            ChannelSlot::Empty => None,
            ChannelSlot::Opening { epoch } => Some(*epoch),
            ChannelSlot::Open(active) => Some(active.epoch),
        }
    }

    /// Registers the handler for inbound events, replacing any previous one.
    pub async fn on_message(&self, handler: Arc<dyn ChannelHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Connects and authenticates. A no-op while a connection is already
    /// held or being established.
    pub async fn open(self: &Arc<Self>, user_id: &UserId) -> ChatResult<()> {
        let epoch = {
            let mut slot = self.inner.lock().await;
            if !matches!(*slot, ChannelSlot::Empty) {
                debug!(user_id = %user_id, "channel: open ignored; connection already held");
                return Ok(());
            }
            let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
            *slot = ChannelSlot::Opening { epoch };
            epoch
        };
        self.state.send_replace(ChannelState::Connecting);

        let link = match self.connector.connect().await {
            Ok(link) => link,
            Err(err) => {
                self.abandon_opening(epoch).await;
                warn!(epoch, "channel: connect failed: {err}");
                return Err(err);
            }
        };

        let (auth_tx, auth_rx) = oneshot::channel();
        {
            let mut slot = self.inner.lock().await;
            if !matches!(*slot, ChannelSlot::Opening { epoch: current } if current == epoch) {
                debug!(epoch, "channel: closed while connecting; dropping connection");
                discard_link(link);
                return Err(ChatError::SessionClosed);
            }
            let ChannelLink {
                outbound,
                inbound,
                tasks,
            } = link;
            let pump = tokio::spawn(Arc::clone(self).pump(epoch, inbound));
            *slot = ChannelSlot::Open(ActiveChannel {
                epoch,
                outbound,
                authenticated: false,
                auth_waiter: Some(auth_tx),
                pump,
                link_tasks: tasks,
            });
        }
        self.state.send_replace(ChannelState::Authenticating);
        info!(epoch, user_id = %user_id, "channel: connected; authenticating");

        self.run_handshake(epoch, auth_rx, user_id).await
    }

    /// Repeats the handshake on a connection whose authentication failed.
    pub async fn authenticate(self: &Arc<Self>, user_id: &UserId) -> ChatResult<()> {
        let (auth_tx, auth_rx) = oneshot::channel();
        let epoch = {
            let mut slot = self.inner.lock().await;
            let ChannelSlot::Open(active) = &mut *slot else {
                return Err(ChatError::ChannelNotReady);
            };
            if active.authenticated {
                return Ok(());
            }
            active.auth_waiter = Some(auth_tx);
            active.epoch
        };
        self.state.send_replace(ChannelState::Authenticating);
        self.run_handshake(epoch, auth_rx, user_id).await
    }

    async fn run_handshake(
        &self,
        epoch: u64,
        auth_rx: oneshot::Receiver<Result<(), String>>,
        user_id: &UserId,
    ) -> ChatResult<()> {
        let token = match self.credentials.credential().await {
            Ok(token) => token,
            Err(err) => {
                self.clear_waiter(epoch).await;
                warn!(epoch, "channel: no credential for handshake: {err}");
                return Err(err);
            }
        };
        self.write_frame(
            epoch,
            ClientFrame::Authenticate {
                token: token.as_str().to_string(),
            },
            false,
        )
        .await?;

        match tokio::time::timeout(self.auth_timeout, auth_rx).await {
            Ok(Ok(Ok(()))) => {
                self.write_frame(
                    epoch,
                    ClientFrame::Register {
                        user_id: user_id.clone(),
                    },
                    true,
                )
                .await?;
                info!(epoch, user_id = %user_id, "channel: ready");
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(ChatError::ChannelAuth { reason }),
            Ok(Err(_)) => Err(ChatError::Transport(
                "connection closed during authentication".into(),
            )),
            Err(_) => {
                self.clear_waiter(epoch).await;
                let reason = format!("no authentication result within {:?}", self.auth_timeout);
                warn!(epoch, "channel: {reason}");
                self.emit(
                    epoch,
                    ChannelEvent::AuthFailed {
                        reason: reason.clone(),
                    },
                )
                .await;
                Err(ChatError::ChannelAuth { reason })
            }
        }
    }

    /// Emits a `send_message` frame. Rejected unless authenticated.
    pub async fn send(&self, message: OutboundMessage) -> ChatResult<()> {
        self.write_current(ClientFrame::SendMessage {
            message: message.text,
            recipient_id: message.recipient,
            sender_id: message.sender,
            message_id: message.message_id,
        })
        .await
    }

    /// Emits a `message_read` frame for `message_id`.
    pub async fn send_read(&self, message_id: MessageId) -> ChatResult<()> {
        self.write_current(ClientFrame::MessageRead { message_id }).await
    }

    /// Disconnects and releases the handler. Events still in flight for the
    /// old connection are dropped.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.lock().await, ChannelSlot::Empty);
        self.handler.write().await.take();
        match previous {
            ChannelSlot::Open(active) => {
                info!(epoch = active.epoch, "channel: closed");
                active.shutdown();
            }
            ChannelSlot::Opening { epoch } => {
                debug!(epoch, "channel: closed while connecting");
            }
            ChannelSlot::Empty => {}
        }
        self.state.send_replace(ChannelState::Disconnected);
    }

    async fn write_current(&self, frame: ClientFrame) -> ChatResult<()> {
        let slot = self.inner.lock().await;
        let ChannelSlot::Open(active) = &*slot else {
            return Err(ChatError::ChannelNotReady);
        };
        if !active.authenticated {
            return Err(ChatError::ChannelNotReady);
        }
        debug!(epoch = active.epoch, event = frame.event_name(), "channel: sending frame");
        active
            .outbound
            .send(frame)
            .map_err(|_| ChatError::Transport("connection is closed".into()))
    }

    async fn write_frame(
        &self,
        epoch: u64,
        frame: ClientFrame,
        require_auth: bool,
    ) -> ChatResult<()> {
        let slot = self.inner.lock().await;
        let ChannelSlot::Open(active) = &*slot else {
            return Err(ChatError::SessionClosed);
        };
        if active.epoch != epoch {
            return Err(ChatError::SessionClosed);
        }
        if require_auth && !active.authenticated {
            return Err(ChatError::ChannelNotReady);
        }
        active
            .outbound
            .send(frame)
            .map_err(|_| ChatError::Transport("connection is closed".into()))
    }

    async fn abandon_opening(&self, epoch: u64) {
        let mut slot = self.inner.lock().await;
        if matches!(*slot, ChannelSlot::Opening { epoch: current } if current == epoch) {
            *slot = ChannelSlot::Empty;
            self.state.send_replace(ChannelState::Disconnected);
        }
    }

    async fn clear_waiter(&self, epoch: u64) {
        if let ChannelSlot::Open(active) = &mut *self.inner.lock().await {
            if active.epoch == epoch {
                active.auth_waiter = None;
            }
        }
    }

    /// Records a handshake result. Returns false when the epoch is stale.
    async fn settle_auth(&self, epoch: u64, result: Result<(), String>) -> bool {
        let mut slot = self.inner.lock().await;
        let ChannelSlot::Open(active) = &mut *slot else {
            return false;
        };
        if active.epoch != epoch {
            return false;
        }
        active.authenticated = result.is_ok();
        self.state.send_replace(if result.is_ok() {
            ChannelState::Ready
        } else {
            ChannelState::Authenticating
        });
        if let Some(waiter) = active.auth_waiter.take() {
            let _ = waiter.send(result);
        }
        true
    }

    async fn is_authenticated(&self, epoch: u64) -> bool {
        matches!(
            &*self.inner.lock().await,
            ChannelSlot::Open(active) if active.epoch == epoch && active.authenticated
        )
    }

    async fn emit(&self, epoch: u64, event: ChannelEvent) {
        let handler = self.handler.read().await.clone();
        match handler {
            Some(handler) => handler.on_channel_event(epoch, event).await,
            None => debug!(epoch, "channel: no handler registered; event dropped"),
        }
    }

    async fn pump(
        self: Arc<Self>,
        epoch: u64,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut backlog = Vec::new();
        let mut reason = None;

        while let Some(event) = inbound.recv().await {
            let frame = match event {
                TransportEvent::Frame(frame) => frame,
                TransportEvent::Closed(closed) => {
                    reason = closed;
                    break;
                }
            };
            match frame {
                ServerFrame::Authenticated { .. } => {
                    if !self.settle_auth(epoch, Ok(())).await {
                        return;
                    }
                    self.emit(epoch, ChannelEvent::Authenticated).await;
                    for event in backlog.drain(..) {
                        self.emit(epoch, event).await;
                    }
                }
                ServerFrame::Unauthorized { reason } => {
                    let reason = reason.unwrap_or_else(|| "unauthorized".to_string());
                    warn!(epoch, reason = %reason, "channel: authentication rejected");
                    if !self.settle_auth(epoch, Err(reason.clone())).await {
                        return;
                    }
                    self.emit(epoch, ChannelEvent::AuthFailed { reason }).await;
                }
                ServerFrame::ReceiveMessage(record) => {
                    self.deliver(epoch, ChannelEvent::MessageReceived(record), &mut backlog)
                        .await;
                }
                ServerFrame::MessageStatusUpdated { message_id, status } => {
                    self.deliver(
                        epoch,
                        ChannelEvent::StatusUpdated { message_id, status },
                        &mut backlog,
                    )
                    .await;
                }
                ServerFrame::Error { reason: error } => {
                    let error = error.unwrap_or_else(|| "server reported an error".to_string());
                    warn!(epoch, reason = %error, "channel: transport error");
                    self.emit(
                        epoch,
                        ChannelEvent::Error {
                            reason: error.clone(),
                        },
                    )
                    .await;
                    reason = Some(error);
                    break;
                }
            }
        }

        self.connection_lost(epoch, reason).await;
    }

    async fn deliver(&self, epoch: u64, event: ChannelEvent, backlog: &mut Vec<ChannelEvent>) {
        if self.is_authenticated(epoch).await {
            self.emit(epoch, event).await;
        } else {
            debug!(epoch, "channel: holding event until authenticated");
            backlog.push(event);
        }
    }

    /// Tears the connection down like `close`. The released handler still
    /// receives the final `Disconnected` event.
    async fn connection_lost(&self, epoch: u64, reason: Option<String>) {
        let (active, handler) = {
            let mut slot = self.inner.lock().await;
            let held = matches!(&*slot, ChannelSlot::Open(active) if active.epoch == epoch);
            if !held {
                return;
            }
            let ChannelSlot::Open(active) = std::mem::replace(&mut *slot, ChannelSlot::Empty)
            else {
                return;
            };
            (active, self.handler.write().await.take())
        };

        info!(epoch, ?reason, "channel: disconnected");
        for task in active.link_tasks {
            task.abort();
        }
        self.state.send_replace(ChannelState::Disconnected);
        match handler {
            Some(handler) => {
                handler
                    .on_channel_event(epoch, ChannelEvent::Disconnected { reason })
                    .await
            }
            None => debug!(epoch, "channel: no handler registered; event dropped"),
        }
    }
}

fn discard_link(link: ChannelLink) {
    for task in link.tasks {
        task.abort();
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
