use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{PeerRef, UserId},
    protocol::{ClientFrame, ServerFrame},
};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::{
    channel::{ChannelEvent, ChannelHandler},
    credentials::{AuthSession, BearerToken, SessionStore},
    error::{ChatError, ChatResult},
    reconciler::SendReceipt,
    rest::ChatApi,
    transport::{ChannelConnector, ChannelLink, TransportEvent},
    types::Message,
};
use shared::domain::CurrentUser;

pub(crate) const WAIT: Duration = Duration::from_secs(2);

/// Backend side of an in-memory channel link.
pub(crate) struct ServerEnd {
    pub frames: mpsc::UnboundedReceiver<ClientFrame>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerEnd {
    pub async fn next_frame(&mut self) -> ClientFrame {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("timely client frame")
            .expect("client frame")
    }

    pub fn push(&self, frame: ServerFrame) {
        let _ = self.events.send(TransportEvent::Frame(frame));
    }

    pub fn hang_up(&self, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Closed(Some(reason.to_string())));
    }

    /// Plays the backend half of a successful handshake.
    pub async fn accept_auth(&mut self) {
        let frame = self.next_frame().await;
        assert!(
            matches!(frame, ClientFrame::Authenticate { .. }),
            "expected authenticate, got {frame:?}"
        );
        self.push(ServerFrame::Authenticated { user_id: None });
        let frame = self.next_frame().await;
        assert!(
            matches!(frame, ClientFrame::Register { .. }),
            "expected register, got {frame:?}"
        );
    }
}

#[derive(Default)]
pub(crate) struct MemoryConnector {
    links: std::sync::Mutex<VecDeque<ChannelLink>>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a link for the next `connect` and returns its backend half.
    pub fn add_link(&self) -> ServerEnd {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.links
            .lock()
            .expect("links lock")
            .push_back(ChannelLink::new(outbound_tx, inbound_rx));
        ServerEnd {
            frames: outbound_rx,
            events: inbound_tx,
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for MemoryConnector {
    async fn connect(&self) -> ChatResult<ChannelLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.links
            .lock()
            .expect("links lock")
            .pop_front()
            .ok_or_else(|| ChatError::Transport("connection refused".into()))
    }
}

/// Handler that forwards every event to the test.
pub(crate) struct RecordingHandler {
    tx: mpsc::UnboundedSender<(u64, ChannelEvent)>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(u64, ChannelEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl ChannelHandler for RecordingHandler {
    async fn on_channel_event(&self, epoch: u64, event: ChannelEvent) {
        let _ = self.tx.send((epoch, event));
    }
}

pub(crate) async fn signed_in(user_id: &str, username: &str) -> SessionStore {
    let store = SessionStore::new();
    store
        .sign_in(AuthSession {
            user: CurrentUser {
                id: UserId::new(user_id),
                username: username.to_string(),
            },
            token: BearerToken::new(format!("token-{user_id}")),
        })
        .await;
    store
}

/// Scripted request/response backend. Sends can be held open until
/// `release_send` is called.
#[derive(Default)]
pub(crate) struct FakeChatApi {
    pub history: Mutex<VecDeque<ChatResult<Vec<Message>>>>,
    pub sends: Mutex<VecDeque<ChatResult<SendReceipt>>>,
    pub history_requests: Mutex<Vec<PeerRef>>,
    pub send_requests: Mutex<Vec<(PeerRef, String)>>,
    pub hold_history: Mutex<Option<Arc<Notify>>>,
    pub hold_sends: Mutex<Option<Arc<Notify>>>,
}

impl FakeChatApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn queue_history(&self, result: ChatResult<Vec<Message>>) {
        self.history.lock().await.push_back(result);
    }

    pub async fn queue_send(&self, result: ChatResult<SendReceipt>) {
        self.sends.lock().await.push_back(result);
    }

    pub async fn hold_history(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.hold_history.lock().await = Some(Arc::clone(&gate));
        gate
    }

    pub async fn hold_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.hold_sends.lock().await = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn fetch_history(&self, peer: &PeerRef) -> ChatResult<Vec<Message>> {
        self.history_requests.lock().await.push(peer.clone());
        let gate = self.hold_history.lock().await.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.history.lock().await.pop_front().unwrap_or(Ok(Vec::new()))
    }

    async fn send_message(&self, peer: &PeerRef, text: &str) -> ChatResult<SendReceipt> {
        self.send_requests
            .lock()
            .await
            .push((peer.clone(), text.to_string()));
        let gate = self.hold_sends.lock().await.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.sends.lock().await.pop_front().unwrap_or_else(|| {
            Err(ChatError::SendFailed {
                reason: "no scripted response".into(),
            })
        })
    }
}
