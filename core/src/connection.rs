/// Connection lifecycle: exactly one duplex link to the relay per credential
///
/// A `Connection` is owned by one chat session. `open` starts a supervisor
/// task that dials, authenticates, pumps frames and (optionally) reconnects
/// with capped exponential backoff. `close` cancels the supervisor, drops
/// every registered handler and fails pending requests; no handler runs
/// after it returns.
use crate::config::ChatConfig;
use crate::credential::{Credential, Identity};
use crate::error::{ChatError, Result};
use crate::protocol::{ClientFrame, RequestId, ServerFrame, PROTOCOL_VERSION};
use crate::transport::{Dialer, RelayLink};
use crate::types::{ConversationId, Message};
use crate::utils::sync::lock;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Observable state of the relay link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// What registered handlers get told about
#[derive(Debug, Clone)]
pub enum RelayEvent {
    State(ConnectionState),
    NewMessage(Message),
    /// A send was acknowledged; published in frame order, before the
    /// requester is woken
    MessageSent {
        request_id: RequestId,
        message: Message,
    },
}

pub type EventHandler = Box<dyn Fn(&RelayEvent) + Send + Sync>;

#[derive(Default)]
struct LinkSlot {
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    pending: HashMap<RequestId, oneshot::Sender<ServerFrame>>,
}

struct Shared {
    config: ChatConfig,
    dialer: Arc<dyn Dialer>,
    state_tx: watch::Sender<ConnectionState>,
    handlers: Mutex<Vec<EventHandler>>,
    link: Mutex<LinkSlot>,
    /// Rooms to (re)join whenever a link comes up
    rooms: Mutex<Vec<ConversationId>>,
    next_request: AtomicU64,
}

struct Active {
    credential: Credential,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Connection {
    shared: Arc<Shared>,
    active: Mutex<Option<Active>>,
}

impl Connection {
    pub fn new(config: ChatConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                dialer,
                state_tx,
                handlers: Mutex::new(Vec::new()),
                link: Mutex::new(LinkSlot::default()),
                rooms: Mutex::new(Vec::new()),
                next_request: AtomicU64::new(1),
            }),
            active: Mutex::new(None),
        }
    }

    /// Register a handler for state transitions and pushed messages
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        lock(&self.shared.handlers).push(Box::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Identity of the credential currently driving the connection
    pub fn identity(&self) -> Option<Identity> {
        lock(&self.active)
            .as_ref()
            .map(|a| a.credential.identity().clone())
    }

    /// Start (or keep) the link for `credential`.
    ///
    /// Returns false when a live connection for an equal credential already
    /// exists. Failures never surface here; they show up in `state()`.
    /// Must be called from within a Tokio runtime.
    pub fn open(&self, credential: Credential) -> bool {
        let mut active = lock(&self.active);

        if let Some(current) = active.as_ref() {
            if current.credential == credential && !current.task.is_finished() {
                debug!("Relay connection for {} already open", credential.user_id());
                return false;
            }
        }

        if let Some(prev) = active.take() {
            info!("Replacing relay connection for {}", prev.credential.user_id());
            prev.cancel.cancel();
            prev.task.abort();
            if prev.credential.user_id() != credential.user_id() {
                lock(&self.shared.rooms).clear();
            }
        }
        *lock(&self.shared.link) = LinkSlot::default();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            self.shared.clone(),
            credential.clone(),
            cancel.clone(),
        ));
        *active = Some(Active {
            credential,
            cancel,
            task,
        });
        true
    }

    /// Release the link and detach every handler. Safe to call repeatedly.
    pub fn close(&self) {
        let prev = lock(&self.active).take();
        if let Some(prev) = prev {
            prev.cancel.cancel();
            prev.task.abort();
            info!("Relay connection for {} closed", prev.credential.user_id());
        }

        {
            // Handlers are invoked under this lock, so once it is taken no
            // dispatch is in flight and none can start.
            let mut handlers = lock(&self.shared.handlers);
            handlers.clear();
            self.shared.state_tx.send_if_modified(|state| {
                if *state == ConnectionState::Disconnected {
                    false
                } else {
                    *state = ConnectionState::Disconnected;
                    true
                }
            });
        }

        *lock(&self.shared.link) = LinkSlot::default();
        lock(&self.shared.rooms).clear();
    }

    /// Subscribe to a conversation room, now if connected and again after
    /// every reconnect
    pub fn join(&self, conversation_id: ConversationId) {
        {
            let mut rooms = lock(&self.shared.rooms);
            if !rooms.contains(&conversation_id) {
                rooms.push(conversation_id.clone());
            }
        }
        let slot = lock(&self.shared.link);
        if let Some(outbound) = &slot.outbound {
            let _ = outbound.send(ClientFrame::JoinConversation { conversation_id });
        }
    }

    /// Send an acked request and wait for the reply carrying its id
    pub async fn request<F>(&self, build: F) -> Result<ServerFrame>
    where
        F: FnOnce(RequestId) -> ClientFrame,
    {
        let request_id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = lock(&self.shared.link);
            let outbound = slot.outbound.clone().ok_or(ChatError::NotConnected)?;
            slot.pending.insert(request_id, tx);
            let frame = build(request_id);
            debug!("Sending {} (request {})", frame, request_id);
            if outbound.send(frame).is_err() {
                slot.pending.remove(&request_id);
                return Err(ChatError::NotConnected);
            }
        }

        match timeout(self.shared.config.ack_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ChatError::Connection(
                "link closed before acknowledgement".to_string(),
            )),
            Err(_) => {
                lock(&self.shared.link).pending.remove(&request_id);
                Err(ChatError::Timeout(format!(
                    "no acknowledgement for request {}",
                    request_id
                )))
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    /// Publish an event to the handlers unless `cancel` has fired
    fn publish(&self, cancel: &CancellationToken, event: RelayEvent) {
        let handlers = lock(&self.handlers);
        if cancel.is_cancelled() {
            return;
        }
        if let RelayEvent::State(next) = &event {
            let changed = self.state_tx.send_if_modified(|state| {
                if state == next {
                    false
                } else {
                    *state = next.clone();
                    true
                }
            });
            if !changed {
                return;
            }
        }
        for handler in handlers.iter() {
            handler(&event);
        }
    }

    fn set_state(&self, cancel: &CancellationToken, state: ConnectionState) {
        self.publish(cancel, RelayEvent::State(state));
    }

    fn install_link(
        &self,
        cancel: &CancellationToken,
        outbound: mpsc::UnboundedSender<ClientFrame>,
    ) -> Result<()> {
        let mut slot = lock(&self.link);
        if cancel.is_cancelled() {
            return Err(ChatError::Connection("connection closed".to_string()));
        }
        slot.outbound = Some(outbound);
        Ok(())
    }

    /// Forget the link; awaiting requests see the channel close
    fn drop_link(&self, cancel: &CancellationToken) {
        let mut slot = lock(&self.link);
        if cancel.is_cancelled() {
            return;
        }
        if !slot.pending.is_empty() {
            warn!("Link lost with {} unacknowledged requests", slot.pending.len());
        }
        *slot = LinkSlot::default();
    }

    fn send(&self, frame: ClientFrame) -> bool {
        match &lock(&self.link).outbound {
            Some(outbound) => outbound.send(frame).is_ok(),
            None => false,
        }
    }

    fn rejoin_rooms(&self) {
        let rooms = lock(&self.rooms).clone();
        for conversation_id in rooms {
            debug!("Joining room {}", conversation_id);
            self.send(ClientFrame::JoinConversation { conversation_id });
        }
    }

    fn dispatch(&self, cancel: &CancellationToken, frame: ServerFrame) {
        if let ServerFrame::MessageSent {
            request_id,
            message,
        } = &frame
        {
            // Handlers see the ack before any later push on this link
            self.publish(
                cancel,
                RelayEvent::MessageSent {
                    request_id: *request_id,
                    message: message.clone(),
                },
            );
        }

        if let Some(request_id) = frame.request_id() {
            let waiter = {
                let mut slot = lock(&self.link);
                if cancel.is_cancelled() {
                    return;
                }
                slot.pending.remove(&request_id)
            };
            match waiter {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => debug!("Dropping late reply for request {}", request_id),
            }
            return;
        }

        match frame {
            ServerFrame::NewMessage { message } => {
                debug!("Received message {} in {}", message.id, message.conversation_id);
                self.publish(cancel, RelayEvent::NewMessage(message));
            }
            ServerFrame::Pong { .. } => debug!("Received pong"),
            other => warn!("Unexpected {} on an established link", other),
        }
    }
}

async fn supervise(shared: Arc<Shared>, credential: Credential, cancel: CancellationToken) {
    let policy = shared.config.reconnect.clone();
    let mut attempt: u32 = 0;

    loop {
        shared.set_state(&cancel, ConnectionState::Connecting);

        let established = tokio::select! {
            _ = cancel.cancelled() => return,
            result = timeout(shared.config.connect_timeout, establish(&shared, &credential, &cancel)) => {
                result.unwrap_or_else(|_| Err(ChatError::Timeout("relay did not authenticate in time".to_string())))
            }
        };

        match established {
            Ok(inbound) => {
                attempt = 0;
                info!("Connected to relay as {}", credential.user_id());
                shared.set_state(&cancel, ConnectionState::Connected);
                shared.rejoin_rooms();

                let ended = run_link(&shared, inbound, &cancel).await;
                shared.drop_link(&cancel);
                if cancel.is_cancelled() {
                    return;
                }
                match ended {
                    Ok(()) => {
                        info!("Relay link closed");
                        shared.set_state(&cancel, ConnectionState::Disconnected);
                    }
                    Err(e) => {
                        warn!("Relay link failed: {}", e);
                        shared.set_state(&cancel, ConnectionState::Error(e.to_string()));
                    }
                }
            }
            Err(ChatError::InvalidCredential(reason)) => {
                warn!("Relay rejected credential for {}: {}", credential.user_id(), reason);
                shared.set_state(&cancel, ConnectionState::Error(reason));
                return;
            }
            Err(e) => {
                warn!("Relay connection failed: {}", e);
                shared.set_state(&cancel, ConnectionState::Error(e.to_string()));
            }
        }

        if !policy.enabled || attempt >= policy.max_attempts {
            shared.set_state(&cancel, ConnectionState::Disconnected);
            return;
        }

        let delay = with_jitter(policy.delay_for(attempt));
        attempt += 1;
        debug!("Reconnecting in {:?} (attempt {})", delay, attempt);

        // A close() during the wait cancels the retry outright
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

/// Dial and authenticate; on success the link is installed for requests
async fn establish(
    shared: &Shared,
    credential: &Credential,
    cancel: &CancellationToken,
) -> Result<mpsc::UnboundedReceiver<ServerFrame>> {
    let RelayLink {
        outbound,
        mut inbound,
    } = shared.dialer.dial().await?;

    outbound
        .send(ClientFrame::Authenticate {
            token: credential.token().to_string(),
            protocol_version: PROTOCOL_VERSION,
        })
        .map_err(|_| ChatError::Connection("link closed during authentication".to_string()))?;

    match inbound.recv().await {
        Some(ServerFrame::Authenticated { user_id }) if user_id == credential.user_id() => {}
        Some(ServerFrame::Authenticated { user_id }) => {
            return Err(ChatError::Protocol(format!(
                "relay authenticated {} but credential names {}",
                user_id,
                credential.user_id()
            )))
        }
        Some(ServerFrame::Rejected { reason }) => return Err(ChatError::InvalidCredential(reason)),
        Some(other) => {
            return Err(ChatError::Protocol(format!(
                "expected authentication reply, got {}",
                other
            )))
        }
        None => {
            return Err(ChatError::Connection(
                "link closed during authentication".to_string(),
            ))
        }
    }

    shared.install_link(cancel, outbound)?;
    Ok(inbound)
}

async fn run_link(
    shared: &Shared,
    mut inbound: mpsc::UnboundedReceiver<ServerFrame>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut keepalive = interval(shared.config.keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = inbound.recv() => match frame {
                Some(frame) => shared.dispatch(cancel, frame),
                None => return Ok(()),
            },
            _ = keepalive.tick() => {
                let ping = ClientFrame::Ping { timestamp: chrono::Utc::now().timestamp() };
                if !shared.send(ping) {
                    return Err(ChatError::Connection("keepalive could not be sent".to_string()));
                }
            }
        }
    }
}

/// Shave up to 20% off a delay so clients do not retry in lockstep,
/// keeping it under the cap
fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 5;
    if spread == 0 {
        return delay;
    }
    delay - Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
