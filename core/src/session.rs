/// Chat session: one user's view of one conversation
///
/// Ties a `Connection`, a `ConversationResolver` and a `MessageLog` together
/// and republishes their combined state as a `ChatSnapshot` on a watch
/// channel. After `close()` (or drop) nothing mutates the snapshot again,
/// including acknowledgements that were still in flight.
use crate::config::ChatConfig;
use crate::connection::{Connection, ConnectionState, RelayEvent};
use crate::credential::{Credential, Identity};
use crate::error::{ChatError, Result};
use crate::protocol::{ClientFrame, RequestId, ServerFrame};
use crate::reconciler::{Applied, MessageLog};
use crate::resolver::ConversationResolver;
use crate::transport::{Dialer, TcpDialer};
use crate::types::{
    ChatEntry, Conversation, ConversationId, DeliveryStatus, Draft, Message, MessageId,
    ProvisionalId,
};
use crate::utils::sync::lock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Which conversation the session is showing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum ConversationView {
    None,
    /// Waiting for the relay; the id is display-only
    Resolving {
        placeholder: ConversationId,
        counterpart_id: String,
    },
    Active {
        conversation: Conversation,
    },
    Unavailable {
        counterpart_id: String,
        reason: String,
    },
}

impl ConversationView {
    pub fn conversation(&self) -> Option<&Conversation> {
        match self {
            ConversationView::Active { conversation } => Some(conversation),
            _ => None,
        }
    }
}

/// Everything presentation code needs to render the chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatSnapshot {
    pub connection: ConnectionState,
    /// Identity cached when the credential was opened
    pub user_id: Option<String>,
    pub conversation: ConversationView,
    pub messages: Vec<ChatEntry>,
}

impl ChatSnapshot {
    fn empty() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            user_id: None,
            conversation: ConversationView::None,
            messages: Vec::new(),
        }
    }

    /// True when the signed-in user wrote `entry`
    pub fn is_own(&self, entry: &ChatEntry) -> bool {
        self.user_id
            .as_deref()
            .map(|user_id| entry.is_own(user_id))
            .unwrap_or(false)
    }

    /// Id to label the conversation with: the real one, or the placeholder
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match &self.conversation {
            ConversationView::Active { conversation } => Some(&conversation.id),
            ConversationView::Resolving { placeholder, .. } => Some(placeholder),
            _ => None,
        }
    }
}

struct SessionState {
    disposed: bool,
    connection: ConnectionState,
    user_id: Option<String>,
    conversation: ConversationView,
    log: MessageLog,
    /// Pushed messages that arrived while the conversation was resolving
    early: Vec<Message>,
    /// Sends awaiting their ack, by request id
    in_flight: HashMap<RequestId, ProvisionalId>,
}

impl SessionState {
    fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            connection: self.connection.clone(),
            user_id: self.user_id.clone(),
            conversation: self.conversation.clone(),
            messages: self.log.entries().to_vec(),
        }
    }

    fn reset_conversation(&mut self) {
        self.conversation = ConversationView::None;
        self.log.clear();
        self.early.clear();
        self.in_flight.clear();
    }
}

struct SessionCore {
    state: Mutex<SessionState>,
    snapshot_tx: watch::Sender<ChatSnapshot>,
}

impl SessionCore {
    /// Mutate and republish, unless the session is gone
    fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        let mut state = lock(&self.state);
        if state.disposed {
            return None;
        }
        let result = f(&mut state);
        self.snapshot_tx.send_replace(state.snapshot());
        Some(result)
    }

    fn on_relay_event(&self, event: &RelayEvent) {
        match event {
            RelayEvent::State(connection) => {
                self.update(|state| state.connection = connection.clone());
            }
            RelayEvent::NewMessage(message) => {
                self.update(|state| match &state.conversation {
                    ConversationView::Active { conversation }
                        if conversation.id == message.conversation_id =>
                    {
                        if state.log.apply_incoming(message.clone()) == Applied::Duplicate {
                            debug!("Message {} already shown", message.id);
                        }
                    }
                    ConversationView::Resolving { .. } => state.early.push(message.clone()),
                    _ => debug!(
                        "Ignoring message {} for inactive conversation {}",
                        message.id, message.conversation_id
                    ),
                });
            }
            RelayEvent::MessageSent {
                request_id,
                message,
            } => {
                self.update(|state| {
                    if let Some(provisional) = state.in_flight.remove(request_id) {
                        state.log.confirm(provisional, message.clone());
                    }
                });
            }
        }
    }
}

pub struct ChatSession {
    connection: Connection,
    resolver: ConversationResolver,
    core: Arc<SessionCore>,
}

impl ChatSession {
    pub fn new(config: ChatConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (snapshot_tx, _) = watch::channel(ChatSnapshot::empty());
        let core = Arc::new(SessionCore {
            state: Mutex::new(SessionState {
                disposed: false,
                connection: ConnectionState::Disconnected,
                user_id: None,
                conversation: ConversationView::None,
                log: MessageLog::new(),
                early: Vec::new(),
                in_flight: HashMap::new(),
            }),
            snapshot_tx,
        });

        let connection = Connection::new(config, dialer);
        let handler_core = core.clone();
        connection.on_event(move |event| handler_core.on_relay_event(event));

        Self {
            connection,
            resolver: ConversationResolver::new(),
            core,
        }
    }

    /// Session talking to the relay at `config.relay_addr` over TCP
    pub fn over_tcp(config: ChatConfig) -> Self {
        let dialer = Arc::new(TcpDialer::new(config.relay_addr));
        Self::new(config, dialer)
    }

    /// Connect with `credential`. Switching to a different user drops the
    /// conversation and messages of the previous one. Returns false when
    /// nothing had to change.
    pub fn open(&self, credential: Credential) -> bool {
        let user_id = credential.user_id().to_string();
        let switched = self.core.update(|state| {
            if state.user_id.as_deref() == Some(user_id.as_str()) {
                return false;
            }
            state.user_id = Some(user_id.clone());
            state.reset_conversation();
            true
        });
        match switched {
            None => {
                warn!("Ignoring open on a closed chat session");
                false
            }
            Some(switched) => {
                if switched {
                    info!("Chat session now signed in as {}", user_id);
                }
                self.connection.open(credential)
            }
        }
    }

    /// Wait until the relay link is up
    pub async fn wait_connected(&self, within: Duration) -> Result<()> {
        let mut rx = self.connection.subscribe_state();
        timeout(within, async {
            loop {
                if rx.borrow_and_update().is_connected() {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(ChatError::NotConnected);
                }
            }
        })
        .await
        .map_err(|_| ChatError::Timeout(format!("not connected after {:?}", within)))?
    }

    /// Resolve and show the conversation with `counterpart_id`
    pub async fn start_or_join(&self, counterpart_id: &str) -> Result<Conversation> {
        let identity = self.connection.identity().ok_or(ChatError::NotConnected)?;
        if self.resolver.is_pending() {
            return Err(ChatError::ResolutionInFlight);
        }
        let counterpart = counterpart_id.trim().to_string();

        self.core
            .update(|state| {
                state.reset_conversation();
                state.conversation = ConversationView::Resolving {
                    placeholder: ConversationId::placeholder(&identity.user_id, &counterpart),
                    counterpart_id: counterpart.clone(),
                };
            })
            .ok_or(ChatError::NotConnected)?;

        match self.resolver.start_or_join(&self.connection, &counterpart).await {
            Ok(start) => {
                let conversation = start.conversation.clone();
                self.core.update(|state| {
                    let still_wanted = matches!(
                        &state.conversation,
                        ConversationView::Resolving { counterpart_id, .. } if *counterpart_id == counterpart
                    );
                    if !still_wanted {
                        return;
                    }
                    state.conversation = ConversationView::Active {
                        conversation: start.conversation,
                    };
                    state.log.load_history(start.messages);
                    for message in std::mem::take(&mut state.early) {
                        if message.conversation_id == conversation.id {
                            state.log.apply_incoming(message);
                        }
                    }
                });
                Ok(conversation)
            }
            Err(ChatError::ResolutionInFlight) => Err(ChatError::ResolutionInFlight),
            Err(e) => {
                self.core.update(|state| {
                    state.early.clear();
                    state.conversation = ConversationView::Unavailable {
                        counterpart_id: counterpart.clone(),
                        reason: e.to_string(),
                    };
                });
                Err(e)
            }
        }
    }

    /// Send `body` to the active conversation. The entry shows up at once
    /// as pending and is confirmed or marked failed when the relay answers.
    pub async fn send(&self, body: &str) -> Result<MessageId> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyBody);
        }
        if !self.connection.state().is_connected() {
            return Err(ChatError::NotConnected);
        }
        let identity = self.connection.identity().ok_or(ChatError::NotConnected)?;

        let (provisional, conversation_id) = self
            .core
            .update(|state| {
                let conversation_id = state.conversation.conversation()?.id.clone();
                let provisional = state.log.apply_optimistic(Draft {
                    conversation_id: conversation_id.clone(),
                    sender_id: identity.user_id.clone(),
                    body: body.to_string(),
                });
                Some((provisional, conversation_id))
            })
            .ok_or(ChatError::NotConnected)?
            .ok_or(ChatError::NoActiveConversation)?;

        // The ack is normally applied by the relay event handler, in order
        // with pushes; registering happens before the frame leaves
        let mut sent_as = None;
        let reply = self
            .connection
            .request(|request_id| {
                sent_as = Some(request_id);
                lock(&self.core.state)
                    .in_flight
                    .insert(request_id, provisional);
                ClientFrame::SendMessage {
                    request_id,
                    conversation_id,
                    body: body.to_string(),
                }
            })
            .await;

        let reason = match reply {
            Ok(ServerFrame::MessageSent { message, .. }) => {
                let id = message.id.clone();
                self.core.update(|state| {
                    if let Some(p) = sent_as.and_then(|r| state.in_flight.remove(&r)) {
                        state.log.confirm(p, message);
                    }
                });
                return Ok(id);
            }
            Ok(ServerFrame::RequestFailed { error, .. }) => error,
            Ok(other) => format!("unexpected reply {}", other),
            Err(e) => e.to_string(),
        };

        // An ack that raced the timeout may already have confirmed the entry
        let settled = self.core.update(|state| {
            let tracked = match sent_as {
                Some(r) => state.in_flight.remove(&r).is_some(),
                None => true,
            };
            if tracked {
                state.log.fail(provisional, reason.clone());
                return None;
            }
            state
                .log
                .get_provisional(provisional)
                .filter(|e| e.status == DeliveryStatus::Confirmed)
                .and_then(|e| e.id.clone())
        });
        if let Some(Some(id)) = settled {
            return Ok(id);
        }
        warn!("Send {} failed: {}", provisional, reason);
        Err(ChatError::SendFailed(reason))
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.core.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.core.snapshot_tx.subscribe()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.connection.identity()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Dispose the session: publish a final disconnected snapshot, then
    /// release the connection. Later calls do nothing.
    pub fn close(&self) {
        {
            let mut state = lock(&self.core.state);
            if state.disposed {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            self.core.snapshot_tx.send_replace(state.snapshot());
            state.disposed = true;
        }
        self.connection.close();
        debug!("Chat session closed");
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::credential::{decode_identity, unsigned_token};
    use crate::protocol::RequestId;
    use crate::relay::Relay;
    use crate::transport::RelayLink;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::mpsc;

    /// Relay stand-in that starts conversations but never acks a send on
    /// its own; the test decides when (and whether) the ack goes out
    #[derive(Default)]
    struct ManualRelay {
        answer_start: bool,
        link: Mutex<Option<mpsc::UnboundedSender<ServerFrame>>>,
        sends: Arc<Mutex<Vec<(RequestId, ConversationId, String)>>>,
    }

    impl ManualRelay {
        fn new(answer_start: bool) -> Arc<Self> {
            Arc::new(Self {
                answer_start,
                ..Default::default()
            })
        }

        fn sends(&self) -> usize {
            lock(&self.sends).len()
        }

        fn last_send(&self) -> Option<(RequestId, ConversationId, String)> {
            lock(&self.sends).last().cloned()
        }

        /// Push frames down the link back to back
        fn deliver(&self, frames: Vec<ServerFrame>) {
            if let Some(tx) = lock(&self.link).as_ref() {
                for frame in frames {
                    let _ = tx.send(frame);
                }
            }
        }

        fn ack_last(&self) {
            let Some((request_id, conversation_id, body)) = self.last_send() else {
                return;
            };
            self.deliver(vec![ServerFrame::MessageSent {
                request_id,
                message: message("m1", &conversation_id, "alice", &body),
            }]);
        }
    }

    fn message(id: &str, conversation_id: &ConversationId, sender: &str, body: &str) -> Message {
        Message {
            id: MessageId::new(id),
            conversation_id: conversation_id.clone(),
            sender_id: sender.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
            read: false,
        }
    }

    #[async_trait]
    impl Dialer for ManualRelay {
        async fn dial(&self) -> Result<RelayLink> {
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerFrame>();
            *lock(&self.link) = Some(in_tx.clone());
            let sends = self.sends.clone();
            let answer_start = self.answer_start;

            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let reply = match frame {
                        ClientFrame::Authenticate { token, .. } => ServerFrame::Authenticated {
                            user_id: decode_identity(&token).unwrap().user_id,
                        },
                        ClientFrame::StartConversation {
                            request_id,
                            counterpart_id,
                        } if answer_start => ServerFrame::ConversationStarted {
                            request_id,
                            conversation: Conversation::new(
                                ConversationId::new("c1"),
                                "alice",
                                counterpart_id,
                            ),
                            messages: Vec::new(),
                        },
                        ClientFrame::SendMessage {
                            request_id,
                            conversation_id,
                            body,
                        } => {
                            lock(&sends).push((request_id, conversation_id, body));
                            continue;
                        }
                        _ => continue,
                    };
                    if in_tx.send(reply).is_err() {
                        break;
                    }
                }
            });

            Ok(RelayLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    fn config() -> ChatConfig {
        ChatConfig {
            ack_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::disabled(),
            ..Default::default()
        }
    }

    fn alice() -> Credential {
        Credential::from_token(unsigned_token("alice")).unwrap()
    }

    async fn connected(dialer: Arc<dyn Dialer>) -> ChatSession {
        let session = ChatSession::new(config(), dialer);
        session.open(alice());
        session
            .wait_connected(Duration::from_secs(3))
            .await
            .unwrap();
        session
    }

    async fn wait_until(session: &ChatSession, pred: impl Fn(&ChatSnapshot) -> bool) {
        let mut rx = session.subscribe();
        timeout(Duration::from_secs(3), async {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if pred(&snapshot) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .expect("snapshot never matched");
    }

    #[tokio::test]
    async fn test_send_while_disconnected_adds_nothing() {
        let relay = Relay::in_memory().unwrap();
        let session = ChatSession::new(config(), Arc::new(relay));

        assert!(matches!(session.send("hello").await, Err(ChatError::NotConnected)));
        assert!(session.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn test_send_checks_body_then_conversation() {
        let relay = Relay::in_memory().unwrap();
        let session = connected(Arc::new(relay)).await;

        assert!(matches!(session.send("   ").await, Err(ChatError::EmptyBody)));
        assert!(matches!(
            session.send("hi").await,
            Err(ChatError::NoActiveConversation)
        ));
        assert!(session.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn test_ack_then_echo_leaves_one_entry() {
        let relay = Relay::in_memory().unwrap();
        let session = connected(Arc::new(relay)).await;
        let conversation = session.start_or_join("bob").await.unwrap();

        let id = session.send("hi").await.unwrap();
        // The relay echoes the message to the sender right after the ack
        sleep_briefly().await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        let entry = &snapshot.messages[0];
        assert_eq!(entry.id.as_ref(), Some(&id));
        assert_eq!(entry.body, "hi");
        assert_eq!(entry.conversation_id, conversation.id);
        assert_eq!(entry.status, DeliveryStatus::Confirmed);
        assert!(snapshot.is_own(entry));
    }

    #[tokio::test]
    async fn test_resolving_shows_placeholder_and_fails_fast() {
        let relay = ManualRelay::new(false);
        let session = Arc::new(connected(relay.clone()).await);

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.start_or_join("bob").await })
        };
        wait_until(&session, |s| {
            matches!(s.conversation, ConversationView::Resolving { .. })
        })
        .await;

        assert_eq!(
            session.snapshot().conversation_id(),
            Some(&ConversationId::placeholder("alice", "bob"))
        );
        assert!(matches!(
            session.start_or_join("bob").await,
            Err(ChatError::ResolutionInFlight)
        ));

        session.close();
        assert!(pending.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_late_ack_after_close_changes_nothing() {
        let relay = ManualRelay::new(true);
        let session = Arc::new(connected(relay.clone()).await);
        session.start_or_join("bob").await.unwrap();

        let sending = {
            let session = session.clone();
            tokio::spawn(async move { session.send("hi").await })
        };
        wait_until(&session, |s| s.messages.len() == 1).await;
        assert_eq!(relay.sends(), 1);
        assert_eq!(session.snapshot().messages[0].status, DeliveryStatus::Pending);

        session.close();
        let mut rx = session.subscribe();
        let closed = rx.borrow_and_update().clone();
        assert_eq!(closed.connection, ConnectionState::Disconnected);

        relay.ack_last();
        assert!(sending.await.unwrap().is_err());
        sleep_briefly().await;

        assert!(!rx.has_changed().unwrap_or(false));
        assert_eq!(session.snapshot(), closed);
        assert_eq!(closed.messages[0].status, DeliveryStatus::Pending);

        // Closing again is harmless
        session.close();
        assert_eq!(session.snapshot(), closed);
    }

    #[tokio::test]
    async fn test_manual_ack_confirms_in_place() {
        let relay = ManualRelay::new(true);
        let session = Arc::new(connected(relay.clone()).await);
        session.start_or_join("bob").await.unwrap();

        let sending = {
            let session = session.clone();
            tokio::spawn(async move { session.send("hi").await })
        };
        wait_until(&session, |s| s.messages.len() == 1).await;
        relay.ack_last();

        assert_eq!(sending.await.unwrap().unwrap(), MessageId::new("m1"));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].status, DeliveryStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_switching_user_clears_conversation() {
        let relay = Relay::in_memory().unwrap();
        let session = connected(Arc::new(relay)).await;
        session.start_or_join("bob").await.unwrap();
        session.send("hi").await.unwrap();

        let carol = Credential::from_token(unsigned_token("carol")).unwrap();
        assert!(session.open(carol));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.user_id.as_deref(), Some("carol"));
        assert_eq!(snapshot.conversation, ConversationView::None);
        assert!(snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn test_push_between_send_and_echo_keeps_order() {
        let relay = ManualRelay::new(true);
        let session = Arc::new(connected(relay.clone()).await);
        let conversation = session.start_or_join("bob").await.unwrap();

        // What each relay event left behind, in order
        let published = Arc::new(Mutex::new(Vec::<ChatSnapshot>::new()));
        {
            let published = published.clone();
            let core = session.core.clone();
            session.connection.on_event(move |_| {
                lock(&published).push(core.snapshot_tx.borrow().clone());
            });
        }

        let sending = {
            let session = session.clone();
            tokio::spawn(async move { session.send("hi").await })
        };
        timeout(Duration::from_secs(3), async {
            while relay.sends() == 0 {
                sleep_briefly().await;
            }
        })
        .await
        .unwrap();

        let (request_id, _, body) = relay.last_send().unwrap();
        let mine = message("m1", &conversation.id, "alice", &body);
        relay.deliver(vec![
            ServerFrame::NewMessage {
                message: message("m9", &conversation.id, "bob", "from bob"),
            },
            ServerFrame::MessageSent {
                request_id,
                message: mine.clone(),
            },
            ServerFrame::NewMessage { message: mine },
        ]);

        assert_eq!(sending.await.unwrap().unwrap(), MessageId::new("m1"));
        timeout(Duration::from_secs(3), async {
            while lock(&published).len() < 3 {
                sleep_briefly().await;
            }
        })
        .await
        .unwrap();

        for snapshot in lock(&published).iter() {
            let copies = snapshot.messages.iter().filter(|e| e.body == "hi").count();
            assert!(copies <= 1, "send shown twice: {:?}", snapshot.messages);
        }
        let snapshot = session.snapshot();
        let bodies: Vec<_> = snapshot.messages.iter().map(|e| e.body.as_str()).collect();
        assert_eq!(bodies, vec!["hi", "from bob"]);
        assert_eq!(snapshot.messages[0].id, Some(MessageId::new("m1")));
        assert_eq!(snapshot.messages[0].status, DeliveryStatus::Confirmed);
    }

    async fn sleep_briefly() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
