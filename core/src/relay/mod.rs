/// Development message relay
///
/// Speaks the same protocol a production relay does: authenticates each
/// connection with the bearer token, creates-or-fetches conversations keyed
/// by the unordered participant pair, stores messages, acks sends and then
/// broadcasts them to every member of the room (sender included).
pub mod http;
pub mod store;

use crate::config::RelayConfig;
use crate::credential::decode_identity;
use crate::error::{ChatError, Result};
use crate::protocol::{read_frame, write_frame, ClientFrame, ServerFrame, PROTOCOL_VERSION};
use crate::transport::{Dialer, RelayLink};
use crate::types::{Conversation, ConversationId, Message, MessageId};
use crate::utils::sync::lock;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use store::{ConversationSummary, RelayStore};

/// Messages returned with a started conversation
pub const INITIAL_HISTORY: usize = 50;

type ClientId = u64;

struct RelayInner {
    store: RelayStore,
    auth_timeout: Duration,
    rooms: Mutex<HashMap<ConversationId, Vec<(ClientId, mpsc::UnboundedSender<ServerFrame>)>>>,
    next_client: AtomicU64,
    connected: AtomicUsize,
    conversations_created: AtomicUsize,
}

#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    pub fn new(store: RelayStore, auth_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                store,
                auth_timeout,
                rooms: Mutex::new(HashMap::new()),
                next_client: AtomicU64::new(1),
                connected: AtomicUsize::new(0),
                conversations_created: AtomicUsize::new(0),
            }),
        }
    }

    /// Relay over the store the config asks for
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let store = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                RelayStore::open(dir)?
            }
            None => RelayStore::temporary()?,
        };
        Ok(Self::new(store, config.auth_timeout))
    }

    /// In-memory relay with default settings
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(RelayStore::temporary()?, RelayConfig::default().auth_timeout))
    }

    pub fn store(&self) -> &RelayStore {
        &self.inner.store
    }

    /// Conversations created since startup
    pub fn conversations_created(&self) -> usize {
        self.inner.conversations_created.load(Ordering::SeqCst)
    }

    /// Currently authenticated clients
    pub fn connected_clients(&self) -> usize {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Accept TCP clients until the listener fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Relay listening on {}", listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Relay client connected from {}", addr);
                    let relay = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = relay.serve_tcp(stream).await {
                            warn!("Relay client {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept relay connection: {}", e);
                }
            }
        }
    }

    async fn serve_tcp(self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("Relay write failed: {}", e);
                    break;
                }
            }
        });

        let session = tokio::spawn(self.serve_client(in_rx, out_tx));

        let read_result = loop {
            match read_frame::<_, ClientFrame>(&mut reader).await {
                Ok(Some(frame)) => {
                    if in_tx.send(frame).is_err() {
                        break Ok(());
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        drop(in_tx);
        let _ = session.await;
        let _ = writer_task.await;
        read_result
    }

    /// Drive one client from authentication until its link closes
    async fn serve_client(
        self,
        mut inbound: mpsc::UnboundedReceiver<ClientFrame>,
        outbound: mpsc::UnboundedSender<ServerFrame>,
    ) {
        let user_id = match timeout(self.inner.auth_timeout, inbound.recv()).await {
            Ok(Some(ClientFrame::Authenticate {
                token,
                protocol_version,
            })) => {
                if protocol_version != PROTOCOL_VERSION {
                    let _ = outbound.send(ServerFrame::Rejected {
                        reason: format!(
                            "protocol version mismatch: expected {}, got {}",
                            PROTOCOL_VERSION, protocol_version
                        ),
                    });
                    return;
                }
                match decode_identity(&token) {
                    Ok(identity) => identity.user_id,
                    Err(e) => {
                        let _ = outbound.send(ServerFrame::Rejected {
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
            }
            Ok(Some(other)) => {
                let _ = outbound.send(ServerFrame::Rejected {
                    reason: format!("expected authenticate, got {}", other.frame_type()),
                });
                return;
            }
            Ok(None) => return,
            Err(_) => {
                let _ = outbound.send(ServerFrame::Rejected {
                    reason: "authentication timeout".to_string(),
                });
                return;
            }
        };

        let client_id = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        self.inner.connected.fetch_add(1, Ordering::SeqCst);
        info!("Relay client {} authenticated as {}", client_id, user_id);
        let _ = outbound.send(ServerFrame::Authenticated {
            user_id: user_id.clone(),
        });

        while let Some(frame) = inbound.recv().await {
            debug!("Relay got {} from {}", frame, user_id);
            match frame {
                ClientFrame::JoinConversation { conversation_id } => {
                    match self.inner.store.conversation(&conversation_id) {
                        Ok(Some(conversation)) if conversation.includes(&user_id) => {
                            self.join_room(&conversation_id, client_id, &outbound);
                        }
                        Ok(_) => warn!("{} may not join {}", user_id, conversation_id),
                        Err(e) => error!("Join lookup failed: {}", e),
                    }
                }
                ClientFrame::StartConversation {
                    request_id,
                    counterpart_id,
                } => {
                    // Join before reading history so nothing posted in between is lost;
                    // the client de-duplicates any overlap
                    let started = self
                        .open_conversation(&user_id, &counterpart_id)
                        .and_then(|conversation| {
                            self.join_room(&conversation.id, client_id, &outbound);
                            let messages =
                                self.inner.store.recent(&conversation.id, INITIAL_HISTORY)?;
                            Ok((conversation, messages))
                        });
                    let reply = match started {
                        Ok((conversation, messages)) => ServerFrame::ConversationStarted {
                            request_id,
                            conversation,
                            messages,
                        },
                        Err(e) => ServerFrame::RequestFailed {
                            request_id,
                            error: e.to_string(),
                        },
                    };
                    let _ = outbound.send(reply);
                }
                ClientFrame::SendMessage {
                    request_id,
                    conversation_id,
                    body,
                } => match self.post_message(&user_id, &conversation_id, &body) {
                    Ok(message) => {
                        let _ = outbound.send(ServerFrame::MessageSent {
                            request_id,
                            message: message.clone(),
                        });
                        self.broadcast(&message);
                    }
                    Err(e) => {
                        let _ = outbound.send(ServerFrame::RequestFailed {
                            request_id,
                            error: e.to_string(),
                        });
                    }
                },
                ClientFrame::Ping { timestamp } => {
                    let _ = outbound.send(ServerFrame::Pong { timestamp });
                }
                ClientFrame::Authenticate { .. } => {
                    warn!("Ignoring repeated authenticate from {}", user_id);
                }
            }
        }

        self.leave_rooms(client_id);
        self.inner.connected.fetch_sub(1, Ordering::SeqCst);
        info!("Relay client {} ({}) disconnected", client_id, user_id);
    }

    /// Create or fetch the conversation between two users, with its recent history
    pub fn start_conversation(
        &self,
        user_id: &str,
        counterpart_id: &str,
    ) -> Result<(Conversation, Vec<Message>)> {
        let conversation = self.open_conversation(user_id, counterpart_id)?;
        let messages = self.inner.store.recent(&conversation.id, INITIAL_HISTORY)?;
        Ok((conversation, messages))
    }

    fn open_conversation(&self, user_id: &str, counterpart_id: &str) -> Result<Conversation> {
        let counterpart_id = counterpart_id.trim();
        if counterpart_id.is_empty() {
            return Err(ChatError::ConversationUnavailable(
                "counterpart id is empty".to_string(),
            ));
        }
        if counterpart_id == user_id {
            return Err(ChatError::ConversationUnavailable(
                "cannot start a conversation with yourself".to_string(),
            ));
        }

        let (conversation, created) = self.inner.store.find_or_create(user_id, counterpart_id)?;
        if created {
            self.inner.conversations_created.fetch_add(1, Ordering::SeqCst);
            info!(
                "Created conversation {} between {} and {}",
                conversation.id, user_id, counterpart_id
            );
        }
        Ok(conversation)
    }

    /// Persist a message from `sender_id`; the caller broadcasts it
    pub fn post_message(
        &self,
        sender_id: &str,
        conversation_id: &ConversationId,
        body: &str,
    ) -> Result<Message> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyBody);
        }
        match self.inner.store.conversation(conversation_id)? {
            Some(conversation) if conversation.includes(sender_id) => {}
            Some(_) => {
                return Err(ChatError::SendFailed(format!(
                    "{} is not a participant of {}",
                    sender_id, conversation_id
                )))
            }
            None => {
                return Err(ChatError::SendFailed(format!(
                    "unknown conversation {}",
                    conversation_id
                )))
            }
        }

        let message = Message {
            id: MessageId::new(Uuid::new_v4().to_string()),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
            read: false,
        };
        self.inner.store.append(&message)?;
        Ok(message)
    }

    fn join_room(
        &self,
        conversation_id: &ConversationId,
        client_id: ClientId,
        outbound: &mpsc::UnboundedSender<ServerFrame>,
    ) {
        let mut rooms = lock(&self.inner.rooms);
        let members = rooms.entry(conversation_id.clone()).or_default();
        if !members.iter().any(|(id, _)| *id == client_id) {
            members.push((client_id, outbound.clone()));
            debug!("Client {} joined room {}", client_id, conversation_id);
        }
    }

    fn leave_rooms(&self, client_id: ClientId) {
        let mut rooms = lock(&self.inner.rooms);
        for members in rooms.values_mut() {
            members.retain(|(id, _)| *id != client_id);
        }
        rooms.retain(|_, members| !members.is_empty());
    }

    /// Push a message to every member of its room
    fn broadcast(&self, message: &Message) {
        let mut rooms = lock(&self.inner.rooms);
        if let Some(members) = rooms.get_mut(&message.conversation_id) {
            members.retain(|(_, tx)| {
                tx.send(ServerFrame::NewMessage {
                    message: message.clone(),
                })
                .is_ok()
            });
        }
    }
}

/// In-process link straight into the relay, no sockets involved
#[async_trait]
impl Dialer for Relay {
    async fn dial(&self) -> Result<RelayLink> {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerFrame>();
        tokio::spawn(self.clone().serve_client(out_rx, in_tx));
        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
