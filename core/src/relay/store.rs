/// Relay-side persistence: conversations and message history in sled
/// Frugal: simple key-value, prefix scans for history
use crate::error::{ChatError, Result};
use crate::types::{Conversation, ConversationId, Message, MessageId};
use crate::utils::sync::lock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// One row of a user's conversation list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub last_message: Option<Message>,
    /// Messages from the counterpart not yet marked read
    pub unread: usize,
}

#[derive(Clone)]
pub struct RelayStore {
    db: sled::Db,
    /// conversation id -> Conversation
    conversations: sled::Tree,
    /// length-prefixed min id, then max id -> conversation id
    pairs: sled::Tree,
    /// "{conversation id}\0{seq:020}" -> Message
    messages: sled::Tree,
    /// message id -> key in `messages`
    message_keys: sled::Tree,
    /// Serializes find-or-create and read-modify-write sections
    write_lock: Arc<Mutex<()>>,
}

fn storage(context: &str) -> impl Fn(sled::Error) -> ChatError + '_ {
    move |e| ChatError::Storage(format!("{}: {}", context, e))
}

/// Same key for (a, b) and (b, a). Each id carries its length, so ids
/// containing separator bytes cannot make two pairs collide.
fn pair_key(a: &str, b: &str) -> Vec<u8> {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut key = Vec::with_capacity(lo.len() + hi.len() + 8);
    for id in [lo, hi] {
        key.extend_from_slice(&(id.len() as u32).to_be_bytes());
        key.extend_from_slice(id.as_bytes());
    }
    key
}

fn history_prefix(id: &ConversationId) -> Vec<u8> {
    let mut prefix = id.as_str().as_bytes().to_vec();
    prefix.push(0);
    prefix
}

impl RelayStore {
    /// Open (or create) the store under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = sled::open(data_dir.join("relay.db")).map_err(storage("open relay DB"))?;
        Self::from_db(db)
    }

    /// Store that vanishes with the process
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage("open temporary DB"))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            conversations: db.open_tree("conversations").map_err(storage("conversations"))?,
            pairs: db.open_tree("pairs").map_err(storage("pairs"))?,
            messages: db.open_tree("messages").map_err(storage("messages"))?,
            message_keys: db.open_tree("message_keys").map_err(storage("message_keys"))?,
            db,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Fetch the conversation for the unordered pair, creating it if needed.
    /// The flag is true when this call created it.
    pub fn find_or_create(&self, a: &str, b: &str) -> Result<(Conversation, bool)> {
        let _guard = lock(&self.write_lock);
        let key = pair_key(a, b);

        if let Some(id) = self.pairs.get(&key).map_err(storage("find pair"))? {
            let id = ConversationId::new(String::from_utf8_lossy(&id).into_owned());
            if let Some(conversation) = self.conversation(&id)? {
                return Ok((conversation, false));
            }
        }

        let conversation = Conversation::new(ConversationId::new(Uuid::new_v4().to_string()), a, b);
        let value = serde_json::to_vec(&conversation)?;
        self.conversations
            .insert(conversation.id.as_str().as_bytes(), value)
            .map_err(storage("save conversation"))?;
        self.pairs
            .insert(key, conversation.id.as_str().as_bytes())
            .map_err(storage("save pair"))?;
        Ok((conversation, true))
    }

    pub fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        match self
            .conversations
            .get(id.as_str().as_bytes())
            .map_err(storage("get conversation"))?
        {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Conversations `user_id` takes part in, with preview and unread count
    pub fn summaries_for(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        let mut out = Vec::new();
        for entry in self.conversations.iter() {
            let (_, value) = entry.map_err(storage("list conversations"))?;
            let conversation: Conversation = match serde_json::from_slice(&value) {
                Ok(c) => c,
                Err(_) => continue,
            };
            if !conversation.includes(user_id) {
                continue;
            }

            let mut last_message = None;
            let mut unread = 0;
            for item in self.messages.scan_prefix(history_prefix(&conversation.id)) {
                let (_, value) = item.map_err(storage("scan history"))?;
                if let Ok(message) = serde_json::from_slice::<Message>(&value) {
                    if !message.read && message.sender_id != user_id {
                        unread += 1;
                    }
                    last_message = Some(message);
                }
            }

            out.push(ConversationSummary {
                conversation,
                last_message,
                unread,
            });
        }
        Ok(out)
    }

    /// Save message to history
    pub fn append(&self, message: &Message) -> Result<()> {
        let seq = self.db.generate_id().map_err(storage("generate id"))?;
        let mut key = history_prefix(&message.conversation_id);
        key.extend_from_slice(format!("{:020}", seq).as_bytes());

        let value = serde_json::to_vec(message)?;
        self.messages
            .insert(key.as_slice(), value)
            .map_err(storage("save message"))?;
        self.message_keys
            .insert(message.id.as_str().as_bytes(), key)
            .map_err(storage("index message"))?;
        Ok(())
    }

    /// Last `limit` messages, oldest first
    pub fn recent(&self, id: &ConversationId, limit: usize) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for entry in self.messages.scan_prefix(history_prefix(id)).rev().take(limit) {
            let (_, value) = entry.map_err(storage("read history"))?;
            if let Ok(message) = serde_json::from_slice::<Message>(&value) {
                messages.push(message);
            }
        }
        messages.reverse();
        Ok(messages)
    }

    /// Page through history oldest first
    pub fn page(&self, id: &ConversationId, skip: usize, limit: usize) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for entry in self
            .messages
            .scan_prefix(history_prefix(id))
            .skip(skip)
            .take(limit)
        {
            let (_, value) = entry.map_err(storage("read history"))?;
            if let Ok(message) = serde_json::from_slice::<Message>(&value) {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    pub fn message(&self, id: &MessageId) -> Result<Option<Message>> {
        let Some(key) = self
            .message_keys
            .get(id.as_str().as_bytes())
            .map_err(storage("find message"))?
        else {
            return Ok(None);
        };
        match self.messages.get(&key).map_err(storage("get message"))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Flag a message read and return it. Only the receiving participant
    /// can do this; anyone else gets `Ok(None)`.
    pub fn mark_read(&self, id: &MessageId, reader: &str) -> Result<Option<Message>> {
        let _guard = lock(&self.write_lock);
        let Some(key) = self
            .message_keys
            .get(id.as_str().as_bytes())
            .map_err(storage("find message"))?
        else {
            return Ok(None);
        };
        let Some(value) = self.messages.get(&key).map_err(storage("get message"))? else {
            return Ok(None);
        };

        let mut message: Message = serde_json::from_slice(&value)?;
        if message.sender_id == reader {
            return Ok(None);
        }
        match self.conversation(&message.conversation_id)? {
            Some(conversation) if conversation.includes(reader) => {}
            _ => return Ok(None),
        }

        if !message.read {
            message.read = true;
            self.messages
                .insert(key, serde_json::to_vec(&message)?)
                .map_err(storage("mark read"))?;
        }
        Ok(Some(message))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage("flush"))?;
        Ok(())
    }
}
