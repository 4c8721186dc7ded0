/// GigChat - real-time chat layer for the marketplace
///
/// One `ChatSession` per signed-in user: a supervised duplex link to the
/// message relay, relay-issued conversation identity, and a message list that
/// reconciles optimistic sends with what the relay confirms. Also ships a
/// development relay (TCP + HTTP history) for local use and tests.

pub mod error;
pub mod config;
pub mod credential;
pub mod types;
pub mod protocol;
pub mod transport;
pub mod connection;
pub mod resolver;
pub mod reconciler;
pub mod session;
pub mod rest;
pub mod relay;
pub mod utils;

pub use config::{ChatConfig, ReconnectPolicy, RelayConfig};
pub use connection::{Connection, ConnectionState};
pub use credential::{Credential, Identity};
pub use error::{ChatError, Result};
pub use relay::Relay;
pub use rest::{ChatApi, Page};
pub use session::{ChatSession, ChatSnapshot, ConversationView};
pub use types::{ChatEntry, Conversation, ConversationId, DeliveryStatus, Message, MessageId};
