/// Error types for the chat subsystem
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport-level failure; recoverable by reconnecting
    #[error("Connection error: {0}")]
    Connection(String),

    /// The relay refused to start the conversation
    #[error("Conversation unavailable: {0}")]
    ConversationUnavailable(String),

    #[error("A conversation request is already pending")]
    ResolutionInFlight,

    #[error("Not connected to the relay")]
    NotConnected,

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Message body is empty")]
    EmptyBody,

    /// The relay acknowledged a send with an error
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, ChatError>;
