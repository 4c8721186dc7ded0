/// Conversation resolution: ask the relay for the shared conversation with a
/// counterpart. The relay owns conversation ids; nothing here invents one.
use crate::connection::Connection;
use crate::error::{ChatError, Result};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::types::{Conversation, Message};
use crate::utils::sync::lock;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// What the relay hands back for a started or fetched conversation
#[derive(Debug, Clone)]
pub struct ConversationStart {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

#[derive(Debug, Default)]
pub struct ConversationResolver {
    /// Counterpart of the request currently awaiting the relay
    in_flight: Mutex<Option<String>>,
}

/// Clears the in-flight marker when the request finishes or is dropped
struct InFlight<'a>(&'a Mutex<Option<String>>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.0).take();
    }
}

impl ConversationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    fn begin(&self, counterpart_id: &str) -> Result<InFlight<'_>> {
        let mut in_flight = lock(&self.in_flight);
        if let Some(pending) = in_flight.as_ref() {
            debug!("Conversation with {} still resolving", pending);
            return Err(ChatError::ResolutionInFlight);
        }
        *in_flight = Some(counterpart_id.to_string());
        Ok(InFlight(&self.in_flight))
    }

    /// Create or fetch the conversation between the connected user and
    /// `counterpart_id`, then join its room.
    pub async fn start_or_join(
        &self,
        connection: &Connection,
        counterpart_id: &str,
    ) -> Result<ConversationStart> {
        let counterpart_id = counterpart_id.trim();
        if counterpart_id.is_empty() {
            return Err(ChatError::ConversationUnavailable(
                "counterpart id is empty".to_string(),
            ));
        }
        let identity = connection.identity().ok_or(ChatError::NotConnected)?;
        let _in_flight = self.begin(counterpart_id)?;

        let reply = connection
            .request(|request_id| ClientFrame::StartConversation {
                request_id,
                counterpart_id: counterpart_id.to_string(),
            })
            .await?;

        match reply {
            ServerFrame::ConversationStarted {
                conversation,
                messages,
                ..
            } => {
                if conversation.id.is_placeholder()
                    || !conversation.includes(&identity.user_id)
                    || !conversation.includes(counterpart_id)
                {
                    return Err(ChatError::Protocol(format!(
                        "relay answered with conversation {} for {} and {}",
                        conversation.id, identity.user_id, counterpart_id
                    )));
                }
                info!(
                    "Conversation {} with {} ready ({} messages)",
                    conversation.id,
                    counterpart_id,
                    messages.len()
                );
                connection.join(conversation.id.clone());
                Ok(ConversationStart {
                    conversation,
                    messages,
                })
            }
            ServerFrame::RequestFailed { error, .. } => {
                warn!("Relay refused conversation with {}: {}", counterpart_id, error);
                Err(ChatError::ConversationUnavailable(error))
            }
            other => Err(ChatError::Protocol(format!(
                "unexpected reply to start_conversation: {}",
                other
            ))),
        }
    }
}
