/// Typed client for the chat REST surface (conversation list, paged history,
/// read receipts)
use crate::credential::Credential;
use crate::error::{ChatError, Result};
use crate::relay::ConversationSummary;
use crate::types::{Conversation, ConversationId, Message, MessageId};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// History window for `list_messages`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub skip: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { limit: 50, skip: 0 }
    }
}

#[derive(Deserialize)]
struct ConversationsBody {
    conversations: Vec<ConversationSummary>,
}

#[derive(Deserialize)]
struct ConversationBody {
    conversation: Conversation,
}

#[derive(Deserialize)]
struct MessagesBody {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct MessageBody {
    message: Message,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct CreateConversation<'a> {
    other_user_id: &'a str,
}

pub struct ChatApi {
    client: Client<HttpConnector, Full<Bytes>>,
    base: String,
    credential: Credential,
}

impl ChatApi {
    /// `base` is the scheme and authority, e.g. `http://127.0.0.1:5001`
    pub fn new(base: impl Into<String>, credential: Credential) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base: base.into().trim_end_matches('/').to_string(),
            credential,
        }
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let body: ConversationsBody = self
            .call(Method::GET, "/api/chat/conversations".to_string(), None)
            .await?;
        Ok(body.conversations)
    }

    pub async fn create_conversation(&self, other_user_id: &str) -> Result<Conversation> {
        let payload = serde_json::to_vec(&CreateConversation { other_user_id })?;
        let body: ConversationBody = self
            .call(
                Method::POST,
                "/api/chat/conversations".to_string(),
                Some(payload),
            )
            .await?;
        Ok(body.conversation)
    }

    /// Oldest-first window of a conversation's history
    pub async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        page: Page,
    ) -> Result<Vec<Message>> {
        let path = format!(
            "/api/chat/conversations/{}/messages?limit={}&skip={}",
            urlencoding::encode(conversation_id.as_str()),
            page.limit,
            page.skip
        );
        let body: MessagesBody = self.call(Method::GET, path, None).await?;
        Ok(body.messages)
    }

    pub async fn mark_read(&self, message_id: &MessageId) -> Result<Message> {
        let path = format!(
            "/api/chat/messages/{}/read",
            urlencoding::encode(message_id.as_str())
        );
        let body: MessageBody = self.call(Method::PATCH, path, None).await?;
        Ok(body.message)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: String,
        payload: Option<Vec<u8>>,
    ) -> Result<T> {
        let uri = format!("{}{}", self.base, path);
        debug!("{} {}", method, uri);

        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header(
                hyper::header::AUTHORIZATION,
                format!("Bearer {}", self.credential.token()),
            );
        if payload.is_some() {
            builder = builder.header(hyper::header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(payload.unwrap_or_default())))
            .map_err(|e| ChatError::Config(format!("invalid request for {}: {}", uri, e)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ChatError::Connection(format!("{}: {}", uri, e)))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ChatError::Connection(format!("reading {}: {}", uri, e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(http_error(status, &body));
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

fn http_error(status: StatusCode, body: &[u8]) -> ChatError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    ChatError::Http {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_is_preferred() {
        match http_error(StatusCode::FORBIDDEN, br#"{"error":"not a participant"}"#) {
            ChatError::Http { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "not a participant");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_without_body_uses_reason() {
        match http_error(StatusCode::NOT_FOUND, b"") {
            ChatError::Http { message, .. } => assert_eq!(message, "Not Found"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
