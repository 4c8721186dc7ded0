/// Session credential handed over by the auth provider
///
/// The token is opaque to the chat layer except for its payload segment,
/// which is decoded exactly once to learn who the user is.
use crate::error::{ChatError, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use std::fmt;

/// Who the credential belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

#[derive(Deserialize)]
struct Claims {
    id: Option<serde_json::Value>,
    #[serde(rename = "_id")]
    underscore_id: Option<serde_json::Value>,
}

/// Bearer token plus the identity decoded from it
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    identity: Identity,
}

impl Credential {
    /// Decode a JWT-shaped token (`header.payload.signature`)
    pub fn from_token(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let identity = decode_identity(&token)?;
        Ok(Self { token, identity })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }
}

// Never print the token itself
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.identity.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Decode the user id from the payload segment of a token
pub fn decode_identity(token: &str) -> Result<Identity> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next()) {
        (Some(_header), Some(payload)) if !payload.is_empty() => payload,
        _ => {
            return Err(ChatError::InvalidCredential(
                "token is not header.payload.signature".to_string(),
            ))
        }
    };

    let raw = general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ChatError::InvalidCredential(format!("payload is not base64url: {}", e)))?;
    let claims: Claims = serde_json::from_slice(&raw)
        .map_err(|e| ChatError::InvalidCredential(format!("payload is not JSON: {}", e)))?;

    let user_id = claims
        .id
        .or(claims.underscore_id)
        .and_then(|v| match v {
            serde_json::Value::String(s) if !s.is_empty() => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| ChatError::InvalidCredential("payload carries no user id".to_string()))?;

    Ok(Identity { user_id })
}

/// Build an unsigned token for a user id. Only the development relay
/// accepts these.
pub fn unsigned_token(user_id: &str) -> String {
    let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = general_purpose::URL_SAFE_NO_PAD
        .encode(serde_json::json!({ "id": user_id }).to_string().as_bytes());
    format!("{}.{}.", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with(payload: &str) -> String {
        format!(
            "e30.{}.sig",
            general_purpose::URL_SAFE_NO_PAD.encode(payload.as_bytes())
        )
    }

    #[test]
    fn test_decodes_id_claim() {
        let cred = Credential::from_token(token_with(r#"{"id":"u-42","role":"client"}"#)).unwrap();
        assert_eq!(cred.user_id(), "u-42");
    }

    #[test]
    fn test_falls_back_to_underscore_id() {
        let cred = Credential::from_token(token_with(r#"{"_id":"665f0c"}"#)).unwrap();
        assert_eq!(cred.user_id(), "665f0c");
    }

    #[test]
    fn test_numeric_id() {
        let cred = Credential::from_token(token_with(r#"{"id":7}"#)).unwrap();
        assert_eq!(cred.user_id(), "7");
    }

    #[test]
    fn test_rejects_malformed_tokens() {
        assert!(Credential::from_token("not-a-token").is_err());
        assert!(Credential::from_token("a.!!!.c").is_err());
        assert!(Credential::from_token(token_with(r#"{"name":"x"}"#)).is_err());
        assert!(Credential::from_token(token_with(r#"{"id":""}"#)).is_err());
    }

    #[test]
    fn test_unsigned_token_round_trips() {
        let cred = Credential::from_token(unsigned_token("alice")).unwrap();
        assert_eq!(cred.user_id(), "alice");
    }

    #[test]
    fn test_debug_redacts_token() {
        let cred = Credential::from_token(unsigned_token("alice")).unwrap();
        let printed = format!("{:?}", cred);
        assert!(printed.contains("alice"));
        assert!(!printed.contains(cred.token()));
    }
}
