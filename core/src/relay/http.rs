/// Chat REST surface of the development relay
///
/// Endpoints (all require `Authorization: Bearer <token>`):
///   GET   /api/chat/conversations
///   POST  /api/chat/conversations                 body: {"other_user_id":"..."}
///   GET   /api/chat/conversations/:id/messages    ?limit=N&skip=N
///   PATCH /api/chat/messages/:id/read
use crate::credential::decode_identity;
use crate::error::{ChatError, Result};
use crate::relay::Relay;
use crate::types::{ConversationId, MessageId};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use tokio::net::TcpListener;
use tracing::{error, info};

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, PATCH, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_resp(StatusCode::OK, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

fn internal(e: ChatError) -> Resp {
    error!("Chat API storage failure: {}", e);
    json_err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
}

// ─── Entry point ─────────────────────────────────────────────────────────────

/// Serve the chat REST surface on an already-bound listener
pub async fn serve(relay: Relay, listener: TcpListener) -> Result<()> {
    info!("Chat API started on http://{}", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let relay = relay.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let relay = relay.clone();
                        async move { Ok::<_, Infallible>(handle(req, relay).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        if !e.is_incomplete_message() {
                            error!("Chat API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Chat API accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, relay: Relay) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    // CORS preflight
    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(bytes::Bytes::new()).boxed())
            .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()));
    }

    let user_id = match bearer_user(&req) {
        Some(user_id) => user_id,
        None => return json_err(StatusCode::UNAUTHORIZED, "missing or invalid bearer token"),
    };

    let segments: Vec<&str> = path
        .trim_start_matches("/api/chat/")
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    if !path.starts_with("/api/chat/") {
        return json_err(StatusCode::NOT_FOUND, "not found");
    }

    match (method, segments.as_slice()) {
        (Method::GET, ["conversations"]) => get_conversations(&user_id, &relay),
        (Method::POST, ["conversations"]) => post_conversation(req, &user_id, &relay).await,
        (Method::GET, ["conversations", id, "messages"]) => {
            get_messages(&decode_segment(id), &query, &user_id, &relay)
        }
        (Method::PATCH, ["messages", id, "read"]) => {
            patch_read(&decode_segment(id), &user_id, &relay)
        }
        _ => json_err(StatusCode::NOT_FOUND, "not found"),
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

fn get_conversations(user_id: &str, relay: &Relay) -> Resp {
    match relay.store().summaries_for(user_id) {
        Ok(conversations) => json_ok(serde_json::json!({ "conversations": conversations })),
        Err(e) => internal(e),
    }
}

#[derive(Deserialize)]
struct CreateConversationRequest {
    #[serde(alias = "otherUserId")]
    other_user_id: String,
}

async fn post_conversation(
    req: Request<hyper::body::Incoming>,
    user_id: &str,
    relay: &Relay,
) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let r: CreateConversationRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };
    match relay.start_conversation(user_id, &r.other_user_id) {
        Ok((conversation, _)) => json_ok(serde_json::json!({ "conversation": conversation })),
        Err(ChatError::ConversationUnavailable(reason)) => {
            json_err(StatusCode::UNPROCESSABLE_ENTITY, &reason)
        }
        Err(e) => internal(e),
    }
}

fn get_messages(conversation_id: &str, query: &str, user_id: &str, relay: &Relay) -> Resp {
    let id = ConversationId::new(conversation_id);
    match relay.store().conversation(&id) {
        Ok(Some(conversation)) if conversation.includes(user_id) => {}
        Ok(Some(_)) => return json_err(StatusCode::FORBIDDEN, "not a participant"),
        Ok(None) => return json_err(StatusCode::NOT_FOUND, "conversation not found"),
        Err(e) => return internal(e),
    }

    let limit = parse_query_usize(query, "limit")
        .unwrap_or(DEFAULT_PAGE)
        .clamp(1, MAX_PAGE);
    let skip = parse_query_usize(query, "skip").unwrap_or(0);
    match relay.store().page(&id, skip, limit) {
        Ok(messages) => json_ok(serde_json::json!({
            "messages": messages,
            "limit": limit,
            "skip": skip,
        })),
        Err(e) => internal(e),
    }
}

fn patch_read(message_id: &str, user_id: &str, relay: &Relay) -> Resp {
    match relay.store().mark_read(&MessageId::new(message_id), user_id) {
        Ok(Some(message)) => json_ok(serde_json::json!({ "message": message })),
        Ok(None) => json_err(StatusCode::NOT_FOUND, "message not found"),
        Err(e) => internal(e),
    }
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn bearer_user(req: &Request<hyper::body::Incoming>) -> Option<String> {
    let header = req.headers().get(hyper::header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    decode_identity(token.trim()).ok().map(|identity| identity.user_id)
}

fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

async fn read_body(req: Request<hyper::body::Incoming>) -> std::result::Result<bytes::Bytes, String> {
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}

fn parse_query_usize(query: &str, key: &str) -> Option<usize> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return v.parse().ok();
            }
        }
    }
    None
}
