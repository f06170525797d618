use std::{net::SocketAddr, str, sync::Arc};

use axum::extract::ConnectInfo;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use serde_json::Value as JsonValue;
use socketioxide::adapter::Adapter;
use socketioxide::handler::{ConnectMiddleware, Value};
use tracing::{error, info, warn};

use crate::auth::{authenticate_token, is_revoked};
use crate::error::AppError;
use crate::socket::types::SocketUserContext;
use crate::state::AppState;

/// Handshake gate: resolve the client IP, charge the rate limiter,
/// pull the bearer token from the handshake auth field or the
/// `Authorization` header, check revocation, verify, and attach the
/// session context. Rejections terminate the handshake with the
/// serialized error payload as the reason.
#[derive(Clone)]
pub(crate) struct SocketAuthMiddleware {
    state: Arc<AppState>,
}

impl SocketAuthMiddleware {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    fn format_error(error: AppError) -> String {
        let (status, payload) = error.into_payload();
        match serde_json::to_string(&payload) {
            Ok(serialized) => serialized,
            Err(err) => {
                error!(?err, "failed to serialize handshake rejection");
                format!("{{\"status\":{}}}", status.as_u16())
            }
        }
    }
}

impl<A> ConnectMiddleware<A, ()> for SocketAuthMiddleware
where
    A: Adapter + 'static,
{
    fn call<'a>(
        &'a self,
        socket: Arc<socketioxide::socket::Socket<A>>,
        auth: &'a Option<Value>,
    ) -> impl futures_util::Future<
        Output = Result<(), Box<dyn std::fmt::Display + std::marker::Send + 'static>>,
    > + std::marker::Send {
        let state = self.state.clone();

        Box::pin(async move {
            let parts = socket.req_parts();
            let client_ip = resolve_client_ip(
                &parts.headers,
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|info| info.0),
            );

            if state.rate_limiter.check_and_record(&client_ip).is_err() {
                let err = AppError::rate_limited("too many connections");
                state.metrics.error_occurred(err.kind());
                warn!(client_ip = %client_ip, "handshake rejected by rate limiter");
                return Err(Box::new(Self::format_error(err))
                    as Box<dyn std::fmt::Display + Send>);
            }

            let token = handshake_token(auth.as_ref())
                .or_else(|| bearer_from_headers(&parts.headers));

            if let Some(token) = token.as_deref() {
                if is_revoked(&state.store, token).await {
                    let err = AppError::auth_rejected("token has been revoked");
                    state.metrics.error_occurred(err.kind());
                    warn!(client_ip = %client_ip, "handshake rejected: revoked token");
                    return Err(Box::new(Self::format_error(err))
                        as Box<dyn std::fmt::Display + Send>);
                }
            }

            let user = match authenticate_token(&state.config, token.as_deref()) {
                Ok(user) => user,
                Err(err) => {
                    state.metrics.error_occurred(err.kind());
                    warn!(client_ip = %client_ip, error = %err, "handshake authentication refused");
                    return Err(Box::new(Self::format_error(err))
                        as Box<dyn std::fmt::Display + Send>);
                }
            };

            let user_agent = parts
                .headers
                .get("user-agent")
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let country = parts
                .headers
                .get("cf-ipcountry")
                .or_else(|| parts.headers.get("x-country"))
                .and_then(|value| value.to_str().ok());

            state
                .metrics
                .connection_opened(user_agent.as_deref(), country);

            let socket_ref = socketioxide::extract::SocketRef::from(socket.clone());
            socket_ref.extensions.insert(state.clone());
            socket_ref.extensions.insert(SocketUserContext::new(
                user.clone(),
                client_ip.clone(),
                user_agent,
            ));

            info!(
                session_id = %socket_ref.id,
                user_id = %user.id,
                client_ip = %client_ip,
                "session authenticated"
            );

            Ok(())
        })
    }
}

/// First hop of `X-Forwarded-For` when present, else the peer address.
fn resolve_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Pull a bearer token out of the Socket.IO handshake `auth` payload.
/// Clients send either a bare token string, a JSON object with a
/// `token`/`authorization` field, or `key=value` pairs.
fn handshake_token(auth: Option<&Value>) -> Option<String> {
    let value = auth?;

    if let Some(text) = value.as_str() {
        return parse_token_text(text.as_ref());
    }
    if let Some(bytes) = value.as_bytes() {
        if let Ok(text) = str::from_utf8(bytes.as_ref()) {
            return parse_token_text(text);
        }
    }
    None
}

fn parse_token_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(json) = serde_json::from_str::<JsonValue>(trimmed) {
        return token_from_json(&json);
    }

    if trimmed.contains('=') {
        for pair in trimmed.split('&') {
            let mut iter = pair.splitn(2, '=');
            let key = iter.next().unwrap_or_default().to_ascii_lowercase();
            let value = iter.next().unwrap_or_default();
            if matches!(key.as_str(), "token" | "authorization" | "bearer") {
                return normalize_token(value);
            }
        }
        return None;
    }

    normalize_token(trimmed)
}

fn token_from_json(json: &JsonValue) -> Option<String> {
    match json {
        JsonValue::Object(map) => {
            for key in ["token", "authorization", "bearer"] {
                if let Some(value) = map.get(key).and_then(JsonValue::as_str) {
                    if let Some(token) = normalize_token(value) {
                        return Some(token);
                    }
                }
            }
            None
        }
        JsonValue::String(text) => normalize_token(text),
        _ => None,
    }
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(normalize_token)
}

fn normalize_token(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.len() > 7 && trimmed[..7].eq_ignore_ascii_case("bearer ") {
        let token = trimmed[7..].trim();
        (!token.is_empty()).then(|| token.to_owned())
    } else {
        Some(trimmed.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let peer: SocketAddr = "192.168.1.5:443".parse().unwrap();
        assert_eq!(resolve_client_ip(&headers, Some(peer)), "203.0.113.9");
    }

    #[test]
    fn client_ip_falls_back_to_peer_then_unknown() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "192.168.1.5:443".parse().unwrap();
        assert_eq!(resolve_client_ip(&headers, Some(peer)), "192.168.1.5");
        assert_eq!(resolve_client_ip(&headers, None), "unknown");
    }

    #[test]
    fn token_text_accepts_json_pairs_and_raw() {
        assert_eq!(
            parse_token_text("{\"token\": \"abc\"}"),
            Some("abc".to_owned())
        );
        assert_eq!(
            parse_token_text("{\"authorization\": \"Bearer abc\"}"),
            Some("abc".to_owned())
        );
        assert_eq!(parse_token_text("token=abc&foo=bar"), Some("abc".to_owned()));
        assert_eq!(parse_token_text("raw-token"), Some("raw-token".to_owned()));
        assert_eq!(parse_token_text("   "), None);
        assert_eq!(parse_token_text("{\"other\": 1}"), None);
    }

    #[test]
    fn bearer_header_is_normalized() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  abc "));
        assert_eq!(bearer_from_headers(&headers), Some("abc".to_owned()));

        let mut bare = HeaderMap::new();
        bare.insert(AUTHORIZATION, HeaderValue::from_static("abc"));
        assert_eq!(bearer_from_headers(&bare), Some("abc".to_owned()));
    }
}
