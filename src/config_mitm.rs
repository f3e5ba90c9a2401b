//! ConfigMITM: a loopback HTTP server that mimics the Riot clientconfig
//! service, rewriting the chat-host/port/allow-bad-cert keys (and the
//! affinity-to-host map) so the game client connects its chat socket to
//! XmppMITM instead of the real chat host.

use std::sync::Arc;

use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use tokio::sync::watch;

use crate::events::{Event, EventSink};

#[derive(Clone)]
struct AppState {
    upstream_base: String,
    xmpp_port: u16,
    events: EventSink,
    client: reqwest::Client,
    /// Publishes the real chat host discovered from the last clientconfig
    /// response, so XmppMITM knows where to relay to without needing its
    /// own credential-and-affinity resolution.
    discovered_chat_host: watch::Sender<Option<String>>,
}

/// The exact key names Riot's clientconfig response uses for the chat
/// connection; preserved verbatim.
const CHAT_HOST_KEY: &str = "chat.host";
const CHAT_PORT_KEY: &str = "chat.port";
const CHAT_ALLOW_BAD_CERT_KEY: &str = "chat.allow_bad_cert.enabled";
const CHAT_AFFINITY_KEY: &str = "chat.affinities";

pub fn router(
    upstream_base: String,
    xmpp_port: u16,
    events: EventSink,
    discovered_chat_host: watch::Sender<Option<String>>,
) -> Router {
    let state = AppState {
        upstream_base,
        xmpp_port,
        events,
        client: reqwest::Client::new(),
        discovered_chat_host,
    };
    Router::new()
        .fallback(get(proxy_request).post(proxy_request))
        .with_state(Arc::new(state))
}

async fn proxy_request(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    let upstream_url = format!("{}{}", state.upstream_base, uri);

    let mut request = state.client.get(&upstream_url);
    for (name, value) in headers.iter() {
        if name != axum::http::header::HOST {
            request = request.header(name, value);
        }
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            state.events.emit(Event::error(crate::error::ErrorCode::Other, format!("upstream clientconfig fetch failed: {e}")));
            return (StatusCode::BAD_GATEWAY, "upstream fetch failed").into_response();
        }
    };

    let status = response.status();
    let content_type = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .cloned();
    let body_bytes = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            state.events.emit(Event::error(crate::error::ErrorCode::Other, format!("upstream body read failed: {e}")));
            return (StatusCode::BAD_GATEWAY, "upstream read failed").into_response();
        }
    };

    let is_config_path = uri.path().contains("/config/player");
    if !is_config_path {
        let mut builder = Response::builder().status(status);
        if let Some(ct) = content_type {
            builder = builder.header(axum::http::header::CONTENT_TYPE, ct);
        }
        return builder.body(axum::body::Body::from(body_bytes)).unwrap();
    }

    let rewritten = match serde_json::from_slice::<Value>(&body_bytes) {
        Ok(json) => {
            if let Some(host) = json.get(CHAT_HOST_KEY).and_then(|v| v.as_str()) {
                let _ = state.discovered_chat_host.send(Some(host.to_string()));
            }
            let rewritten = rewrite_clientconfig(json, state.xmpp_port);
            serde_json::to_vec(&rewritten).unwrap_or_else(|_| body_bytes.to_vec())
        }
        Err(e) => {
            // Fail open: emit an error event but still return the
            // original body verbatim so the client doesn't
            // simply hang.
            state.events.emit(Event::error(crate::error::ErrorCode::Other, format!("clientconfig JSON unparseable: {e}")));
            body_bytes.to_vec()
        }
    };

    let mut builder = Response::builder().status(status);
    if let Some(ct) = content_type {
        builder = builder.header(axum::http::header::CONTENT_TYPE, ct);
    }
    builder.body(axum::body::Body::from(rewritten)).unwrap()
}

/// Rewrites the chat host/port/allow-bad-cert keys (and affinity map, if
/// present) to point at the local XmppMITM listener.
fn rewrite_clientconfig(mut json: Value, xmpp_port: u16) -> Value {
    if let Some(obj) = json.as_object_mut() {
        if obj.contains_key(CHAT_HOST_KEY) {
            obj.insert(CHAT_HOST_KEY.to_string(), Value::String("127.0.0.1".to_string()));
        }
        if obj.contains_key(CHAT_PORT_KEY) {
            obj.insert(CHAT_PORT_KEY.to_string(), Value::Number(xmpp_port.into()));
        }
        if obj.contains_key(CHAT_ALLOW_BAD_CERT_KEY) {
            obj.insert(CHAT_ALLOW_BAD_CERT_KEY.to_string(), Value::Bool(true));
        }
        if let Some(affinities) = obj.get_mut(CHAT_AFFINITY_KEY).and_then(|v| v.as_object_mut()) {
            for (_affinity, host) in affinities.iter_mut() {
                *host = Value::String("127.0.0.1".to_string());
            }
        }
    }
    json
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rewrite_preserves_other_keys() {
        let input = json!({
            "chat.host": "chat-affinity.jp1.pvp.net",
            "chat.port": 5223,
            "chat.allow_bad_cert.enabled": false,
            "some.unrelated.key": "untouched",
        });
        let out = rewrite_clientconfig(input, 35478);
        assert_eq!(out["chat.host"], "127.0.0.1");
        assert_eq!(out["chat.port"], 35478);
        assert_eq!(out["chat.allow_bad_cert.enabled"], true);
        assert_eq!(out["some.unrelated.key"], "untouched");
    }

    #[test]
    fn test_rewrite_affinity_map() {
        let input = json!({
            "chat.affinities": { "na": "chat-na.pvp.net", "eu": "chat-eu.pvp.net" }
        });
        let out = rewrite_clientconfig(input, 35478);
        assert_eq!(out["chat.affinities"]["na"], "127.0.0.1");
        assert_eq!(out["chat.affinities"]["eu"], "127.0.0.1");
    }

    #[test]
    fn test_rewrite_missing_keys_is_a_noop() {
        let input = json!({ "unrelated": 1 });
        let out = rewrite_clientconfig(input.clone(), 35478);
        assert_eq!(out, input);
    }
}
