//! Credential discovery and token exchange for the XMPP Bridge path:
//! lockfile -> entitlements -> session poll -> PAS token -> affinity
//! lookup. All HTTP calls go through one `reqwest::Client`, built with an
//! explicit, logged choice about certificate verification — disabling
//! upstream validation is a last resort and always logged when it happens.

use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use tokio::time::timeout;

use crate::backoff::Backoff;
use crate::config::UpstreamConfig;
use crate::error::ErrorKind;
use crate::events::{Event, EventSink};
use crate::model::{AffinityBinding, ClientCredentials};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Contents of the Riot lockfile: `name:pid:port:password:protocol`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lockfile {
    pub name: String,
    pub pid: u32,
    pub port: u16,
    pub password: String,
    pub protocol: String,
}

impl Lockfile {
    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let fields: Vec<&str> = contents.trim().split(':').collect();
        if fields.len() != 5 {
            anyhow::bail!("lockfile must have exactly 5 colon-separated fields, got {}", fields.len());
        }
        Ok(Self {
            name: fields[0].to_string(),
            pid: fields[1].parse()?,
            port: fields[2].parse()?,
            password: fields[3].to_string(),
            protocol: fields[4].to_string(),
        })
    }

    pub fn basic_auth_header(&self) -> String {
        let raw = format!("riot:{}", self.password);
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
    }
}

/// Polls for the lockfile's existence up to a 30s cap, a precondition
/// ahead of credential discovery.
pub async fn wait_for_lockfile(path: &std::path::Path) -> anyhow::Result<Lockfile> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            return Lockfile::parse(&contents);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(ErrorKind::FatalStartup {
                code: 404,
                reason: format!("lockfile not found at {}", path.display()),
            });
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn client_for(tls_verify: bool) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(!tls_verify)
        .timeout(HTTP_TIMEOUT)
        .build()
        .expect("reqwest client builder should not fail with these options")
}

#[derive(Deserialize)]
struct EntitlementsResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "entitlementsToken")]
    entitlement_token: String,
}

/// Exchanges the lockfile password for an access token + entitlement
/// token via the local client's loopback HTTPS endpoint.
pub async fn fetch_entitlements(lockfile: &Lockfile) -> anyhow::Result<(String, String)> {
    let client = client_for(false);
    let url = format!("https://127.0.0.1:{}/entitlements/v1/token", lockfile.port);
    let response = client
        .get(&url)
        .header("Authorization", lockfile.basic_auth_header())
        .send()
        .await?;
    if !response.status().is_success() {
        anyhow::bail!(ErrorKind::AuthNotReady);
    }
    let parsed: EntitlementsResponse = response.json().await?;
    Ok((parsed.access_token, parsed.entitlement_token))
}

#[derive(Deserialize)]
struct ChatSessionResponse {
    loaded: bool,
    puuid: Option<String>,
    region: Option<String>,
}

/// Polls the local client's chat session endpoint until `loaded` is true,
/// capped at 30s total.
pub async fn poll_chat_session(lockfile: &Lockfile) -> anyhow::Result<(String, String)> {
    let client = client_for(false);
    let url = format!("https://127.0.0.1:{}/chat/v1/session", lockfile.port);
    let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5), 1.5);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);

    loop {
        let response = client
            .get(&url)
            .header("Authorization", lockfile.basic_auth_header())
            .send()
            .await;

        if let Ok(response) = response {
            if let Ok(session) = response.json::<ChatSessionResponse>().await {
                if session.loaded {
                    if let (Some(puuid), Some(region)) = (session.puuid, session.region) {
                        return Ok((puuid, region));
                    }
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(ErrorKind::AuthNotReady);
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

/// Raw shape of a PAS response: either a bare JSON string token, or an
/// object carrying the token under `token` or `accessToken`.
fn parse_pas_token(body: &str) -> Option<String> {
    if let Ok(serde_json::Value::String(s)) = serde_json::from_str(body) {
        return Some(s);
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(token) = value.get("token").and_then(|v| v.as_str()) {
            return Some(token.to_string());
        }
        if let Some(token) = value.get("accessToken").and_then(|v| v.as_str()) {
            return Some(token.to_string());
        }
    }
    // Some deployments return the token unquoted, as a raw string body.
    let trimmed = body.trim();
    if !trimmed.is_empty() && !trimmed.starts_with('{') {
        return Some(trimmed.trim_matches('"').to_string());
    }
    None
}

/// Fetches the PAS token from the geo routing service, retrying up to 5
/// times with a 3s-base, 1.5x exponential backoff on transient errors, and
/// sleeping 500ms before every attempt.
pub async fn fetch_pas_token(
    upstream: &UpstreamConfig,
    access_token: &str,
    entitlement_token: &str,
    events: &EventSink,
) -> anyhow::Result<String> {
    let client = client_for(true);
    let url = format!("{}/pas/v1/service/chat", upstream.pas_base);
    let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(60), 1.5);

    for attempt in 0..5 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let result = timeout(
            HTTP_TIMEOUT,
            client
                .get(&url)
                .bearer_auth(access_token)
                .header("X-Riot-Entitlements-JWT", entitlement_token)
                .send(),
        )
        .await;

        match result {
            Ok(Ok(response)) if response.status().is_success() => {
                let body = response.text().await?;
                if let Some(token) = parse_pas_token(&body) {
                    return Ok(token);
                }
                anyhow::bail!(ErrorKind::Internal("PAS response body unparseable".to_string()));
            }
            _ => {
                events.emit(Event::info(format!("PAS token fetch attempt {} failed, retrying", attempt + 1)));
                if attempt < 4 {
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    anyhow::bail!(ErrorKind::Transient("PAS token fetch exhausted retries".to_string()))
}

/// Decodes the affinity out of a PAS token's middle (payload) base64
/// segment. Falls back to `fallback_region` if the segment can't be
/// decoded.
pub fn decode_affinity_from_pas_token(pas_token: &str, fallback_region: &str) -> String {
    let segments: Vec<&str> = pas_token.split('.').collect();
    if segments.len() < 2 {
        return fallback_region.to_string();
    }
    let payload = match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(segments[1]) {
        Ok(bytes) => bytes,
        Err(_) => return fallback_region.to_string(),
    };
    let json: serde_json::Value = match serde_json::from_slice(&payload) {
        Ok(v) => v,
        Err(_) => return fallback_region.to_string(),
    };
    json.get("affinity")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| fallback_region.to_string())
}

/// Fetches clientconfig and extracts the host/domain binding for `affinity`.
pub async fn fetch_affinity_binding(
    upstream: &UpstreamConfig,
    access_token: &str,
    affinity: &str,
) -> anyhow::Result<AffinityBinding> {
    let client = client_for(true);
    let url = format!("{}/api/v1/config/player", upstream.clientconfig_base);
    let response = client.get(&url).bearer_auth(access_token).send().await?;
    let json: serde_json::Value = response.json().await?;

    let host = json
        .get("chat.affinities")
        .and_then(|v| v.get(affinity))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let domain = json
        .get("chat.affinity_domains")
        .and_then(|v| v.get(affinity))
        .and_then(|v| v.as_str())
        .unwrap_or(affinity)
        .to_string();

    Ok(AffinityBinding {
        affinity: affinity.to_string(),
        xmpp_host: host,
        xmpp_domain: domain,
    })
}

pub fn credentials(access_token: String, entitlement_token: String, puuid: String, region: String) -> ClientCredentials {
    ClientCredentials { access_token, entitlement_token, puuid, region }
}

/// Polls the local client's `/chat/v4/presences` endpoint for the caller's
/// own entry and decodes its session payload — the game-state poll variant
/// of the MUC-auto-join triggers. `core-game`/`pregame` loopback endpoints
/// require discovering the game process's own port, which the lockfile
/// doesn't carry; this poll covers the endpoint that's always reachable
/// through the lockfile port.
pub async fn fetch_presence_snapshot(
    lockfile: &Lockfile,
    own_puuid: &str,
) -> anyhow::Result<Option<crate::model::GameSessionSnapshot>> {
    let client = client_for(false);
    let url = format!("https://127.0.0.1:{}/chat/v4/presences", lockfile.port);
    let response = client
        .get(&url)
        .header("Authorization", lockfile.basic_auth_header())
        .send()
        .await?;
    if !response.status().is_success() {
        return Ok(None);
    }
    let json: serde_json::Value = response.json().await?;
    let Some(presences) = json.get("presences").and_then(|v| v.as_array()) else {
        return Ok(None);
    };
    for presence in presences {
        if presence.get("puuid").and_then(|v| v.as_str()) != Some(own_puuid) {
            continue;
        }
        if let Some(private) = presence.get("private").and_then(|v| v.as_str()) {
            return Ok(super::router::decode_session_payload(private));
        }
    }
    Ok(None)
}
