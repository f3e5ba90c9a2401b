//! XMPP Bridge: authenticates as the actual game client would, performs
//! the 6-step handshake, keeps the session alive, and auto-joins the
//! party/pregame/coregame MUC rooms as the player's session changes.
//!
//! Unlike XmppMITM (which only relays bytes), the bridge terminates the
//! XMPP session itself — useful when the Riot client's own chat socket is
//! not available or trusted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_native_tls::TlsStream;

use crate::backoff::Backoff;
use crate::config::{UpstreamConfig, VoiceConfig};
use crate::events::{Event, EventSink};
use crate::model::{
    ChatConfig, ClientCredentials, GameSessionSnapshot, LoopState, MucRoom, MucRoomKind, TtsJob,
};
use crate::voice::TtsQueue;

use super::auth;
use super::auth::Lockfile;
use super::framing::drain_stanzas;
use super::router;
use super::stanzas::*;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(150);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const RECONNECT_DELAY: Duration = Duration::from_secs(10);
const GAME_STATE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Builds the MUC room JID for a given room kind and id, using the
/// per-kind domain suffixes (mirroring the classification domains
/// `router::classify_from_domain` recognizes on the way back in).
pub fn room_jid(kind: MucRoomKind, id: &str, affinity_domain: &str) -> String {
    let suffix = match kind {
        MucRoomKind::Party => "ares-parties",
        MucRoomKind::Pregame => "ares-pregame",
        MucRoomKind::CoregameTeam | MucRoomKind::CoregameAll => "ares-coregame",

    };
    format!("{id}@{suffix}.{affinity_domain}.pvp.net")
}

/// A command read from stdin, driving outbound chat/room actions.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgeCommand {
    Send {
        to: String,
        body: String,
        #[serde(rename = "msgType", default = "default_msg_type")]
        msg_type: String,
    },
    Join {
        room: String,
    },
    Leave {
        room: String,
    },
}

fn default_msg_type() -> String {
    "groupchat".to_string()
}

pub fn parse_command(line: &str) -> Option<BridgeCommand> {
    serde_json::from_str(line).ok()
}

/// Everything the bridge needs to run one connection attempt.
pub struct BridgeSession {
    pub credentials: ClientCredentials,
    pub affinity_host: String,
    pub affinity_domain: String,
    pub upstream: UpstreamConfig,
    pub events: EventSink,
    pub chat_config: watch::Receiver<ChatConfig>,
    /// Needed by the game-state poller to reach the local client's
    /// `/chat/v4/presences` endpoint.
    pub lockfile: Lockfile,
    pub tts_queue: Arc<TtsQueue>,
    pub voice: VoiceConfig,
}

struct JoinedRooms {
    rooms: Mutex<HashSet<String>>,
}

impl JoinedRooms {
    fn new() -> Self {
        Self { rooms: Mutex::new(HashSet::new()) }
    }

    async fn mark_joined(&self, jid: &str) -> bool {
        self.rooms.lock().await.insert(jid.to_string())
    }

    #[cfg(test)]
    async fn clear(&self) {
        self.rooms.lock().await.clear();
    }
}

/// Tracks the last `(loopState, primaryId)` dedup key the bridge has
/// reacted to, shared between the self-presence decode trigger and the
/// game-state poller trigger.
struct SessionTracker {
    last_key: Mutex<Option<(String, Option<String>)>>,
}

impl SessionTracker {
    fn new() -> Self {
        Self { last_key: Mutex::new(None) }
    }

    /// Returns true if `snapshot` is a transition not yet reacted to, and
    /// records it as reacted-to.
    async fn observe(&self, snapshot: &GameSessionSnapshot) -> bool {
        let key = snapshot.dedup_key();
        let mut last = self.last_key.lock().await;
        if last.as_ref() == Some(&key) {
            false
        } else {
            *last = Some(key);
            true
        }
    }
}

/// Maps a dedup'd session snapshot to the room(s) it implies should be
/// joined, using the room-JID construction table above.
fn rooms_for_snapshot(snapshot: &GameSessionSnapshot, affinity_domain: &str) -> Vec<MucRoom> {
    match snapshot.loop_state {
        LoopState::Menus => snapshot
            .party_id
            .as_ref()
            .map(|id| vec![track_as_room(MucRoomKind::Party, id.clone(), affinity_domain)])
            .unwrap_or_default(),
        LoopState::Pregame => snapshot
            .pregame_id
            .as_ref()
            .map(|id| vec![track_as_room(MucRoomKind::Pregame, id.clone(), affinity_domain)])
            .unwrap_or_default(),
        LoopState::InGame => snapshot
            .core_game_id
            .as_ref()
            .map(|id| {
                vec![
                    track_as_room(MucRoomKind::CoregameTeam, id.clone(), affinity_domain),
                    track_as_room(MucRoomKind::CoregameAll, format!("{id}all"), affinity_domain),
                ]
            })
            .unwrap_or_default(),
    }
}

/// Runs the bridge forever, reconnecting with a fixed 10s delay after
/// every connection failure and clearing joined-room bookkeeping on each
/// reconnect — rooms must be rejoined fresh, never assumed still-joined
/// across a dropped session.
pub async fn run(session_factory: impl Fn() -> BridgeSession, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let session = session_factory();
        let events = session.events.clone();
        tokio::select! {
            result = run_once(session) => {
                if let Err(e) = result {
                    events.emit(Event::info(format!("bridge session ended: {e}")));
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn run_once(session: BridgeSession) -> anyhow::Result<()> {
    let BridgeSession {
        credentials,
        affinity_host,
        affinity_domain,
        upstream: _upstream,
        events,
        mut chat_config,
        lockfile,
        tts_queue,
        voice,
    } = session;

    let tcp = TcpStream::connect((affinity_host.as_str(), 5223)).await?;
    let connector = match native_tls::TlsConnector::new() {
        Ok(c) => c,
        Err(e) => anyhow::bail!("tls connector build failed: {e}"),
    };
    let connector = tokio_native_tls::TlsConnector::from(connector);
    let tls = match connector.connect(&affinity_domain, tcp).await {
        Ok(t) => t,
        Err(e) => {
            events.emit(Event::info(format!(
                "TLS handshake to {affinity_domain} failed ({e}), retrying without certificate validation"
            )));
            let insecure = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()?;
            let insecure = tokio_native_tls::TlsConnector::from(insecure);
            let tcp = TcpStream::connect((affinity_host.as_str(), 5223)).await?;
            insecure.connect(&affinity_domain, tcp).await?
        }
    };

    let (mut reader, mut writer) = tokio::io::split(tls);
    let mut buf_reader = BufReader::new(&mut reader);

    handshake(&mut buf_reader, &mut writer, &affinity_domain, &credentials, &events).await?;

    writer.write_all(build_roster_get().as_bytes()).await?;
    writer.write_all(build_recent_conversations_get().as_bytes()).await?;
    writer.write_all(build_empty_presence().as_bytes()).await?;

    let joined = Arc::new(JoinedRooms::new());
    let stats = Arc::new(router::NarrationStats::default());
    let session_tracker = SessionTracker::new();

    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    let mut game_poll = tokio::time::interval(GAME_STATE_POLL_INTERVAL);
    let mut last_activity = tokio::time::Instant::now();
    let mut incoming_buf = Vec::new();
    let mut read_chunk = [0u8; 8192];

    loop {
        if last_activity.elapsed() > IDLE_TIMEOUT {
            anyhow::bail!("idle timeout exceeded, forcing reconnect");
        }

        tokio::select! {
            n = reader_read(&mut reader, &mut read_chunk) => {
                let n = n?;
                if n == 0 {
                    anyhow::bail!("upstream closed connection");
                }
                last_activity = tokio::time::Instant::now();
                incoming_buf.extend_from_slice(&read_chunk[..n]);
                for stanza in drain_stanzas(&mut incoming_buf) {
                    if stanza.is_stream_frame {
                        continue;
                    }
                    events.emit(Event::incoming(stanza.xml.clone()));
                    handle_presence_trigger(&stanza.xml, &credentials.puuid, &joined, &events, &mut writer).await;
                    if let Some(snapshot) = decode_self_presence_snapshot(&stanza.xml, &credentials.puuid) {
                        if session_tracker.observe(&snapshot).await {
                            for room in rooms_for_snapshot(&snapshot, &affinity_domain) {
                                join_room_with_retry(&room, &credentials.puuid, &joined, &events, &mut writer).await;
                            }
                        }
                    }
                    let config = chat_config.borrow().clone();
                    for message in router::parse_chat_messages(&stanza.xml, &credentials.puuid) {
                        if router::should_narrate(&config, &message) {
                            stats.record(&message);
                            tts_queue.enqueue(TtsJob {
                                text: message.content.clone(),
                                voice: voice.voice.clone(),
                                rate: voice.rate,
                            });
                        }
                    }
                }
            }
            _ = keepalive.tick() => {
                if writer.write_all(build_keepalive().as_bytes()).await.is_err() {
                    anyhow::bail!("keepalive write failed");
                }
                events.emit(Event::debug(format!(
                    "narrated {} messages ({} chars) this session",
                    stats.messages_narrated(),
                    stats.characters_narrated(),
                )));
            }
            _ = game_poll.tick() => {
                match auth::fetch_presence_snapshot(&lockfile, &credentials.puuid).await {
                    Ok(Some(snapshot)) if session_tracker.observe(&snapshot).await => {
                        for room in rooms_for_snapshot(&snapshot, &affinity_domain) {
                            join_room_with_retry(&room, &credentials.puuid, &joined, &events, &mut writer).await;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => events.emit(Event::info(format!("game-state poll failed: {e}"))),
                }
            }
            line = stdin_lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        if let Some(command) = parse_command(&text) {
                            handle_command(command, &mut writer, &joined, &events, &credentials.puuid).await;
                        }
                    }
                    Ok(None) => anyhow::bail!("stdin closed"),
                    Err(e) => anyhow::bail!("stdin read error: {e}"),
                }
            }
            _ = chat_config.changed() => {}
        }
    }
}

async fn reader_read(
    reader: &mut tokio::io::ReadHalf<TlsStream<TcpStream>>,
    buf: &mut [u8],
) -> anyhow::Result<usize> {
    Ok(reader.read(buf).await?)
}

async fn handle_command(
    command: BridgeCommand,
    writer: &mut tokio::io::WriteHalf<TlsStream<TcpStream>>,
    joined: &Arc<JoinedRooms>,
    events: &EventSink,
    own_puuid: &str,
) {
    let xml = match command {
        BridgeCommand::Send { to, body, msg_type } => build_outgoing_message(&to, &body, &msg_type),
        BridgeCommand::Join { room } => {
            joined.mark_joined(&room).await;
            let nick = &own_puuid[..own_puuid.len().min(8)];
            build_muc_join(&room, nick)
        }
        BridgeCommand::Leave { room } => build_muc_leave(&room, "self"),
    };
    events.emit(Event::outgoing(xml.clone()));
    if writer.write_all(xml.as_bytes()).await.is_err() {
        events.emit(Event::info("failed to write outbound command, connection likely dead"));
    }
}

/// One of the three independent MUC-auto-join triggers: a presence stanza
/// whose `from` matches a known room domain is treated as evidence the
/// room exists and should be joined if not already.
async fn handle_presence_trigger(
    xml: &str,
    own_puuid: &str,
    joined: &Arc<JoinedRooms>,
    events: &EventSink,
    writer: &mut tokio::io::WriteHalf<TlsStream<TcpStream>>,
) {
    if !xml.starts_with("<presence") {
        return;
    }
    let Some(from) = extract_attr(xml, "from") else { return };
    let room_jid = from.split('/').next().unwrap_or(&from).to_string();
    let domain = room_jid.split('@').nth(1).unwrap_or("");

    let is_known_muc = domain.starts_with("ares-parties")
        || domain.starts_with("ares-pregame")
        || domain.starts_with("ares-coregame");
    if !is_known_muc {
        return;
    }

    if !joined.mark_joined(&room_jid).await {
        return;
    }
    join_with_backoff(&room_jid, own_puuid, events, writer).await;
}

/// Second trigger: self-presence stanzas carry a base64 payload describing
/// the player's current session. Returns `None` for any stanza that isn't
/// self-presence or doesn't decode cleanly.
fn decode_self_presence_snapshot(xml: &str, own_puuid: &str) -> Option<GameSessionSnapshot> {
    if !xml.starts_with("<presence") {
        return None;
    }
    let from = extract_attr(xml, "from")?;
    let local_part = from.split('@').next().unwrap_or("");
    if local_part != own_puuid {
        return None;
    }
    let payload = extract_attr(xml, "p")?;
    router::decode_session_payload(&payload)
}

/// Sends a MUC-join presence, retrying up to 3 times total with a 1s-base,
/// 2x exponential backoff on write failure.
async fn join_with_backoff(
    room_jid: &str,
    own_puuid: &str,
    events: &EventSink,
    writer: &mut tokio::io::WriteHalf<TlsStream<TcpStream>>,
) {
    let nick = &own_puuid[..own_puuid.len().min(8)];
    let xml = build_muc_join(room_jid, nick);
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0);

    for attempt in 0..3 {
        events.emit(Event::outgoing(xml.clone()));
        if writer.write_all(xml.as_bytes()).await.is_ok() {
            events.emit(Event::room_joined(room_jid.to_string()));
            return;
        }
        events.emit(Event::info(format!("MUC join write failed for {room_jid} (attempt {})", attempt + 1)));
        if attempt < 2 {
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
}

/// Joins a `MucRoom` derived from a game-state snapshot (triggers 2 and 3),
/// skipping rooms already joined this session.
async fn join_room_with_retry(
    room: &MucRoom,
    own_puuid: &str,
    joined: &Arc<JoinedRooms>,
    events: &EventSink,
    writer: &mut tokio::io::WriteHalf<TlsStream<TcpStream>>,
) {
    if !joined.mark_joined(&room.jid).await {
        return;
    }
    join_with_backoff(&room.jid, own_puuid, events, writer).await;
}

/// The 6-step handshake: open stream, wait for the X-Riot-RSO-PAS
/// mechanism offer, authenticate, re-open the stream, wait for post-auth
/// features, then bind + session + entitlements IQs.
async fn handshake(
    reader: &mut BufReader<&mut tokio::io::ReadHalf<TlsStream<TcpStream>>>,
    writer: &mut tokio::io::WriteHalf<TlsStream<TcpStream>>,
    domain: &str,
    credentials: &ClientCredentials,
    events: &EventSink,
) -> anyhow::Result<()> {
    writer.write_all(build_stream_open(domain).as_bytes()).await?;
    let features = read_until_stanza(reader).await?;
    if !offers_riot_mechanism(&features) {
        anyhow::bail!("upstream did not offer X-Riot-RSO-PAS mechanism");
    }

    let pas_token = auth::fetch_pas_token(
        &UpstreamConfig::default(),
        &credentials.access_token,
        &credentials.entitlement_token,
        events,
    )
    .await?;

    writer
        .write_all(build_riot_auth(&credentials.access_token, &pas_token).as_bytes())
        .await?;
    let auth_result = read_until_stanza(reader).await?;
    if !is_sasl_success(&auth_result) {
        anyhow::bail!("SASL authentication rejected");
    }

    writer.write_all(build_stream_open(domain).as_bytes()).await?;
    let post_auth_features = read_until_stanza(reader).await?;
    if !has_stream_features(&post_auth_features) {
        anyhow::bail!("no stream features after authentication");
    }

    writer.write_all(build_bind_request().as_bytes()).await?;
    let bind_result = read_until_stanza(reader).await?;
    events.emit(Event::incoming(bind_result));

    writer.write_all(build_session_request().as_bytes()).await?;
    let session_result = read_until_stanza(reader).await?;
    events.emit(Event::incoming(session_result));

    writer
        .write_all(build_entitlements_iq(&credentials.entitlement_token).as_bytes())
        .await?;
    let entitlements_result = read_until_stanza(reader).await?;
    events.emit(Event::incoming(entitlements_result));

    Ok(())
}

/// Reads raw bytes until the stanza tokenizer can extract at least one
/// complete top-level element, then returns its XML. Used only during the
/// handshake, where stanzas arrive one at a time and synchronously.
async fn read_until_stanza(
    reader: &mut BufReader<&mut tokio::io::ReadHalf<TlsStream<TcpStream>>>,
) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("stream closed during handshake");
        }
        buf.extend_from_slice(&chunk[..n]);
        let stanzas = drain_stanzas(&mut buf);
        if let Some(first) = stanzas.into_iter().next() {
            return Ok(first.xml);
        }
    }
}

pub fn track_as_room(kind: MucRoomKind, id: String, affinity_domain: &str) -> MucRoom {
    MucRoom { jid: room_jid(kind, &id, affinity_domain), kind }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_jid_party() {
        let jid = room_jid(MucRoomKind::Party, "party-123", "jp1");
        assert_eq!(jid, "party-123@ares-parties.jp1.pvp.net");
    }

    #[test]
    fn test_room_jid_pregame() {
        let jid = room_jid(MucRoomKind::Pregame, "pre-1", "na");
        assert_eq!(jid, "pre-1@ares-pregame.na.pvp.net");
    }

    #[test]
    fn test_room_jid_coregame_team_and_all_share_domain() {
        let team = room_jid(MucRoomKind::CoregameTeam, "match1", "eu");
        let all = room_jid(MucRoomKind::CoregameAll, "match1all", "eu");
        assert_eq!(team, "match1@ares-coregame.eu.pvp.net");
        assert_eq!(all, "match1all@ares-coregame.eu.pvp.net");
    }

    #[test]
    fn test_parse_command_send() {
        let line = r#"{"type":"send","to":"party@conf.example","body":"gg"}"#;
        let cmd = parse_command(line).unwrap();
        assert_eq!(
            cmd,
            BridgeCommand::Send {
                to: "party@conf.example".to_string(),
                body: "gg".to_string(),
                msg_type: "groupchat".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_command_join() {
        let line = r#"{"type":"join","room":"party@conf.example"}"#;
        let cmd = parse_command(line).unwrap();
        assert_eq!(cmd, BridgeCommand::Join { room: "party@conf.example".to_string() });
    }

    #[test]
    fn test_parse_command_send_honors_camel_case_msg_type() {
        let line = r#"{"type":"send","to":"party@conf.example","body":"hi","msgType":"chat"}"#;
        let cmd = parse_command(line).unwrap();
        assert_eq!(
            cmd,
            BridgeCommand::Send {
                to: "party@conf.example".to_string(),
                body: "hi".to_string(),
                msg_type: "chat".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_command_rejects_garbage() {
        assert_eq!(parse_command("not json"), None);
        assert_eq!(parse_command(r#"{"type":"unknown"}"#), None);
    }

    #[tokio::test]
    async fn test_joined_rooms_dedups() {
        let joined = JoinedRooms::new();
        assert!(joined.mark_joined("a@b").await);
        assert!(!joined.mark_joined("a@b").await);
        joined.clear().await;
        assert!(joined.mark_joined("a@b").await);
    }

    #[test]
    fn test_decode_self_presence_snapshot_ignores_other_peoples_presence() {
        let xml = "<presence from='someone-else@resource.example/x' p='irrelevant'/>";
        assert!(decode_self_presence_snapshot(xml, "me").is_none());
    }

    #[test]
    fn test_decode_self_presence_snapshot_decodes_own_payload() {
        use base64::Engine;
        let payload = serde_json::json!({ "sessionLoopState": "PREGAME", "pregameId": "pre-9" });
        let encoded = base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&payload).unwrap());
        let xml = format!("<presence from='me@domain.example' p='{encoded}'/>");
        let snapshot = decode_self_presence_snapshot(&xml, "me").unwrap();
        assert_eq!(snapshot.pregame_id, Some("pre-9".to_string()));
    }

    #[tokio::test]
    async fn test_session_tracker_dedups_identical_transitions() {
        let tracker = SessionTracker::new();
        let snapshot = GameSessionSnapshot {
            loop_state: LoopState::Pregame,
            party_id: None,
            pregame_id: Some("pre-1".to_string()),
            core_game_id: None,
        };
        assert!(tracker.observe(&snapshot).await);
        assert!(!tracker.observe(&snapshot).await);
    }

    #[test]
    fn test_rooms_for_snapshot_ingame_yields_team_and_all() {
        let snapshot = GameSessionSnapshot {
            loop_state: LoopState::InGame,
            party_id: None,
            pregame_id: None,
            core_game_id: Some("match1".to_string()),
        };
        let rooms = rooms_for_snapshot(&snapshot, "eu");
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].jid, "match1@ares-coregame.eu.pvp.net");
        assert_eq!(rooms[1].jid, "match1all@ares-coregame.eu.pvp.net");
    }

    #[test]
    fn test_rooms_for_snapshot_menus_without_party_yields_nothing() {
        let snapshot = GameSessionSnapshot {
            loop_state: LoopState::Menus,
            party_id: None,
            pregame_id: None,
            core_game_id: None,
        };
        assert!(rooms_for_snapshot(&snapshot, "eu").is_empty());
    }
}
