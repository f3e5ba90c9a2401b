//! Stanza Parser & Chat Router: turns `incoming` XML into classified
//! `ChatMessage`s and decides which of them are worth narrating.

use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use serde::Deserialize;

use crate::model::{ChatConfig, ChatKind, ChatMessage, GameSessionSnapshot, LoopState};

use super::stanzas::{extract_attr, extract_element_text, extract_message_elements, unescape_xml};

/// Classifies a `from` JID's domain part into a chat kind by matching
/// known MUC service prefixes. Returns `None` when the domain doesn't
/// match any known MUC service and the stanza isn't a `type='chat'`
/// whisper either.
fn classify_from_domain(from: &str, msg_type: Option<&str>) -> Option<ChatKind> {
    let domain_and_resource = from.split('@').nth(1).unwrap_or("");
    let domain = domain_and_resource.split('/').next().unwrap_or("");
    let local_part = from.split('@').next().unwrap_or("");

    if domain.starts_with("ares-parties") {
        return Some(ChatKind::Party);
    }
    if domain.starts_with("ares-pregame") {
        return Some(ChatKind::Team);
    }
    if domain.starts_with("ares-coregame") {
        // An "all" room id ends in the literal suffix "all" (e.g.
        // "match123all"); anything else in a coregame room is team chat.
        return Some(if local_part.ends_with("all") {
            ChatKind::All
        } else {
            ChatKind::Team
        });
    }

    if msg_type == Some("chat") {
        return Some(ChatKind::Whisper);
    }

    None
}

/// Extracts the sender id: the resource part after the rightmost `/` in
/// `from`, or the bare local-part before `@` if there is no resource.
fn sender_id(from: &str) -> String {
    if let Some(pos) = from.rfind('/') {
        from[pos + 1..].to_string()
    } else {
        from.split('@').next().unwrap_or(from).to_string()
    }
}

/// Parses a single `<message>` element into a classified `ChatMessage`.
/// Returns `None` for stanzas with no body, or whose `from` domain/type
/// doesn't match any known classification.
pub fn parse_chat_message(message_xml: &str, own_puuid: &str) -> Option<ChatMessage> {
    let from = extract_attr(message_xml, "from")?;
    let msg_type = extract_attr(message_xml, "type");
    let kind = classify_from_domain(&from, msg_type.as_deref())?;

    let body_raw = extract_element_text(message_xml, "body")?;
    if body_raw.trim().is_empty() {
        return None;
    }
    let content = unescape_xml(&body_raw);

    let id = sender_id(&from);
    let is_own = id == own_puuid;

    Some(ChatMessage {
        kind,
        sender_id: id,
        content,
        is_own,
        received_at: chrono::Utc::now(),
    })
}

/// Extracts and classifies every `<message>` element inside an `incoming`
/// event's verbatim XML. Non-message stanzas are discarded here but were
/// already retained upstream by XmppMITM/Bridge.
pub fn parse_chat_messages(incoming_xml: &str, own_puuid: &str) -> Vec<ChatMessage> {
    extract_message_elements(incoming_xml)
        .iter()
        .filter_map(|m| parse_chat_message(m, own_puuid))
        .collect()
}

/// Pure function deciding whether a classified message should be narrated
/// under the given config. No side effects, no I/O — safe to call from
/// tests without a running pipeline.
pub fn should_narrate(config: &ChatConfig, message: &ChatMessage) -> bool {
    if config.disabled {
        return false;
    }
    if config.ignored_player_ids.contains(&message.sender_id) {
        return false;
    }
    if message.is_own {
        return config.include_own_messages;
    }
    config.channel_enabled(message.kind)
}

#[derive(Deserialize)]
struct SessionPayload {
    #[serde(rename = "sessionLoopState")]
    session_loop_state: Option<String>,
    #[serde(rename = "partyId")]
    party_id: Option<String>,
    #[serde(rename = "pregameId")]
    pregame_id: Option<String>,
    #[serde(rename = "matchId")]
    match_id: Option<String>,
    #[serde(rename = "coreGameId")]
    core_game_id: Option<String>,
}

/// Decodes a base64 session payload into a `GameSessionSnapshot`, used by
/// both the self-presence and game-state-poll MUC-auto-join triggers. The
/// same payload shape shows up base64-encoded both as a presence attribute
/// on self-presence stanzas and under the `private` field of a
/// `/chat/v4/presences` entry.
pub fn decode_session_payload(base64_payload: &str) -> Option<GameSessionSnapshot> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(base64_payload.trim())
        .ok()?;
    let payload: SessionPayload = serde_json::from_slice(&bytes).ok()?;
    let loop_state = match payload.session_loop_state.as_deref() {
        Some("PREGAME") => LoopState::Pregame,
        Some("INGAME") => LoopState::InGame,
        _ => LoopState::Menus,
    };
    Some(GameSessionSnapshot {
        loop_state,
        party_id: payload.party_id,
        pregame_id: payload.pregame_id,
        core_game_id: payload.core_game_id.or(payload.match_id),
    })
}

/// Running narration counters. Not persisted across restarts — purely an
/// in-process tally for status/debug events.
#[derive(Debug, Default)]
pub struct NarrationStats {
    messages_narrated: AtomicU64,
    characters_narrated: AtomicU64,
}

impl NarrationStats {
    pub fn record(&self, message: &ChatMessage) {
        self.messages_narrated.fetch_add(1, Ordering::Relaxed);
        self.characters_narrated
            .fetch_add(message.content.len() as u64, Ordering::Relaxed);
    }

    pub fn messages_narrated(&self) -> u64 {
        self.messages_narrated.load(Ordering::Relaxed)
    }

    pub fn characters_narrated(&self) -> u64 {
        self.characters_narrated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const SELF_PUUID: &str = "52c82682-fb29-4da9-a5c0-474ab90d9aa5";

    // Scenario 1: party-chat narration.
    #[test]
    fn test_scenario_party_chat_narration() {
        let xml = "<message from='52c82682-fb29-4da9-a5c0-474ab90d9aa5@ares-parties.jp1.pvp.net/abcdef12' type='groupchat'><body>hello team</body></message>";
        let msg = parse_chat_message(xml, "someone-else").unwrap();
        assert_eq!(msg.kind, ChatKind::Party);
        assert_eq!(msg.sender_id, "abcdef12");
        assert_eq!(msg.content, "hello team");
        assert!(!msg.is_own);
        assert!(should_narrate(&ChatConfig::default(), &msg));
    }

    // Scenario 2: whisper with entity-decoding.
    #[test]
    fn test_scenario_whisper_entity_decoding() {
        let xml = "<message from='rival@ares-chat.jp1.pvp.net' type='chat'><body>gg &amp; wp</body></message>";
        let msg = parse_chat_message(xml, SELF_PUUID).unwrap();
        assert_eq!(msg.kind, ChatKind::Whisper);
        assert_eq!(msg.content, "gg & wp");
        assert!(should_narrate(&ChatConfig::default(), &msg));
    }

    // Scenario 3: own team message suppressed when include_own_messages=false.
    #[test]
    fn test_scenario_own_message_suppressed() {
        let xml = "<message from='P@ares-pregame.jp1.pvp.net/P'><body>I have the self puuid</body></message>";
        let msg = parse_chat_message(xml, "P").unwrap();
        assert!(msg.is_own);
        let mut config = ChatConfig::default();
        config.include_own_messages = false;
        assert!(!should_narrate(&config, &msg));
    }

    // Scenario 4: "all" classification via coregame id ending in "all".
    #[test]
    fn test_scenario_all_chat_classification() {
        let xml = "<message from='match123all@ares-coregame.jp1.pvp.net/x'><body>gg</body></message>";
        let msg = parse_chat_message(xml, "nobody").unwrap();
        assert_eq!(msg.kind, ChatKind::All);
    }

    #[test]
    fn test_coregame_exactly_xall_classifies_all_not_team() {
        let xml = "<message from='xall@ares-coregame.jp1.pvp.net/x'><body>hi</body></message>";
        let msg = parse_chat_message(xml, "nobody").unwrap();
        assert_eq!(msg.kind, ChatKind::All);
    }

    #[test]
    fn test_coregame_team_does_not_end_in_all() {
        let xml = "<message from='match123@ares-coregame.jp1.pvp.net/x'><body>hi</body></message>";
        let msg = parse_chat_message(xml, "nobody").unwrap();
        assert_eq!(msg.kind, ChatKind::Team);
    }

    // Scenario 5: ignore list.
    #[test]
    fn test_scenario_ignore_list() {
        let xml = "<message from='toxicPlayer@ares-parties.jp1.pvp.net/toxicPlayer'><body>gg ez</body></message>";
        let msg = parse_chat_message(xml, "nobody").unwrap();
        let mut config = ChatConfig::default();
        config.ignored_player_ids = HashSet::from(["toxicPlayer".to_string()]);
        assert!(!should_narrate(&config, &msg));
    }

    #[test]
    fn test_should_narrate_disabled_always_false() {
        let msg = ChatMessage {
            kind: ChatKind::Party,
            sender_id: "x".into(),
            content: "hi".into(),
            is_own: false,
            received_at: chrono::Utc::now(),
        };
        let mut config = ChatConfig::default();
        config.disabled = true;
        assert!(!should_narrate(&config, &msg));
    }

    #[test]
    fn test_empty_body_is_dropped() {
        let xml = "<message from='a@ares-parties.jp1.pvp.net/a'><body>   </body></message>";
        assert!(parse_chat_message(xml, "x").is_none());
    }

    #[test]
    fn test_unclassified_domain_is_dropped() {
        let xml = "<message from='a@muc.some-other-service.net/a' type='groupchat'><body>hi</body></message>";
        assert!(parse_chat_message(xml, "x").is_none());
    }

    #[test]
    fn test_parse_chat_messages_extracts_all_from_incoming_payload() {
        let xml = "<message from='a@ares-parties.jp1.pvp.net/a'><body>one</body></message><message from='b@ares-pregame.jp1.pvp.net/b'><body>two</body></message>";
        let messages = parse_chat_messages(xml, "nobody");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, ChatKind::Party);
        assert_eq!(messages[1].kind, ChatKind::Team);
    }

    #[test]
    fn test_decode_session_payload_ingame_prefers_core_game_id() {
        let payload = serde_json::json!({
            "sessionLoopState": "INGAME",
            "coreGameId": "match-1",
            "matchId": "ignored",
        });
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&payload).unwrap());
        let snapshot = decode_session_payload(&encoded).unwrap();
        assert_eq!(snapshot.loop_state, crate::model::LoopState::InGame);
        assert_eq!(snapshot.core_game_id, Some("match-1".to_string()));
    }

    #[test]
    fn test_decode_session_payload_falls_back_to_match_id() {
        let payload = serde_json::json!({ "sessionLoopState": "INGAME", "matchId": "match-2" });
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&payload).unwrap());
        let snapshot = decode_session_payload(&encoded).unwrap();
        assert_eq!(snapshot.core_game_id, Some("match-2".to_string()));
    }

    #[test]
    fn test_decode_session_payload_rejects_garbage() {
        assert!(decode_session_payload("not-base64!!!").is_none());
    }

    #[test]
    fn test_decode_session_payload_defaults_to_menus() {
        let payload = serde_json::json!({ "partyId": "party-1" });
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&payload).unwrap());
        let snapshot = decode_session_payload(&encoded).unwrap();
        assert_eq!(snapshot.loop_state, crate::model::LoopState::Menus);
        assert_eq!(snapshot.party_id, Some("party-1".to_string()));
    }

    #[test]
    fn test_narration_stats_accumulate() {
        let stats = NarrationStats::default();
        let msg = ChatMessage {
            kind: ChatKind::Team,
            sender_id: "x".into(),
            content: "hello".into(),
            is_own: false,
            received_at: chrono::Utc::now(),
        };
        stats.record(&msg);
        stats.record(&msg);
        assert_eq!(stats.messages_narrated(), 2);
        assert_eq!(stats.characters_narrated(), 10);
    }
}
