//! Core data types shared across the proxy, router, and voice pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Credentials obtained from the local Riot client via the lockfile +
/// entitlements exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub access_token: String,
    pub entitlement_token: String,
    pub puuid: String,
    pub region: String,
}

/// Maps a PAS affinity (e.g. "na", "eu", "jp1") to the XMPP host and
/// domain used for that shard, as published in clientconfig.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AffinityBinding {
    pub affinity: String,
    pub xmpp_host: String,
    pub xmpp_domain: String,
}

/// Monotonically increasing id assigned to each client<->upstream pair
/// opened by XmppMITM.
pub type SocketId = u64;

/// The four MUC room kinds the router can classify a message into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatKind {
    Party,
    Team,
    All,
    Whisper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MucRoomKind {
    Party,
    Pregame,
    CoregameTeam,
    CoregameAll,
}

/// A MUC room the bridge has joined (or intends to join) this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MucRoom {
    pub jid: String,
    pub kind: MucRoomKind,
}

/// Loop state reported by the game client's self-presence payload / the
/// `/chat/v4/presences` poll, used to decide which room(s) to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Menus,
    Pregame,
    InGame,
}

/// A dedup-keyed snapshot of the player's current game session, sampled
/// from self-presence or the 5s poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSessionSnapshot {
    pub loop_state: LoopState,
    pub party_id: Option<String>,
    pub pregame_id: Option<String>,
    pub core_game_id: Option<String>,
}

impl GameSessionSnapshot {
    /// The dedup key used to decide whether a new snapshot requires new
    /// room joins: (loop_state, primary id for that state).
    pub fn dedup_key(&self) -> (String, Option<String>) {
        let state = match self.loop_state {
            LoopState::Menus => "menus",
            LoopState::Pregame => "pregame",
            LoopState::InGame => "ingame",
        }
        .to_string();
        let primary = match self.loop_state {
            LoopState::Menus => self.party_id.clone(),
            LoopState::Pregame => self.pregame_id.clone(),
            LoopState::InGame => self.core_game_id.clone(),
        };
        (state, primary)
    }
}

/// A raw byte fragment appended to a direction's reassembly buffer before
/// stanza-boundary extraction.
pub type RawStanzaFragment = Vec<u8>;

/// A complete top-level XML element extracted from a reassembly buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    pub xml: String,
}

/// A classified chat message ready for routing to the voice pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub kind: ChatKind,
    pub sender_id: String,
    pub content: String,
    pub is_own: bool,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

/// User-controlled narration settings. Published as an immutable value via
/// a `tokio::sync::watch` channel — readers always see a consistent
/// snapshot, never a partial update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_enabled_channels")]
    pub enabled_channels: HashSet<ChatKindConfig>,
    #[serde(default)]
    pub ignored_player_ids: HashSet<String>,
    #[serde(default = "default_true")]
    pub include_own_messages: bool,
    #[serde(default = "default_true")]
    pub whispers_enabled: bool,
    #[serde(default)]
    pub disabled: bool,
}

/// Serde-friendly mirror of `ChatKind` restricted to the channel kinds that
/// can be toggled (whisper is controlled by its own flag, not the set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatKindConfig {
    Party,
    Team,
    All,
}

fn default_enabled_channels() -> HashSet<ChatKindConfig> {
    [ChatKindConfig::Party, ChatKindConfig::Team]
        .into_iter()
        .collect()
}

fn default_true() -> bool {
    true
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled_channels: default_enabled_channels(),
            ignored_player_ids: HashSet::new(),
            include_own_messages: true,
            whispers_enabled: true,
            disabled: false,
        }
    }
}

impl ChatConfig {
    pub fn channel_enabled(&self, kind: ChatKind) -> bool {
        match kind {
            ChatKind::Party => self.enabled_channels.contains(&ChatKindConfig::Party),
            ChatKind::Team => self.enabled_channels.contains(&ChatKindConfig::Team),
            ChatKind::All => self.enabled_channels.contains(&ChatKindConfig::All),
            ChatKind::Whisper => self.whispers_enabled,
        }
    }
}

/// A single queued narration job. The voice pipeline processes at most one
/// of these at a time, in FIFO order.
#[derive(Debug, Clone)]
pub struct TtsJob {
    pub text: String,
    pub voice: String,
    pub rate: f32,
}
