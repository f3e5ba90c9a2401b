use serde::Deserialize;
use std::path::PathBuf;

use crate::model::ChatConfig;

/// Top-level configuration, loaded from TOML with `${VAR}` environment
/// substitution (matches Riot's own convention of keeping secrets out of
/// the config file on disk).
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    #[serde(default = "default_config_port")]
    pub config_mitm_port: u16,
    #[serde(default = "default_xmpp_port")]
    pub xmpp_mitm_port: u16,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_lockfile_path")]
    pub lockfile_path: PathBuf,
    /// Which ingest path to run: the TLS MITM or the authenticating bridge.
    #[serde(default)]
    pub mode: ProxyMode,
    /// Path to the Riot client binary. When set, the supervisor launches it
    /// with `--client-config-url` pointed at ConfigMITM once the startup-
    /// validation window passes cleanly; left unset in bridge mode and in
    /// test/dev environments where the client is started independently.
    #[serde(default)]
    pub riot_client_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    #[default]
    Mitm,
    Bridge,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            config_mitm_port: default_config_port(),
            xmpp_mitm_port: default_xmpp_port(),
            bind_addr: default_bind_addr(),
            lockfile_path: default_lockfile_path(),
            mode: ProxyMode::default(),
            riot_client_path: None,
        }
    }
}

fn default_config_port() -> u16 {
    35479
}

fn default_xmpp_port() -> u16 {
    35478
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_lockfile_path() -> PathBuf {
    PathBuf::from("lockfile")
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    #[serde(default = "default_voice_name")]
    pub voice: String,
    #[serde(default = "default_rate")]
    pub rate: f32,
    #[serde(default)]
    pub ptt_enabled: bool,
    #[serde(default = "default_ptt_key")]
    pub ptt_key: String,
    #[serde(default = "default_audio_device")]
    pub audio_device_substring: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice: default_voice_name(),
            rate: default_rate(),
            ptt_enabled: false,
            ptt_key: default_ptt_key(),
            audio_device_substring: default_audio_device(),
        }
    }
}

fn default_voice_name() -> String {
    "default".to_string()
}

fn default_rate() -> f32 {
    1.0
}

fn default_ptt_key() -> String {
    "v".to_string()
}

fn default_audio_device() -> String {
    "CABLE".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default = "default_clientconfig_url")]
    pub clientconfig_base: String,
    #[serde(default = "default_pas_url")]
    pub pas_base: String,
    #[serde(default = "default_entitlements_url")]
    pub entitlements_base: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            clientconfig_base: default_clientconfig_url(),
            pas_base: default_pas_url(),
            entitlements_base: default_entitlements_url(),
        }
    }
}

fn default_clientconfig_url() -> String {
    "https://clientconfig.rpg.riotgames.com".to_string()
}

fn default_pas_url() -> String {
    "https://riot-geo.pas.si.riotgames.com".to_string()
}

fn default_entitlements_url() -> String {
    "https://entitlements.auth.riotgames.com".to_string()
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults_from_empty_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.proxy.config_mitm_port, 35479);
        assert_eq!(config.proxy.xmpp_mitm_port, 35478);
        assert_eq!(config.proxy.bind_addr, "127.0.0.1");
        assert_eq!(config.proxy.mode, ProxyMode::Mitm);
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("CHATPROXY_TEST_KEY", "secret123");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[voice]\nvoice = \"${CHATPROXY_TEST_KEY}\"\n",
        )
        .unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.voice.voice, "secret123");
    }

    #[test]
    fn test_explicit_mode_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[proxy]\nmode = \"bridge\"\n").unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.proxy.mode, ProxyMode::Bridge);
    }
}
