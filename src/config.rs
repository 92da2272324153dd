//! # Configuration Management
//!
//! Settings are layered from several sources, highest priority first:
//!
//! 1. Deployment overrides (`HOST`, `PORT`, `OPENAI_API_KEY`)
//! 2. Environment variables with the `APP_` prefix, `__` between sections
//!    (`APP_BRIDGE__QUEUE_CAPACITY=100`, `APP_UPSTREAM__VOICE=verse`)
//! 3. Configuration file (`config.toml`, optional)
//! 4. Default values (the `Default` impl below)
//!
//! ## Sections:
//! - **server**: where the HTTP/WebSocket listener binds
//! - **bridge**: session limits, queue sizes and timings
//! - **telephony**: media format assumed for callers, public host for TwiML
//! - **upstream**: speech endpoint URL, credentials and agent profile
//!
//! The bridge itself never reads this module. At upgrade time the handler
//! turns the current config into a [`SessionConfig`] and hands that over.

use crate::bridge::{AgentProfile, SessionConfig, UpstreamCredentials};
use crate::codec::{AudioEncoding, AudioFormat};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bridge: BridgeSettings,
    pub telephony: TelephonySettings,
    pub upstream: UpstreamSettings,
}

/// Listener settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: local development only
/// - `host = "0.0.0.0"`: behind a load balancer or in a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Session limits and timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Path the telephony provider opens its media WebSocket on.
    pub media_path: String,
    pub max_concurrent_sessions: usize,
    /// Frames buffered per direction before the oldest is dropped.
    pub queue_capacity: usize,
    pub connect_timeout_ms: u64,
    pub negotiation_timeout_ms: u64,
    /// How long a closing session waits for in-flight frames.
    pub grace_period_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Telephony sockets silent for longer than this are dropped.
    pub client_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonySettings {
    /// Assumed for media frames until a `start` event announces the format.
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    /// Host advertised in the TwiML stream URL. Empty means "use the
    /// request's Host header".
    pub public_host: String,
    /// Spoken to the caller before the stream connects. Empty skips it.
    pub greeting: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    pub url: String,
    /// Bearer token. Never returned by the config endpoint.
    pub api_key: String,
    pub voice: String,
    pub instructions: String,
    pub modalities: Vec<String>,
    pub input_encoding: AudioEncoding,
    pub output_encoding: AudioEncoding,
}

impl Default for AppConfig {
    fn default() -> Self {
        let agent = AgentProfile::default();
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            bridge: BridgeSettings {
                media_path: "/media-stream".to_string(),
                max_concurrent_sessions: 10,
                queue_capacity: 50,
                connect_timeout_ms: 10_000,
                negotiation_timeout_ms: 15_000,
                grace_period_ms: 2_000,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            telephony: TelephonySettings {
                encoding: AudioEncoding::Mulaw,
                sample_rate: 8000,
                public_host: String::new(),
                greeting: String::new(),
            },
            upstream: UpstreamSettings {
                url: "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview".to_string(),
                api_key: String::new(),
                voice: agent.voice,
                instructions: agent.instructions,
                modalities: agent.modalities,
                input_encoding: AudioEncoding::Mulaw,
                output_encoding: AudioEncoding::Mulaw,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_BRIDGE__MAX_CONCURRENT_SESSIONS=50`
    /// - `APP_UPSTREAM__URL=wss://speech.internal/v1/realtime`
    /// - `OPENAI_API_KEY=sk-...`: upstream bearer token
    /// - `HOST` / `PORT`: deployment platform conventions
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("upstream.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.bridge.media_path.starts_with('/') {
            return Err(anyhow::anyhow!("Media path must start with '/'"));
        }

        if self.bridge.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.bridge.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Queue capacity must be greater than 0"));
        }

        if self.bridge.connect_timeout_ms == 0
            || self.bridge.negotiation_timeout_ms == 0
            || self.bridge.grace_period_ms == 0
        {
            return Err(anyhow::anyhow!("Bridge timeouts must be greater than 0"));
        }

        if self.bridge.heartbeat_interval_secs == 0
            || self.bridge.client_timeout_secs <= self.bridge.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than a non-zero heartbeat interval"
            ));
        }

        if self.telephony.sample_rate == 0 {
            return Err(anyhow::anyhow!("Telephony sample rate must be greater than 0"));
        }

        if self.upstream.url.trim().is_empty() {
            return Err(anyhow::anyhow!("Upstream URL cannot be empty"));
        }

        if !self.upstream.url.starts_with("ws://") && !self.upstream.url.starts_with("wss://") {
            return Err(anyhow::anyhow!("Upstream URL must use ws:// or wss://"));
        }

        Ok(())
    }

    pub fn telephony_format(&self) -> AudioFormat {
        AudioFormat::new(self.telephony.encoding, self.telephony.sample_rate)
    }

    /// Upstream formats run at the telephony rate; the bridge does not resample.
    pub fn upstream_formats(&self) -> (AudioFormat, AudioFormat) {
        let rate = self.telephony.sample_rate;
        (
            AudioFormat::new(self.upstream.input_encoding, rate),
            AudioFormat::new(self.upstream.output_encoding, rate),
        )
    }

    /// Everything one session needs, resolved from the current settings.
    pub fn session_config(&self) -> SessionConfig {
        let (upstream_input, upstream_output) = self.upstream_formats();
        let credentials = UpstreamCredentials::new(&self.upstream.url, &self.upstream.api_key);

        let mut session = SessionConfig::new(credentials);
        session.agent = AgentProfile {
            instructions: self.upstream.instructions.clone(),
            voice: self.upstream.voice.clone(),
            modalities: self.upstream.modalities.clone(),
        };
        session.telephony_format = self.telephony_format();
        session.upstream_input = upstream_input;
        session.upstream_output = upstream_output;
        session.queue_capacity = self.bridge.queue_capacity;
        session.connect_timeout = Duration::from_millis(self.bridge.connect_timeout_ms);
        session.negotiation_timeout = Duration::from_millis(self.bridge.negotiation_timeout_ms);
        session.grace_period = Duration::from_millis(self.bridge.grace_period_ms);
        session
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.client_timeout_secs)
    }

    /// Apply a partial JSON update (used by `PUT /api/v1/config`).
    ///
    /// Only settings that new sessions read at upgrade time can change here;
    /// the listener address and the session limit are fixed at startup.
    /// For example `{"upstream": {"voice": "verse"}}` changes only the voice.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(bridge) = partial_config.get("bridge") {
            if let Some(capacity) = bridge.get("queue_capacity").and_then(|v| v.as_u64()) {
                self.bridge.queue_capacity = capacity as usize;
            }
            if let Some(ms) = bridge.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
                self.bridge.connect_timeout_ms = ms;
            }
            if let Some(ms) = bridge.get("negotiation_timeout_ms").and_then(|v| v.as_u64()) {
                self.bridge.negotiation_timeout_ms = ms;
            }
            if let Some(ms) = bridge.get("grace_period_ms").and_then(|v| v.as_u64()) {
                self.bridge.grace_period_ms = ms;
            }
        }

        if let Some(telephony) = partial_config.get("telephony") {
            if let Some(host) = telephony.get("public_host").and_then(|v| v.as_str()) {
                self.telephony.public_host = host.to_string();
            }
            if let Some(greeting) = telephony.get("greeting").and_then(|v| v.as_str()) {
                self.telephony.greeting = greeting.to_string();
            }
        }

        if let Some(upstream) = partial_config.get("upstream") {
            if let Some(voice) = upstream.get("voice").and_then(|v| v.as_str()) {
                self.upstream.voice = voice.to_string();
            }
            if let Some(instructions) = upstream.get("instructions").and_then(|v| v.as_str()) {
                self.upstream.instructions = instructions.to_string();
            }
            if let Some(modalities) = upstream.get("modalities").and_then(|v| v.as_array()) {
                self.upstream.modalities = modalities
                    .iter()
                    .filter_map(|m| m.as_str().map(str::to_string))
                    .collect();
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Config as JSON with the upstream token masked.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(upstream) = value.get_mut("upstream").and_then(|u| u.as_object_mut()) {
            let masked = if self.upstream.api_key.is_empty() { "" } else { "<redacted>" };
            upstream.insert("api_key".to_string(), serde_json::Value::from(masked));
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.bridge.media_path, "/media-stream");
        assert_eq!(config.telephony_format(), AudioFormat::telephony_mulaw());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.grace_period_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upstream.url = "https://speech.example".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.client_timeout_secs = config.bridge.heartbeat_interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"upstream": {"voice": "verse", "modalities": ["audio"]}, "bridge": {"grace_period_ms": 500}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.upstream.voice, "verse");
        assert_eq!(config.upstream.modalities, vec!["audio".to_string()]);
        assert_eq!(config.bridge.grace_period_ms, 500);
        assert_eq!(config.server.port, 8080);

        let invalid = r#"{"bridge": {"queue_capacity": 0}}"#;
        assert!(config.update_from_json(invalid).is_err());
    }

    #[test]
    fn test_session_config_follows_settings() {
        let mut config = AppConfig::default();
        config.upstream.api_key = "sk-test".to_string();
        config.upstream.output_encoding = AudioEncoding::Pcm16;
        config.bridge.queue_capacity = 7;

        let session = config.session_config();
        assert_eq!(session.credentials.token, "sk-test");
        assert_eq!(session.queue_capacity, 7);
        assert_eq!(session.upstream_output, AudioFormat::new(AudioEncoding::Pcm16, 8000));
        assert_eq!(session.upstream_input, AudioFormat::telephony_mulaw());
        assert_eq!(session.grace_period, Duration::from_secs(2));
        assert_eq!(session.agent.voice, config.upstream.voice);
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let mut config = AppConfig::default();
        config.upstream.api_key = "sk-secret".to_string();
        let value = config.redacted();
        assert_eq!(value["upstream"]["api_key"], "<redacted>");
        assert!(!value.to_string().contains("sk-secret"));
    }

    #[test]
    fn test_defaults_survive_config_layering() {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .build()
            .unwrap();
        let config: AppConfig = settings.try_deserialize().unwrap();
        assert_eq!(config.telephony.encoding, AudioEncoding::Mulaw);
        assert_eq!(config.bridge.queue_capacity, 50);
    }
}
