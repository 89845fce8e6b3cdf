//! Session and device configuration.

use crate::audio::{AudioFormat, SampleFormat};
use crate::error::{Result, SessionError};
use std::time::Duration;
use url::Url;

/// Default endpoint of the bidirectional generate-content service.
pub const DEFAULT_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are a helpful voice assistant. Keep your answers short and conversational.";

/// Everything a session needs to reach the service
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// WebSocket endpoint without the key parameter
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub system_instruction: String,
    /// Prebuilt voice for synthesized speech; the service picks one if unset
    pub voice_name: Option<String>,
    /// JPEG quality for video frames, 1-100
    pub image_quality: u8,
    /// Format of outbound microphone chunks
    pub capture_format: AudioFormat,
    /// Format of audio synthesized by the service
    pub remote_format: AudioFormat,
    pub connect_timeout: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            voice_name: None,
            image_quality: 75,
            capture_format: AudioFormat::capture_target(),
            remote_format: AudioFormat::remote(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl LiveConfig {
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            api_key: Some(api_key.to_string()),
            ..Self::default()
        }
    }

    /// Defaults overridden by `GEMINI_API_KEY` and the `LIVEVOICE_*`
    /// variables. Unset or empty variables keep the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.api_key = env_var("GEMINI_API_KEY");
        if let Some(url) = env_var("LIVEVOICE_URL") {
            config.url = url;
        }
        if let Some(model) = env_var("LIVEVOICE_MODEL") {
            config.model = model;
        }
        if let Some(instruction) = env_var("LIVEVOICE_SYSTEM_INSTRUCTION") {
            config.system_instruction = instruction;
        }
        config.voice_name = env_var("LIVEVOICE_VOICE");
        config
    }

    /// The URL to dial, with the key appended. Fails without touching the
    /// network when the key is missing or the URL is not a WebSocket URL.
    pub fn endpoint(&self) -> Result<String> {
        let key = match self.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key,
            _ => return Err(SessionError::MissingCredentials),
        };

        let url = self.url.trim();
        let rest = url
            .strip_prefix("wss://")
            .or_else(|| url.strip_prefix("ws://"))
            .ok_or_else(|| SessionError::InvalidEndpoint(url.to_string()))?;
        if rest.is_empty() || rest.starts_with('/') {
            return Err(SessionError::InvalidEndpoint(url.to_string()));
        }

        let mut endpoint = Url::parse(url).map_err(|e| SessionError::InvalidEndpoint(format!("{}: {}", url, e)))?;
        // append_pair percent-encodes, so `&`, `#` or spaces in the key stay inside the value
        endpoint.query_pairs_mut().append_pair("key", key);
        Ok(endpoint.into())
    }
}

/// Local audio device settings
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Client name shown by the sound server
    pub app_name: String,
    /// Record device; the server default when unset
    pub capture_device: Option<String>,
    /// Playback device; the server default when unset
    pub playback_device: Option<String>,
    pub capture_native: AudioFormat,
    pub playback: AudioFormat,
    /// Size of each device read and write
    pub block_duration: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "livevoice".to_string(),
            capture_device: None,
            playback_device: None,
            capture_native: AudioFormat::new(48_000, 2, SampleFormat::F32),
            playback: AudioFormat::new(48_000, 2, SampleFormat::F32),
            block_duration: Duration::from_millis(20),
        }
    }
}

impl DeviceConfig {
    /// Defaults with `LIVEVOICE_CAPTURE_DEVICE` and
    /// `LIVEVOICE_PLAYBACK_DEVICE` applied.
    pub fn from_env() -> Self {
        Self {
            capture_device: env_var("LIVEVOICE_CAPTURE_DEVICE"),
            playback_device: env_var("LIVEVOICE_PLAYBACK_DEVICE"),
            ..Self::default()
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_requires_key() {
        let config = LiveConfig::default();
        assert!(matches!(config.endpoint(), Err(SessionError::MissingCredentials)));

        let config = LiveConfig {
            api_key: Some("  ".to_string()),
            ..LiveConfig::default()
        };
        assert!(matches!(config.endpoint(), Err(SessionError::MissingCredentials)));
    }

    #[test]
    fn test_endpoint_appends_key() {
        let config = LiveConfig::from_api_key("abc123");
        assert_eq!(config.endpoint().unwrap(), format!("{}?key=abc123", DEFAULT_URL));

        let config = LiveConfig {
            url: "ws://localhost:9000/live?alt=json".to_string(),
            ..LiveConfig::from_api_key("k")
        };
        assert_eq!(config.endpoint().unwrap(), "ws://localhost:9000/live?alt=json&key=k");
    }

    #[test]
    fn test_endpoint_encodes_key() {
        let config = LiveConfig {
            url: "ws://localhost:9000/live".to_string(),
            ..LiveConfig::from_api_key("a&b=c#d?e f")
        };
        let endpoint = config.endpoint().unwrap();
        assert_eq!(endpoint, "ws://localhost:9000/live?key=a%26b%3Dc%23d%3Fe+f");

        let parsed = Url::parse(&endpoint).unwrap();
        let keys: Vec<_> = parsed.query_pairs().collect();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].1, "a&b=c#d?e f");
    }

    #[test]
    fn test_endpoint_rejects_non_websocket_urls() {
        for url in ["https://example.com/live", "", "wss://", "wss:///path"] {
            let config = LiveConfig {
                url: url.to_string(),
                ..LiveConfig::from_api_key("k")
            };
            assert!(
                matches!(config.endpoint(), Err(SessionError::InvalidEndpoint(_))),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn test_defaults() {
        let config = LiveConfig::default();
        assert_eq!(config.capture_format, AudioFormat::capture_target());
        assert_eq!(config.remote_format, AudioFormat::remote());
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.image_quality, 75);
        assert!(config.voice_name.is_none());

        let devices = DeviceConfig::default();
        assert_eq!(devices.block_duration, Duration::from_millis(20));
        assert!(devices.capture_device.is_none());
    }
}
