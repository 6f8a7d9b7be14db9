//! Configuration loading.
//!
//! Defaults are built in; `config.toml` in the platform config directory
//! (or an explicit `--config` path) overrides them, and `GEMINI_API_KEY` /
//! `API_KEY` override the stored credential.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{VoiceError, VoiceResult};
use crate::i18n::{Language, AVAILABLE_VOICES, DEFAULT_VOICE};

// ── Constants ──────────────────────────────────────────────────────

/// Environment variables consulted for the API key, in priority order.
pub const API_KEY_ENV_VARS: &[&str] = &["GEMINI_API_KEY", "API_KEY"];

pub const DEFAULT_CHAT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_LIVE_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const CONFIG_FILE_NAME: &str = "config.toml";

// ── Config sections ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gemini: GeminiConfig,
    pub voice: VoiceSettings,
    pub profile: ProfileDefaults,
    pub logging: LoggingConfig,
}

/// Remote model endpoints and credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub chat_model: String,
    pub live_model: String,
    pub base_url: String,
    pub live_url: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            live_model: DEFAULT_LIVE_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            live_url: DEFAULT_LIVE_URL.to_string(),
        }
    }
}

/// Audio pipeline parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Rate of PCM sent upstream.
    pub input_sample_rate: u32,
    /// Rate of PCM returned by the live model.
    pub output_sample_rate: u32,
    /// Samples per capture block.
    pub block_size: usize,
    /// Upper bound on device acquisition and session open. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_timeout_secs: Option<u64>,
    /// Request input/output transcripts from the live model.
    pub transcribe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            block_size: 4096,
            open_timeout_secs: Some(15),
            transcribe: true,
            input_device: None,
            output_device: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileDefaults {
    pub username: String,
    pub voice: String,
    pub language: String,
    pub is_pro_member: bool,
}

impl Default for ProfileDefaults {
    fn default() -> Self {
        Self {
            username: "Tony Stark".to_string(),
            voice: DEFAULT_VOICE.to_string(),
            language: Language::En.code().to_string(),
            is_pro_member: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "jarvis=info".to_string(),
        }
    }
}

// ── Loading ────────────────────────────────────────────────────────

impl Config {
    /// Default location: `<config dir>/jarvis/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "jarvis").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load from `path` (or the default location), apply env overrides, validate.
    ///
    /// A missing file at the default location yields defaults; a missing
    /// explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// First non-empty key among the recognised environment variables wins.
    pub fn apply_env_overrides(&mut self) {
        if let Some(key) = API_KEY_ENV_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|v| !v.trim().is_empty())
        {
            self.gemini.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let voice = &self.voice;
        if voice.input_sample_rate == 0 || voice.output_sample_rate == 0 {
            bail!("Sample rates must be greater than 0");
        }
        if voice.block_size == 0 {
            bail!("voice.block_size must be greater than 0");
        }
        if voice.open_timeout_secs == Some(0) {
            bail!("voice.open_timeout_secs must be greater than 0 (omit it to wait indefinitely)");
        }
        if !AVAILABLE_VOICES.contains(&self.profile.voice.as_str()) {
            bail!(
                "Unknown voice '{}'. Supported: {}",
                self.profile.voice,
                AVAILABLE_VOICES.join(", ")
            );
        }
        self.profile
            .language
            .parse::<Language>()
            .map_err(anyhow::Error::msg)?;
        Ok(())
    }

    /// The API key, or [`VoiceError::UnsetCredential`].
    pub fn api_key(&self) -> VoiceResult<&str> {
        self.gemini
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(VoiceError::UnsetCredential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.voice.block_size, 4096);
        assert_eq!(config.voice.input_sample_rate, 16_000);
        assert_eq!(config.voice.output_sample_rate, 24_000);
        assert_eq!(config.profile.username, "Tony Stark");
        assert_eq!(config.gemini.chat_model, DEFAULT_CHAT_MODEL);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [voice]
            block_size = 2048

            [profile]
            voice = "Kore"
            "#,
        )
        .unwrap();
        assert_eq!(config.voice.block_size, 2048);
        assert_eq!(config.voice.output_sample_rate, 24_000);
        assert_eq!(config.profile.voice, "Kore");
        assert_eq!(config.profile.language, "en");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.voice.block_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.profile.voice = "Aoede".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.profile.language = "de".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_key_is_unset_credential() {
        let config = Config::default();
        assert!(matches!(config.api_key(), Err(VoiceError::UnsetCredential)));

        let mut config = Config::default();
        config.gemini.api_key = Some("   ".into());
        assert!(matches!(config.api_key(), Err(VoiceError::UnsetCredential)));
    }

    #[test]
    fn load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[gemini]\napi_key = \"file-key\"\nchat_model = \"gemini-test\"\n"
        )
        .unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.gemini.chat_model, "gemini-test");
        assert_eq!(config.api_key().unwrap(), "file-key");
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn env_key_overrides_file() {
        std::env::set_var("GEMINI_API_KEY", "env-key");
        scopeguard::defer! {
            std::env::remove_var("GEMINI_API_KEY");
        }
        let mut config = Config::from_toml("[gemini]\napi_key = \"file-key\"\n").unwrap();
        config.apply_env_overrides();
        assert_eq!(config.api_key().unwrap(), "env-key");
    }

    #[test]
    fn toml_round_trip_omits_secret_when_unset() {
        let text = Config::default().to_toml().unwrap();
        assert!(!text.contains("api_key"));
        assert!(text.contains("block_size = 4096"));
    }
}
