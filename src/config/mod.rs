//! Configuration management for RPChat

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;

use crate::{Error, Result};

/// Environment variable that overrides the configured API key
pub const API_KEY_ENV: &str = "RPCHAT_API_KEY";

/// RPChat runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Completion endpoint configuration
    pub api: ApiConfig,

    /// Audio capture/playback tuning
    pub audio: AudioConfig,

    /// Speech recognition and synthesis configuration
    pub voice: VoiceConfig,

    /// Path to the conversation database
    pub database_path: PathBuf,
}

/// OpenAI-compatible completion endpoint configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://api.openai.com/v1` or a local server
    pub base_url: String,

    /// Bearer token; empty for unauthenticated local endpoints
    pub api_key: String,

    /// Model identifier, passed through opaquely
    pub model: String,

    /// Sampling temperature, passed through opaquely
    pub temperature: Option<f32>,

    /// Response token cap, passed through opaquely
    pub max_tokens: Option<u32>,

    /// Request timeout
    pub timeout: Duration,

    /// System prompt prepended to every completion request
    pub system_prompt: Option<String>,
}

/// Audio capture and playback tuning
///
/// The orchestrator treats every duration here as opaque; only the
/// capture endpointer interprets them.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// RMS energy above which a chunk counts as speech
    pub energy_threshold: f32,

    /// Trailing silence that ends an utterance
    pub silence_timeout: Duration,

    /// Give up when no speech starts within this window
    pub no_speech_timeout: Duration,

    /// Minimum speech length for a usable utterance
    pub min_speech: Duration,

    /// Hard cap on utterance length
    pub max_utterance: Duration,

    /// Reopen the microphone after assistant speech finishes naturally
    pub auto_resume: bool,
}

/// STT provider backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttProvider {
    Whisper,
    Deepgram,
}

/// TTS provider backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsProvider {
    OpenAi,
    ElevenLabs,
}

/// Speech recognition and synthesis configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// STT backend
    pub stt_provider: SttProvider,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    /// Recognition language hint (e.g. "en", "zh"); None lets the model decide
    pub language: Option<String>,

    /// TTS backend
    pub tts_provider: TtsProvider,

    /// TTS model (e.g. "tts-1", "eleven_monolingual_v1")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// TTS speed multiplier
    pub tts_speed: f32,

    /// Deepgram API key (only when `stt_provider` is Deepgram)
    pub deepgram_api_key: Option<String>,

    /// ElevenLabs API key (only when `tts_provider` is ElevenLabs)
    pub elevenlabs_api_key: Option<String>,

    /// Minimum characters per synthesized sentence chunk
    pub chunk_min_chars: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: String::new(),
                model: "gpt-4o-mini".to_string(),
                temperature: Some(0.7),
                max_tokens: Some(2000),
                timeout: Duration::from_secs(30),
                system_prompt: None,
            },
            audio: AudioConfig {
                energy_threshold: 0.03,
                silence_timeout: Duration::from_millis(800),
                no_speech_timeout: Duration::from_secs(5),
                min_speech: Duration::from_millis(300),
                max_utterance: Duration::from_secs(30),
                auto_resume: true,
            },
            voice: VoiceConfig {
                stt_provider: SttProvider::Whisper,
                stt_model: "whisper-1".to_string(),
                language: None,
                tts_provider: TtsProvider::OpenAi,
                tts_model: "tts-1".to_string(),
                tts_voice: "alloy".to_string(),
                tts_speed: 1.0,
                deepgram_api_key: None,
                elevenlabs_api_key: None,
                chunk_min_chars: 24,
            },
            database_path: default_data_dir().join("rpchat.db"),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location when
    /// `path` is None. A missing default file is created from the template
    /// on first run; a missing explicit path is an error.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let resolved = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(Error::Config(format!(
                        "config file not found: {}",
                        p.display()
                    )));
                }
                p.to_path_buf()
            }
            None => {
                let default = default_config_path();
                if !default.exists() {
                    file::write_template(&default)?;
                    tracing::info!(path = %default.display(), "created config template");
                }
                default
            }
        };

        let raw = std::fs::read_to_string(&resolved)?;
        let overlay: file::ConfigFile = toml::from_str(&raw)?;
        overlay.apply(&mut config);

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                config.api.api_key = key;
            }
        }

        tracing::debug!(
            path = %resolved.display(),
            base_url = %config.api.base_url,
            model = %config.api.model,
            "configuration loaded"
        );

        Ok(config)
    }
}

/// Platform config file location (`~/.config/rpchat/config.toml` on Linux)
#[must_use]
pub fn default_config_path() -> PathBuf {
    ProjectDirs::from("", "", "rpchat").map_or_else(
        || PathBuf::from("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Platform data directory for the database
#[must_use]
pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("", "", "rpchat").map_or_else(
        || PathBuf::from("data"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.api.base_url, "https://api.openai.com/v1");
        assert!(config.audio.auto_resume);
        assert!(config.audio.silence_timeout < config.audio.no_speech_timeout);
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/rpchat.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[api]
base_url = "http://localhost:8080/v1"
model = "local-model"

[audio]
auto_resume = false
silence_timeout_ms = 500
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.api.base_url, "http://localhost:8080/v1");
        assert_eq!(config.api.model, "local-model");
        assert!(!config.audio.auto_resume);
        assert_eq!(config.audio.silence_timeout, Duration::from_millis(500));
        // untouched fields keep defaults
        assert_eq!(config.voice.tts_voice, "alloy");
    }
}
