//! TOML configuration file loading
//!
//! All fields are optional; the file is a partial overlay on top of
//! built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::Result;

use super::{Config, SttProvider, TtsProvider};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Completion endpoint settings
    #[serde(default)]
    pub api: ApiFileConfig,

    /// Audio capture/playback tuning
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Speech recognition and synthesis settings
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageFileConfig,
}

/// Completion endpoint settings
#[derive(Debug, Default, Deserialize)]
pub struct ApiFileConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub system_prompt: Option<String>,
}

/// Audio tuning
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub energy_threshold: Option<f32>,
    pub silence_timeout_ms: Option<u64>,
    pub no_speech_timeout_ms: Option<u64>,
    pub min_speech_ms: Option<u64>,
    pub max_utterance_secs: Option<u64>,
    pub auto_resume: Option<bool>,
}

/// Speech settings
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// "whisper" or "deepgram"
    pub stt_provider: Option<String>,
    pub stt_model: Option<String>,
    pub language: Option<String>,
    /// "openai" or "elevenlabs"
    pub tts_provider: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub tts_speed: Option<f32>,
    pub deepgram_api_key: Option<String>,
    pub elevenlabs_api_key: Option<String>,
    pub chunk_min_chars: Option<usize>,
}

/// Storage settings
#[derive(Debug, Default, Deserialize)]
pub struct StorageFileConfig {
    pub database_path: Option<PathBuf>,
}

impl ConfigFile {
    /// Overlay this file's values onto `config`
    pub fn apply(self, config: &mut Config) {
        let Self {
            api,
            audio,
            voice,
            storage,
        } = self;

        if let Some(v) = api.base_url {
            config.api.base_url = v;
        }
        if let Some(v) = api.api_key {
            config.api.api_key = v;
        }
        if let Some(v) = api.model {
            config.api.model = v;
        }
        if let Some(v) = api.temperature {
            config.api.temperature = Some(v);
        }
        if let Some(v) = api.max_tokens {
            config.api.max_tokens = Some(v);
        }
        if let Some(v) = api.timeout_secs {
            config.api.timeout = Duration::from_secs(v);
        }
        if let Some(v) = api.system_prompt {
            config.api.system_prompt = Some(v);
        }

        if let Some(v) = audio.energy_threshold {
            config.audio.energy_threshold = v;
        }
        if let Some(v) = audio.silence_timeout_ms {
            config.audio.silence_timeout = Duration::from_millis(v);
        }
        if let Some(v) = audio.no_speech_timeout_ms {
            config.audio.no_speech_timeout = Duration::from_millis(v);
        }
        if let Some(v) = audio.min_speech_ms {
            config.audio.min_speech = Duration::from_millis(v);
        }
        if let Some(v) = audio.max_utterance_secs {
            config.audio.max_utterance = Duration::from_secs(v);
        }
        if let Some(v) = audio.auto_resume {
            config.audio.auto_resume = v;
        }

        if let Some(v) = voice.stt_provider {
            match v.as_str() {
                "deepgram" => config.voice.stt_provider = SttProvider::Deepgram,
                "whisper" => config.voice.stt_provider = SttProvider::Whisper,
                other => tracing::warn!(provider = other, "unknown stt_provider, keeping default"),
            }
        }
        if let Some(v) = voice.stt_model {
            config.voice.stt_model = v;
        }
        if let Some(v) = voice.language {
            config.voice.language = Some(v);
        }
        if let Some(v) = voice.tts_provider {
            match v.as_str() {
                "elevenlabs" => config.voice.tts_provider = TtsProvider::ElevenLabs,
                "openai" => config.voice.tts_provider = TtsProvider::OpenAi,
                other => tracing::warn!(provider = other, "unknown tts_provider, keeping default"),
            }
        }
        if let Some(v) = voice.tts_model {
            config.voice.tts_model = v;
        }
        if let Some(v) = voice.tts_voice {
            config.voice.tts_voice = v;
        }
        if let Some(v) = voice.tts_speed {
            config.voice.tts_speed = v;
        }
        if let Some(v) = voice.deepgram_api_key {
            config.voice.deepgram_api_key = Some(v);
        }
        if let Some(v) = voice.elevenlabs_api_key {
            config.voice.elevenlabs_api_key = Some(v);
        }
        if let Some(v) = voice.chunk_min_chars {
            config.voice.chunk_min_chars = v;
        }

        if let Some(v) = storage.database_path {
            config.database_path = v;
        }
    }
}

/// Commented starter config written on first run
const TEMPLATE: &str = r#"# RPChat configuration
# Every setting is optional; missing values fall back to built-in defaults.

[api]
# base_url = "https://api.openai.com/v1"
# api_key = ""            # or set RPCHAT_API_KEY
# model = "gpt-4o-mini"
# temperature = 0.7
# max_tokens = 2000
# timeout_secs = 30
# system_prompt = "You are a helpful voice assistant. Keep responses short."

[audio]
# energy_threshold = 0.03
# silence_timeout_ms = 800
# no_speech_timeout_ms = 5000
# min_speech_ms = 300
# max_utterance_secs = 30
# auto_resume = true

[voice]
# stt_provider = "whisper"     # or "deepgram"
# stt_model = "whisper-1"
# language = "en"
# tts_provider = "openai"      # or "elevenlabs"
# tts_model = "tts-1"
# tts_voice = "alloy"
# tts_speed = 1.0

[storage]
# database_path = "/path/to/rpchat.db"
"#;

/// Write the starter template to `path`, creating parent directories
///
/// # Errors
///
/// Returns error if the file cannot be written
pub fn write_template(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, TEMPLATE)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_changes_nothing() {
        let overlay: ConfigFile = toml::from_str("").unwrap();
        let mut config = Config::default();
        let before = format!("{config:?}");
        overlay.apply(&mut config);
        assert_eq!(before, format!("{config:?}"));
    }

    #[test]
    fn test_template_parses() {
        let overlay: ConfigFile = toml::from_str(TEMPLATE).unwrap();
        let mut config = Config::default();
        overlay.apply(&mut config);
    }

    #[test]
    fn test_provider_selection() {
        let overlay: ConfigFile = toml::from_str(
            r#"
[voice]
stt_provider = "deepgram"
tts_provider = "elevenlabs"
"#,
        )
        .unwrap();
        let mut config = Config::default();
        overlay.apply(&mut config);
        assert_eq!(config.voice.stt_provider, SttProvider::Deepgram);
        assert_eq!(config.voice.tts_provider, TtsProvider::ElevenLabs);
    }

    #[test]
    fn test_unknown_provider_keeps_default() {
        let overlay: ConfigFile = toml::from_str("[voice]\nstt_provider = \"bogus\"\n").unwrap();
        let mut config = Config::default();
        overlay.apply(&mut config);
        assert_eq!(config.voice.stt_provider, SttProvider::Whisper);
    }
}
