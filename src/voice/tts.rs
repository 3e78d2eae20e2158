//! Text-to-speech processing

use crate::config::{ApiConfig, TtsProvider, VoiceConfig};
use crate::{Error, Result};

use super::{decode_mp3, AudioClip};

/// Synthesizes speech from text chunks
#[derive(Debug, Clone)]
pub struct TextToSpeech {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
    speed: f32,
    provider: TtsProvider,
}

impl TextToSpeech {
    /// Create a TTS instance from the voice/api configuration
    ///
    /// # Errors
    ///
    /// Returns error if the selected provider's API key is missing
    pub fn from_config(voice: &VoiceConfig, api: &ApiConfig) -> Result<Self> {
        match voice.tts_provider {
            TtsProvider::OpenAi => Self::new_openai(
                &api.base_url,
                api.api_key.clone(),
                voice.tts_model.clone(),
                voice.tts_voice.clone(),
                voice.tts_speed,
            ),
            TtsProvider::ElevenLabs => {
                let key = voice.elevenlabs_api_key.clone().ok_or_else(|| {
                    Error::Config("ElevenLabs API key required for TTS".to_string())
                })?;
                Ok(Self::new_elevenlabs(
                    key,
                    voice.tts_model.clone(),
                    voice.tts_voice.clone(),
                ))
            }
        }
    }

    /// Create an OpenAI-compatible TTS instance
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing for a non-local endpoint
    pub fn new_openai(
        base_url: &str,
        api_key: String,
        model: String,
        voice: String,
        speed: f32,
    ) -> Result<Self> {
        if api_key.is_empty() && base_url.contains("api.openai.com") {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            voice,
            speed,
            provider: TtsProvider::OpenAi,
        })
    }

    /// Create an ElevenLabs TTS instance
    #[must_use]
    pub fn new_elevenlabs(api_key: String, model: String, voice_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.elevenlabs.io".to_string(),
            api_key,
            model,
            voice: voice_id,
            speed: 1.0,
            provider: TtsProvider::ElevenLabs,
        }
    }

    /// Synthesize a text chunk into a playable clip
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tts`] if synthesis or decoding fails
    pub async fn synthesize(&self, text: &str) -> Result<AudioClip> {
        if text.trim().is_empty() {
            return Ok(AudioClip::default());
        }

        let mp3 = match self.provider {
            TtsProvider::OpenAi => self.synthesize_openai(text).await?,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text).await?,
        };

        decode_mp3(&mp3).map_err(|e| Error::Tts(format!("decoding synthesized audio: {e}")))
    }

    async fn synthesize_openai(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
        };

        let url = format!("{}/audio/speech", self.base_url);
        let mut builder = self.client.post(&url).json(&request);
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Tts(format!("TTS request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("TTS error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Tts(e.to_string()))?;
        Ok(audio.to_vec())
    }

    async fn synthesize_elevenlabs(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("{}/v1/text-to-speech/{}", self.base_url, self.voice);
        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Tts(format!("ElevenLabs request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Tts(e.to_string()))?;
        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_text_yields_empty_clip() {
        let tts = TextToSpeech::new_openai(
            "http://localhost:9999/v1",
            String::new(),
            "tts-1".into(),
            "alloy".into(),
            1.0,
        )
        .unwrap();
        let clip = tts.synthesize("   ").await.unwrap();
        assert!(clip.is_empty());
    }

    #[test]
    fn test_openai_endpoint_requires_key() {
        let err = TextToSpeech::new_openai(
            "https://api.openai.com/v1",
            String::new(),
            "tts-1".into(),
            "alloy".into(),
            1.0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_elevenlabs_from_config_requires_key() {
        let config = crate::config::Config::default();
        let mut voice = config.voice.clone();
        voice.tts_provider = TtsProvider::ElevenLabs;
        voice.elevenlabs_api_key = None;

        let err = TextToSpeech::from_config(&voice, &config.api).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
