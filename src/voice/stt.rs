//! Speech-to-text processing

use crate::config::{ApiConfig, SttProvider, VoiceConfig};
use crate::{Error, Result};

use super::{samples_to_wav, AudioClip};

/// Clips shorter than this are treated as no-speech without a network call
const MIN_CLIP_SECS: f32 = 0.2;

/// Response from the Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from the Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Outcome of one recognition call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recognition {
    /// Recognized non-empty text
    Text(String),
    /// The audio contained no usable speech
    NoSpeech,
}

/// Transcribes one finished capture into text
#[derive(Debug, Clone)]
pub struct SpeechToText {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    language: Option<String>,
    provider: SttProvider,
}

impl SpeechToText {
    /// Create an STT instance from the voice/api configuration
    ///
    /// # Errors
    ///
    /// Returns error if the selected provider's API key is missing
    pub fn from_config(voice: &VoiceConfig, api: &ApiConfig) -> Result<Self> {
        match voice.stt_provider {
            SttProvider::Whisper => Self::new_whisper(
                &api.base_url,
                api.api_key.clone(),
                voice.stt_model.clone(),
                voice.language.clone(),
            ),
            SttProvider::Deepgram => {
                let key = voice.deepgram_api_key.clone().ok_or_else(|| {
                    Error::Config("Deepgram API key required for Deepgram STT".to_string())
                })?;
                Ok(Self::new_deepgram(key, voice.stt_model.clone(), voice.language.clone()))
            }
        }
    }

    /// Create a Whisper-backed STT instance against an OpenAI-compatible base URL
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing for a non-local endpoint
    pub fn new_whisper(
        base_url: &str,
        api_key: String,
        model: String,
        language: Option<String>,
    ) -> Result<Self> {
        if api_key.is_empty() && base_url.contains("api.openai.com") {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            language,
            provider: SttProvider::Whisper,
        })
    }

    /// Create a Deepgram-backed STT instance
    #[must_use]
    pub fn new_deepgram(api_key: String, model: String, language: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.deepgram.com".to_string(),
            api_key,
            model,
            language,
            provider: SttProvider::Deepgram,
        }
    }

    /// Recognize one finished capture.
    ///
    /// Empty or near-empty clips short-circuit to
    /// [`Recognition::NoSpeech`]; so does an empty transcript.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stt`] if transcription fails
    pub async fn recognize(&self, clip: &AudioClip) -> Result<Recognition> {
        if clip.is_empty() || clip.duration_secs() < MIN_CLIP_SECS {
            return Ok(Recognition::NoSpeech);
        }

        let wav = samples_to_wav(&clip.samples, clip.sample_rate)?;
        let transcript = match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(wav).await?,
            SttProvider::Deepgram => self.transcribe_deepgram(wav).await?,
        };

        let transcript = transcript.trim();
        if transcript.is_empty() {
            Ok(Recognition::NoSpeech)
        } else {
            Ok(Recognition::Text(transcript.to_string()))
        }
    }

    async fn transcribe_whisper(&self, wav: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting Whisper transcription");

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let url = format!("{}/audio/transcriptions", self.base_url);
        let mut request = self.client.post(&url).multipart(form);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Stt(format!("Whisper request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response
            .json()
            .await
            .map_err(|e| Error::Stt(format!("malformed Whisper response: {e}")))?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }

    async fn transcribe_deepgram(&self, wav: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting Deepgram transcription");

        let mut url = format!(
            "{}/v1/listen?model={}&punctuate=true",
            self.base_url, self.model
        );
        if let Some(language) = &self.language {
            url.push_str("&language=");
            url.push_str(language);
        }

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .await
            .map_err(|e| Error::Stt(format!("Deepgram request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response
            .json()
            .await
            .map_err(|e| Error::Stt(format!("malformed Deepgram response: {e}")))?;

        let transcript = result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default();

        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}
