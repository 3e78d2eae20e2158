//! Capability interfaces between the orchestrator and its collaborators
//!
//! The orchestrator never touches cpal or HTTP directly; it drives these
//! contracts. The production drivers in [`crate::voice`] and
//! [`crate::llm`] implement them, and tests substitute scripted doubles.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::{ChatCompletionClient, CompletionRequest, CompletionStream};
use crate::voice::{
    AudioCapture, AudioClip, AudioPlayback, CaptureOutcome, PlaybackOutcome, Recognition,
    SpeechToText, TextToSpeech,
};
use crate::Result;

/// Owns the microphone for the duration of one recording call
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Record one utterance. `stop` ends it early keeping the buffer;
    /// `cancel` aborts and discards it. The device must be released
    /// before this returns, on every path.
    async fn record(
        &self,
        stop: CancellationToken,
        cancel: CancellationToken,
    ) -> Result<CaptureOutcome>;
}

/// Owns the speaker for the duration of one playback call
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Play a clip until it ends or `cancel` fires (bounded stop latency).
    /// The device must be released before this returns, on every path.
    async fn play(&self, clip: AudioClip, cancel: CancellationToken) -> Result<PlaybackOutcome>;
}

/// One-shot conversion of a finished capture into text
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn recognize(&self, clip: &AudioClip) -> Result<Recognition>;
}

/// Conversion of a response chunk into queued audio
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioClip>;
}

/// Streaming chat completion against an OpenAI-compatible endpoint
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Start a stream of deltas. After `cancel` fires, no further deltas
    /// are delivered, even if already in flight over the network.
    async fn stream_chat(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream>;
}

#[async_trait]
impl CaptureSource for AudioCapture {
    async fn record(
        &self,
        stop: CancellationToken,
        cancel: CancellationToken,
    ) -> Result<CaptureOutcome> {
        Self::record(self, stop, cancel).await
    }
}

#[async_trait]
impl PlaybackSink for AudioPlayback {
    async fn play(&self, clip: AudioClip, cancel: CancellationToken) -> Result<PlaybackOutcome> {
        Self::play(self, clip, cancel).await
    }
}

#[async_trait]
impl SpeechRecognizer for SpeechToText {
    async fn recognize(&self, clip: &AudioClip) -> Result<Recognition> {
        Self::recognize(self, clip).await
    }
}

#[async_trait]
impl SpeechSynthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<AudioClip> {
        Self::synthesize(self, text).await
    }
}

#[async_trait]
impl CompletionClient for ChatCompletionClient {
    async fn stream_chat(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream> {
        Self::stream_chat(self, request, cancel).await
    }
}
