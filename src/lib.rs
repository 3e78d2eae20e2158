//! RPChat - local voice and text conversation front end
//!
//! Bridges a microphone/speaker pair and a streaming OpenAI-compatible
//! completion endpoint, persisting multi-turn dialogue locally:
//! - Conversation orchestrator (capture → STT → completion → TTS → playback)
//! - Barge-in: interrupt assistant speech and return to listening
//! - Append-only, ordinal-ordered conversation log in SQLite
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │              UI layer (CLI, external)                 │
//! │   commands: voice/text turn, interrupt, cancel        │
//! │   events:   ordered status stream                     │
//! └───────────────────────┬──────────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────────┐
//! │            ConversationOrchestrator                   │
//! │  Idle → Listening → Recognizing → AwaitingCompletion  │
//! │       → Speaking → (Cancelling) → Idle/Listening      │
//! └──┬──────────┬──────────┬──────────┬──────────┬───────┘
//!    │          │          │          │          │
//! ┌──▼───┐  ┌───▼───┐  ┌───▼───┐  ┌───▼───┐  ┌───▼────┐
//! │ mic  │  │  STT  │  │  LLM  │  │  TTS  │  │ store  │
//! │(cpal)│  │(HTTP) │  │ (SSE) │  │(HTTP) │  │(SQLite)│
//! └──────┘  └───────┘  └───────┘  └───────┘  └────────┘
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod llm;
pub mod orchestrator;
pub mod store;
pub mod text;
pub mod voice;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use events::{EventBus, StatusEvent};
pub use llm::{ChatCompletionClient, ChatMessage, CompletionRequest, CompletionStream, StreamItem};
pub use orchestrator::{
    Capabilities, CaptureSource, CompletionClient, ConversationOrchestrator, OrchestratorConfig,
    PlaybackSink, SpeechRecognizer, SpeechSynthesizer, TurnState,
};
pub use store::{
    ConversationRepo, DbPool, Message, MessageRole, MessageStatus, Session,
    DEFAULT_SESSION_TITLE,
};
pub use voice::{
    AudioCapture, AudioClip, AudioPlayback, CaptureOutcome, PlaybackOutcome, Recognition,
    SpeechToText, TextToSpeech,
};
