//! Voice conversation orchestrator
//!
//! The state machine that coordinates speech capture, recognition,
//! streaming completion retrieval, synthesis playback and user
//! interruption for one session at a time, while keeping the ordered
//! conversation log consistent.
//!
//! One control flow runs per active session as a spawned task; commands
//! arriving from the UI layer (`interrupt`, `cancel`, `stop_listening`)
//! only touch the turn's cancellation tokens, and every suspension point
//! of the turn observes them. The microphone and speaker are exclusive
//! singletons: the transition table guarantees the two are never open at
//! the same time, and an interrupt always drains through [`TurnState::Cancelling`]
//! so devices are released before any new acquisition.

pub mod traits;
mod turn;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::{EventBus, StatusEvent};
use crate::store::ConversationRepo;
use crate::{Error, Result};

pub use traits::{
    CaptureSource, CompletionClient, PlaybackSink, SpeechRecognizer, SpeechSynthesizer,
};

/// Orchestrator state for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// No turn in flight
    Idle,
    /// Microphone open, buffering an utterance
    Listening,
    /// Capture closed, recognizer working
    Recognizing,
    /// Completion stream in flight
    AwaitingCompletion,
    /// Remaining synthesized audio playing back
    Speaking,
    /// Interrupt or cancel received; releasing devices
    Cancelling,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Recognizing => "recognizing",
            Self::AwaitingCompletion => "awaiting_completion",
            Self::Speaking => "speaking",
            Self::Cancelling => "cancelling",
        };
        f.write_str(s)
    }
}

/// Why the active turn was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnSignal {
    /// Barge-in; in voice mode the session returns to listening
    Interrupt,
    /// Plain cancellation; the session returns to idle
    Cancel,
}

/// What starts a session's control flow
#[derive(Debug, Clone)]
pub(crate) enum TurnRequest {
    Voice,
    Text(String),
}

/// State shared between a running turn task and the command surface
#[derive(Debug)]
pub(crate) struct TurnShared {
    state: Mutex<TurnState>,
    signal: Mutex<Option<TurnSignal>>,
    tokens: Mutex<TurnTokens>,
}

#[derive(Debug)]
struct TurnTokens {
    cancel: CancellationToken,
    stop: CancellationToken,
}

impl TurnShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(TurnState::Idle),
            signal: Mutex::new(None),
            tokens: Mutex::new(TurnTokens {
                cancel: CancellationToken::new(),
                stop: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn state(&self) -> TurnState {
        *self.state.lock().expect("turn state lock")
    }

    pub(crate) fn set_state(&self, state: TurnState) {
        *self.state.lock().expect("turn state lock") = state;
    }

    /// Token observed by every suspension point and driver of the cycle
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.tokens.lock().expect("turn token lock").cancel.clone()
    }

    /// Token that ends capture early without aborting the turn
    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.tokens.lock().expect("turn token lock").stop.clone()
    }

    fn request(&self, signal: TurnSignal) {
        {
            let mut slot = self.signal.lock().expect("turn signal lock");
            // first command wins; a later cancel does not downgrade a barge-in
            if slot.is_none() {
                *slot = Some(signal);
            }
        }
        self.tokens.lock().expect("turn token lock").cancel.cancel();
    }

    fn request_stop_listening(&self) {
        self.tokens.lock().expect("turn token lock").stop.cancel();
    }

    pub(crate) fn take_signal(&self) -> Option<TurnSignal> {
        self.signal.lock().expect("turn signal lock").take()
    }

    /// Fresh tokens for the next listening cycle after a barge-in or
    /// auto-resume. A command that landed since the last cycle resolved
    /// keeps its cancelled tokens so the next suspension point observes
    /// it immediately instead of losing it.
    pub(crate) fn arm_new_cycle(&self) {
        let signal = self.signal.lock().expect("turn signal lock");
        let mut tokens = self.tokens.lock().expect("turn token lock");
        if signal.is_some() {
            return;
        }
        tokens.cancel = CancellationToken::new();
        tokens.stop = CancellationToken::new();
    }
}

/// The five collaborators the orchestrator drives
#[derive(Clone)]
pub struct Capabilities {
    pub capture: Arc<dyn CaptureSource>,
    pub playback: Arc<dyn PlaybackSink>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub completions: Arc<dyn CompletionClient>,
}

/// Orchestrator tuning; every duration-like knob is opaque configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model identifier passed through to the completion endpoint
    pub model: String,
    /// Sampling temperature passthrough
    pub temperature: Option<f32>,
    /// Token cap passthrough
    pub max_tokens: Option<u32>,
    /// System prompt prepended to every request
    pub system_prompt: Option<String>,
    /// Reopen the microphone after natural playback completion
    pub auto_resume: bool,
    /// Minimum characters per synthesized sentence chunk
    pub chunk_min_chars: usize,
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            model: config.api.model.clone(),
            temperature: config.api.temperature,
            max_tokens: config.api.max_tokens,
            system_prompt: config.api.system_prompt.clone(),
            auto_resume: config.audio.auto_resume,
            chunk_min_chars: config.voice.chunk_min_chars,
        }
    }
}

/// Drives capture → recognition → completion → synthesis → playback for
/// one session at a time, persisting messages at defined checkpoints and
/// emitting ordered status events.
pub struct ConversationOrchestrator {
    caps: Capabilities,
    store: ConversationRepo,
    events: EventBus,
    config: OrchestratorConfig,
    active: Mutex<HashMap<String, Arc<TurnShared>>>,
}

impl ConversationOrchestrator {
    /// Create an orchestrator over the given collaborators
    #[must_use]
    pub fn new(caps: Capabilities, store: ConversationRepo, config: OrchestratorConfig) -> Arc<Self> {
        Arc::new(Self {
            caps,
            store,
            events: EventBus::new(),
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe to the ordered status event stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Conversation store backing this orchestrator
    #[must_use]
    pub fn store(&self) -> &ConversationRepo {
        &self.store
    }

    /// Current state of a session; [`TurnState::Idle`] when no turn runs
    #[must_use]
    pub fn state(&self, session_id: &str) -> TurnState {
        self.active
            .lock()
            .expect("active turn lock")
            .get(session_id)
            .map_or(TurnState::Idle, |shared| shared.state())
    }

    /// Start a voice turn: open the microphone and listen for one utterance
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] when a turn is already active and
    /// [`Error::NotFound`] for an unknown session
    pub fn start_voice_turn(self: &Arc<Self>, session_id: &str) -> Result<()> {
        self.begin(session_id, TurnRequest::Voice)
    }

    /// Start a text turn with the given user input
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] when a turn is already active and
    /// [`Error::NotFound`] for an unknown session
    pub fn start_text_turn(self: &Arc<Self>, session_id: &str, text: &str) -> Result<()> {
        self.begin(session_id, TurnRequest::Text(text.to_string()))
    }

    /// Barge-in: stop whatever the session is doing right now.
    ///
    /// Accepted from every non-idle state; always drains through
    /// [`TurnState::Cancelling`]. During voice-mode assistant output this
    /// resumes listening afterwards. A no-op when the session is idle.
    pub fn interrupt(&self, session_id: &str) {
        if let Some(shared) = self.shared(session_id) {
            tracing::info!(session = %session_id, state = %shared.state(), "interrupt requested");
            shared.request(TurnSignal::Interrupt);
        }
    }

    /// Cancel the active turn and return to idle. A no-op when idle.
    pub fn cancel(&self, session_id: &str) {
        if let Some(shared) = self.shared(session_id) {
            tracing::info!(session = %session_id, state = %shared.state(), "cancel requested");
            shared.request(TurnSignal::Cancel);
        }
    }

    /// Manual stop while listening: close capture and recognize what was
    /// buffered so far. A no-op outside [`TurnState::Listening`].
    pub fn stop_listening(&self, session_id: &str) {
        if let Some(shared) = self.shared(session_id) {
            if shared.state() == TurnState::Listening {
                tracing::debug!(session = %session_id, "manual stop requested");
                shared.request_stop_listening();
            }
        }
    }

    fn shared(&self, session_id: &str) -> Option<Arc<TurnShared>> {
        self.active
            .lock()
            .expect("active turn lock")
            .get(session_id)
            .cloned()
    }

    fn begin(self: &Arc<Self>, session_id: &str, request: TurnRequest) -> Result<()> {
        // reject before registering anything
        self.store.get_session(session_id)?;

        let shared = {
            let mut active = self.active.lock().expect("active turn lock");
            if active.contains_key(session_id) {
                self.events.emit(StatusEvent::Busy {
                    session_id: session_id.to_string(),
                });
                return Err(Error::Busy(session_id.to_string()));
            }
            let shared = Arc::new(TurnShared::new());
            active.insert(session_id.to_string(), Arc::clone(&shared));
            shared
        };

        let orchestrator = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            turn::run_session(orchestrator, shared, session_id, request).await;
        });
        Ok(())
    }

    /// Called by the turn task when its control flow ends
    fn release(&self, session_id: &str, shared: &Arc<TurnShared>) {
        let mut active = self.active.lock().expect("active turn lock");
        if let Some(current) = active.get(session_id) {
            // a session must never be released by anything but its own turn
            debug_assert!(Arc::ptr_eq(current, shared), "foreign turn release");
            active.remove(session_id);
        }
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub(crate) fn capabilities(&self) -> &Capabilities {
        &self.caps
    }
}
