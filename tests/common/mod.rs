//! Shared test fixtures: in-memory store, scripted capability doubles,
//! and a device-exclusivity monitor

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use rpchat::voice::SAMPLE_RATE;
use rpchat::{
    AudioClip, Capabilities, CaptureOutcome, CaptureSource, CompletionClient, CompletionRequest,
    CompletionStream, ConversationOrchestrator, ConversationRepo, Error, OrchestratorConfig,
    PlaybackOutcome, PlaybackSink, Recognition, Result, SpeechRecognizer, SpeechSynthesizer,
    StatusEvent, StreamItem, DEFAULT_SESSION_TITLE,
};

/// Default timeout when waiting for an event
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Set up an in-memory conversation store
pub fn setup_store() -> ConversationRepo {
    ConversationRepo::new(rpchat::store::init_memory().expect("init test db"))
}

/// A one-second clip of quiet speech-like audio
pub fn speech_clip() -> AudioClip {
    AudioClip::new(vec![0.1; SAMPLE_RATE as usize], SAMPLE_RATE)
}

/// Tracks exclusive ownership of the two audio devices.
///
/// Capture and playback must never be open at the same time. Both
/// scripted devices report acquisition here; any overlap is latched.
#[derive(Debug, Default)]
pub struct DeviceMonitor {
    capture_open: AtomicBool,
    playback_open: AtomicBool,
    overlap: AtomicBool,
}

impl DeviceMonitor {
    pub fn open_capture(&self) {
        if self.playback_open.load(Ordering::SeqCst) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        self.capture_open.store(true, Ordering::SeqCst);
    }

    pub fn close_capture(&self) {
        self.capture_open.store(false, Ordering::SeqCst);
    }

    pub fn open_playback(&self) {
        if self.capture_open.load(Ordering::SeqCst) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        self.playback_open.store(true, Ordering::SeqCst);
    }

    pub fn close_playback(&self) {
        self.playback_open.store(false, Ordering::SeqCst);
    }

    pub fn overlapped(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }
}

/// One scripted recording
#[derive(Debug, Clone)]
pub enum CaptureScript {
    /// Resolve with a speech clip after `delay`
    Clip(Duration),
    /// Resolve with an empty clip (no speech) after `delay`
    Empty(Duration),
}

/// Capture double: plays back a script, then waits for stop/cancel
pub struct ScriptedCapture {
    monitor: Arc<DeviceMonitor>,
    script: Mutex<VecDeque<CaptureScript>>,
}

impl ScriptedCapture {
    pub fn new(monitor: Arc<DeviceMonitor>, script: Vec<CaptureScript>) -> Self {
        Self {
            monitor,
            script: Mutex::new(script.into()),
        }
    }
}

#[async_trait]
impl CaptureSource for ScriptedCapture {
    async fn record(
        &self,
        stop: CancellationToken,
        cancel: CancellationToken,
    ) -> Result<CaptureOutcome> {
        self.monitor.open_capture();
        let entry = self.script.lock().unwrap().pop_front();

        let (delay, clip) = match entry {
            Some(CaptureScript::Clip(delay)) => (delay, speech_clip()),
            Some(CaptureScript::Empty(delay)) => (delay, AudioClip::default()),
            // script exhausted: behave like an open mic hearing nothing,
            // resolving only on stop or cancel
            None => (Duration::from_secs(3600), AudioClip::default()),
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => CaptureOutcome::Cancelled,
            () = stop.cancelled() => CaptureOutcome::Clip(speech_clip()),
            () = tokio::time::sleep(delay) => CaptureOutcome::Clip(clip),
        };

        self.monitor.close_capture();
        Ok(outcome)
    }
}

/// Recognizer double: scripted results, else clip-driven like the real one
pub struct ScriptedRecognizer {
    results: Mutex<VecDeque<Result<Recognition>>>,
}

impl ScriptedRecognizer {
    pub fn new(results: Vec<Result<Recognition>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn recognize(&self, clip: &AudioClip) -> Result<Recognition> {
        if let Some(result) = self.results.lock().unwrap().pop_front() {
            return result;
        }
        if clip.is_empty() {
            Ok(Recognition::NoSpeech)
        } else {
            Ok(Recognition::Text("scripted utterance".to_string()))
        }
    }
}

/// Synthesizer double: a short clip per chunk, counting calls
#[derive(Default)]
pub struct ScriptedSynthesizer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<AudioClip> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AudioClip::new(vec![0.1; 1600], SAMPLE_RATE))
    }
}

/// Playback double: each clip "plays" for `chunk_duration` wall time
pub struct ScriptedPlayback {
    monitor: Arc<DeviceMonitor>,
    chunk_duration: Duration,
    pub played: AtomicUsize,
}

impl ScriptedPlayback {
    pub fn new(monitor: Arc<DeviceMonitor>, chunk_duration: Duration) -> Self {
        Self {
            monitor,
            chunk_duration,
            played: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PlaybackSink for ScriptedPlayback {
    async fn play(&self, _clip: AudioClip, cancel: CancellationToken) -> Result<PlaybackOutcome> {
        self.monitor.open_playback();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => PlaybackOutcome::Stopped,
            () = tokio::time::sleep(self.chunk_duration) => PlaybackOutcome::Finished,
        };
        self.monitor.close_playback();
        if outcome == PlaybackOutcome::Finished {
            self.played.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }
}

/// Completion double: streams scripted deltas with a delay between each
pub struct ScriptedCompletion {
    pub deltas: Vec<String>,
    pub delta_delay: Duration,
    /// Send a network failure after this many deltas
    pub fail_after: Option<usize>,
    /// Fail the request before any stream starts
    pub connect_error: bool,
    /// Last request issued, for history assertions
    pub last_request: Mutex<Option<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(ToString::to_string).collect(),
            delta_delay: Duration::from_millis(2),
            fail_after: None,
            connect_error: false,
            last_request: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn stream_chat(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream> {
        *self.last_request.lock().unwrap() = Some(request);

        if self.connect_error {
            return Err(Error::Network("scripted connect failure".to_string()));
        }

        let deltas = self.deltas.clone();
        let delay = self.delta_delay;
        let fail_after = self.fail_after;
        let (tx, stream) = CompletionStream::channel();

        tokio::spawn(async move {
            for (i, delta) in deltas.into_iter().enumerate() {
                if fail_after == Some(i) {
                    let _ = tx
                        .send(StreamItem::Failed(Error::Network(
                            "scripted mid-stream failure".to_string(),
                        )))
                        .await;
                    return;
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                if cancel.is_cancelled() || tx.send(StreamItem::Delta(delta)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamItem::Done).await;
        });

        Ok(stream)
    }
}

/// Everything a scenario test needs in one place
pub struct Harness {
    pub orchestrator: Arc<ConversationOrchestrator>,
    pub store: ConversationRepo,
    pub session_id: String,
    pub monitor: Arc<DeviceMonitor>,
    pub playback: Arc<ScriptedPlayback>,
    pub synthesizer: Arc<ScriptedSynthesizer>,
    pub completion: Arc<ScriptedCompletion>,
    pub events: broadcast::Receiver<StatusEvent>,
}

/// Options for building a harness
pub struct HarnessOptions {
    pub completion: ScriptedCompletion,
    pub capture_script: Vec<CaptureScript>,
    pub recognizer: ScriptedRecognizer,
    pub chunk_duration: Duration,
    pub auto_resume: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            completion: ScriptedCompletion::new(&["Hello there."]),
            capture_script: vec![CaptureScript::Clip(Duration::from_millis(10))],
            recognizer: ScriptedRecognizer::empty(),
            chunk_duration: Duration::from_millis(10),
            auto_resume: false,
        }
    }
}

impl Harness {
    pub fn build(options: HarnessOptions) -> Self {
        let monitor = Arc::new(DeviceMonitor::default());
        let playback = Arc::new(ScriptedPlayback::new(
            Arc::clone(&monitor),
            options.chunk_duration,
        ));
        let synthesizer = Arc::new(ScriptedSynthesizer::default());
        let completion = Arc::new(options.completion);

        let caps = Capabilities {
            capture: Arc::new(ScriptedCapture::new(
                Arc::clone(&monitor),
                options.capture_script,
            )),
            playback: Arc::clone(&playback) as Arc<dyn PlaybackSink>,
            recognizer: Arc::new(options.recognizer),
            synthesizer: Arc::clone(&synthesizer) as Arc<dyn SpeechSynthesizer>,
            completions: Arc::clone(&completion) as Arc<dyn CompletionClient>,
        };

        let config = OrchestratorConfig {
            model: "test-model".to_string(),
            temperature: None,
            max_tokens: None,
            system_prompt: None,
            auto_resume: options.auto_resume,
            chunk_min_chars: 4,
        };

        let store = setup_store();
        let session = store.create_session(DEFAULT_SESSION_TITLE).unwrap();
        let orchestrator = ConversationOrchestrator::new(caps, store.clone(), config);
        let events = orchestrator.subscribe();

        Self {
            orchestrator,
            store,
            session_id: session.id,
            monitor,
            playback,
            synthesizer,
            completion,
            events,
        }
    }

    /// Next event for this harness's session
    pub async fn next_event(&mut self) -> StatusEvent {
        loop {
            let event = tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if event.session_id() == self.session_id {
                return event;
            }
        }
    }

    /// Skip events until `pred` matches; returns the matching event
    pub async fn wait_for<F>(&mut self, mut pred: F) -> StatusEvent
    where
        F: FnMut(&StatusEvent) -> bool,
    {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }

    /// Collect every event through the session's return to idle
    pub async fn collect_until_idle(&mut self) -> Vec<StatusEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_event().await;
            let done = matches!(event, StatusEvent::Idle { .. });
            seen.push(event);
            if done {
                return seen;
            }
        }
    }
}
