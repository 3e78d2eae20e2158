//! Per-turn state machine execution
//!
//! One call to [`run_session`] is the single control flow for a session:
//! a sequence of suspending operations (capture, recognition, each
//! stream delta, playback) that observes the turn's cancellation token
//! at every suspension point. Interrupt and cancel commands only cancel
//! that token; the race between a command and a natural completion is
//! resolved deterministically by whichever event this control flow
//! processes first.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::events::StatusEvent;
use crate::llm::{ChatMessage, CompletionRequest, StreamItem};
use crate::store::{Message, MessageRole, MessageStatus, DEFAULT_SESSION_TITLE};
use crate::text::{conversation_title, SentenceChunker};
use crate::voice::{AudioClip, CaptureOutcome, PlaybackOutcome, Recognition};
use crate::{Error, Result};

use super::{
    ConversationOrchestrator, PlaybackSink, TurnRequest, TurnShared, TurnSignal, TurnState,
};

use tokio_util::sync::CancellationToken;

/// Queue depth between synthesis and playback
const SPEAKER_QUEUE: usize = 8;

/// Maximum characters of a generated session title
const TITLE_MAX_CHARS: usize = 48;

/// How one turn cycle ended
enum CycleEnd {
    /// Return to idle; the session task exits
    Idle,
    /// Barge-in or auto-resume: start a fresh listening cycle
    Resume,
}

/// Why the streaming exchange loop exited
enum ExchangeEnding {
    Done,
    Cancelled,
    Failed(Error),
}

/// What the playback task reported
enum PlaybackResult {
    Finished,
    Stopped,
    Failed(Error),
}

/// Whether synthesized audio accompanies the stream
#[derive(Clone, Copy, PartialEq, Eq)]
enum TurnMode {
    Voice,
    Text,
}

/// Session control flow: runs turn cycles until the session goes idle
pub(super) async fn run_session(
    orc: Arc<ConversationOrchestrator>,
    shared: Arc<TurnShared>,
    session_id: String,
    request: TurnRequest,
) {
    let mut next = Some(request);

    loop {
        let result = match next.take().unwrap_or(TurnRequest::Voice) {
            TurnRequest::Voice => run_voice_turn(&orc, &shared, &session_id).await,
            TurnRequest::Text(text) => run_text_turn(&orc, &shared, &session_id, &text).await,
        };

        match result {
            Ok(CycleEnd::Resume) => {
                shared.arm_new_cycle();
            }
            Ok(CycleEnd::Idle) => break,
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "turn aborted");
                debug_assert!(
                    !matches!(e, Error::Storage(_)),
                    "conversation log invariant violated: {e}"
                );
                emit_error(&orc, &session_id, &e);
                break;
            }
        }
    }

    shared.set_state(TurnState::Idle);
    orc.release(&session_id, &shared);
    orc.events().emit(StatusEvent::Idle { session_id });
}

/// One voice turn: Listening → Recognizing → completion exchange
async fn run_voice_turn(
    orc: &Arc<ConversationOrchestrator>,
    shared: &TurnShared,
    session_id: &str,
) -> Result<CycleEnd> {
    shared.set_state(TurnState::Listening);
    orc.events().emit(StatusEvent::TurnStarted {
        session_id: session_id.to_string(),
    });
    orc.events().emit(StatusEvent::Listening {
        session_id: session_id.to_string(),
    });

    let cancel = shared.cancel_token();
    let stop = shared.stop_token();

    let outcome = match orc.capabilities().capture.record(stop, cancel.clone()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            emit_error(orc, session_id, &e);
            return Ok(CycleEnd::Idle);
        }
    };

    let clip = match outcome {
        CaptureOutcome::Clip(clip) => clip,
        CaptureOutcome::Cancelled => return Ok(finish_before_persist(orc, shared, session_id)),
    };

    shared.set_state(TurnState::Recognizing);

    let recognition = match orc.capabilities().recognizer.recognize(&clip).await {
        Ok(recognition) => recognition,
        Err(e) => {
            emit_error(orc, session_id, &e);
            return Ok(CycleEnd::Idle);
        }
    };

    // recognition is one-shot and not cancellable; honor a command that
    // arrived while it ran before anything is persisted
    if cancel.is_cancelled() {
        return Ok(finish_before_persist(orc, shared, session_id));
    }

    let text = match recognition {
        Recognition::Text(text) => text,
        Recognition::NoSpeech => {
            tracing::debug!(session = %session_id, "nothing heard");
            orc.events().emit(StatusEvent::NothingHeard {
                session_id: session_id.to_string(),
            });
            return Ok(CycleEnd::Idle);
        }
    };

    let ordinal = orc.store().next_ordinal(session_id)?;
    orc.store().append_or_update(
        session_id,
        ordinal,
        MessageRole::User,
        &text,
        MessageStatus::Complete,
    )?;
    maybe_autotitle(orc, session_id, ordinal, &text)?;
    orc.events().emit(StatusEvent::Recognized {
        session_id: session_id.to_string(),
        text,
    });

    run_completion_exchange(orc, shared, session_id, TurnMode::Voice, None).await
}

/// One text turn: pending user message → completion exchange
async fn run_text_turn(
    orc: &Arc<ConversationOrchestrator>,
    shared: &TurnShared,
    session_id: &str,
    text: &str,
) -> Result<CycleEnd> {
    shared.set_state(TurnState::AwaitingCompletion);
    orc.events().emit(StatusEvent::TurnStarted {
        session_id: session_id.to_string(),
    });

    let ordinal = orc.store().next_ordinal(session_id)?;
    orc.store().append_or_update(
        session_id,
        ordinal,
        MessageRole::User,
        text,
        MessageStatus::Pending,
    )?;
    maybe_autotitle(orc, session_id, ordinal, text)?;

    run_completion_exchange(orc, shared, session_id, TurnMode::Text, Some(ordinal)).await
}

/// Stream the completion, persisting deltas and (in voice mode) feeding
/// the synthesis/playback pipeline, then resolve the turn's end state.
#[allow(clippy::too_many_lines)]
async fn run_completion_exchange(
    orc: &Arc<ConversationOrchestrator>,
    shared: &TurnShared,
    session_id: &str,
    mode: TurnMode,
    pending_user: Option<i64>,
) -> Result<CycleEnd> {
    let cancel = shared.cancel_token();

    // a command may have landed before the request went out
    if cancel.is_cancelled() {
        if let Some(ordinal) = pending_user {
            orc.store()
                .finalize(session_id, ordinal, MessageStatus::Complete)?;
        }
        return Ok(finish_before_persist(orc, shared, session_id));
    }

    let history = orc.store().read_history(session_id)?;
    let request = build_request(orc, &history);

    let mut stream = match orc
        .capabilities()
        .completions
        .stream_chat(request, cancel.clone())
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            // the user input was submitted regardless of the endpoint
            if let Some(ordinal) = pending_user {
                orc.store()
                    .finalize(session_id, ordinal, MessageStatus::Complete)?;
            }
            emit_error(orc, session_id, &e);
            return Ok(CycleEnd::Idle);
        }
    };

    if let Some(ordinal) = pending_user {
        orc.store()
            .finalize(session_id, ordinal, MessageStatus::Complete)?;
    }

    shared.set_state(TurnState::AwaitingCompletion);

    let assistant = orc.store().next_ordinal(session_id)?;
    orc.store().append_or_update(
        session_id,
        assistant,
        MessageRole::Assistant,
        "",
        MessageStatus::Pending,
    )?;

    // playback pipeline (voice mode): sentences synthesized as deltas
    // arrive, queued to a single sequential speaker task
    let pipeline = cancel.child_token();
    let (mut chunk_tx, mut speaker) = if mode == TurnMode::Voice {
        let (tx, rx) = mpsc::channel::<AudioClip>(SPEAKER_QUEUE);
        let playback = Arc::clone(&orc.capabilities().playback);
        let task = tokio::spawn(speaker_task(playback, rx, pipeline.clone()));
        (Some(tx), Some(task))
    } else {
        (None, None)
    };

    let mut chunker = SentenceChunker::new(orc.config().chunk_min_chars);
    let mut content = String::new();

    let ending = 'stream: loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => break 'stream ExchangeEnding::Cancelled,
            item = stream.next() => item,
        };

        match item {
            Some(StreamItem::Delta(delta)) => {
                content.push_str(&delta);
                orc.store().append_or_update(
                    session_id,
                    assistant,
                    MessageRole::Assistant,
                    &content,
                    MessageStatus::Pending,
                )?;
                orc.events().emit(StatusEvent::CompletionDelta {
                    session_id: session_id.to_string(),
                    text: delta.clone(),
                });

                if let Some(tx) = &chunk_tx {
                    for sentence in chunker.push(&delta) {
                        match orc.capabilities().synthesizer.synthesize(&sentence).await {
                            Ok(clip) => {
                                if !clip.is_empty() {
                                    // a send error means the speaker stopped;
                                    // whatever stopped it resolves on the next pass
                                    let _ = tx.send(clip).await;
                                }
                            }
                            Err(e) => break 'stream ExchangeEnding::Failed(e),
                        }
                    }
                }
            }
            Some(StreamItem::Done) => break 'stream ExchangeEnding::Done,
            Some(StreamItem::Failed(e)) => break 'stream ExchangeEnding::Failed(e),
            None => {
                break 'stream if cancel.is_cancelled() {
                    ExchangeEnding::Cancelled
                } else {
                    ExchangeEnding::Failed(Error::Protocol(
                        "completion stream ended unexpectedly".to_string(),
                    ))
                };
            }
        }
    };

    match ending {
        ExchangeEnding::Done => {
            if mode == TurnMode::Text {
                orc.store()
                    .finalize(session_id, assistant, MessageStatus::Complete)?;
                orc.events().emit(StatusEvent::CompletionDone {
                    session_id: session_id.to_string(),
                });
                return Ok(CycleEnd::Idle);
            }

            // flush the unterminated tail to the speaker
            if let Some(tx) = chunk_tx.clone() {
                if let Some(rest) = chunker.flush() {
                    match orc.capabilities().synthesizer.synthesize(&rest).await {
                        Ok(clip) => {
                            if !clip.is_empty() {
                                let _ = tx.send(clip).await;
                            }
                        }
                        Err(e) => {
                            return fail_exchange(
                                orc, shared, session_id, assistant, &pipeline,
                                chunk_tx.take(), speaker.take(), e,
                            )
                            .await;
                        }
                    }
                }
            }
            drop(chunk_tx.take());

            shared.set_state(TurnState::Speaking);
            orc.events().emit(StatusEvent::Speaking {
                session_id: session_id.to_string(),
            });

            // in voice mode finalization waits for playback so a barge-in
            // can still mark the message interrupted, never complete
            match join_speaker(speaker.take()).await {
                PlaybackResult::Finished => {
                    orc.store()
                        .finalize(session_id, assistant, MessageStatus::Complete)?;
                    orc.events().emit(StatusEvent::CompletionDone {
                        session_id: session_id.to_string(),
                    });
                    if orc.config().auto_resume {
                        Ok(CycleEnd::Resume)
                    } else {
                        Ok(CycleEnd::Idle)
                    }
                }
                PlaybackResult::Stopped => {
                    shared.set_state(TurnState::Cancelling);
                    orc.store()
                        .finalize(session_id, assistant, MessageStatus::Interrupted)?;
                    Ok(resolve_signal(orc, shared, session_id, mode))
                }
                PlaybackResult::Failed(e) => {
                    // the response itself arrived intact; only output failed
                    orc.store()
                        .finalize(session_id, assistant, MessageStatus::Complete)?;
                    orc.events().emit(StatusEvent::CompletionDone {
                        session_id: session_id.to_string(),
                    });
                    emit_error(orc, session_id, &e);
                    Ok(CycleEnd::Idle)
                }
            }
        }

        ExchangeEnding::Cancelled => {
            shared.set_state(TurnState::Cancelling);
            pipeline.cancel();
            drop(chunk_tx.take());
            let _ = join_speaker(speaker.take()).await;

            orc.store()
                .finalize(session_id, assistant, MessageStatus::Interrupted)?;
            Ok(resolve_signal(orc, shared, session_id, mode))
        }

        ExchangeEnding::Failed(e) => {
            fail_exchange(
                orc, shared, session_id, assistant, &pipeline,
                chunk_tx.take(), speaker.take(), e,
            )
            .await
        }
    }
}

/// Tear down the pipeline and finalize the assistant message as failed,
/// keeping whatever partial content already arrived.
#[allow(clippy::too_many_arguments)]
async fn fail_exchange(
    orc: &Arc<ConversationOrchestrator>,
    shared: &TurnShared,
    session_id: &str,
    assistant: i64,
    pipeline: &CancellationToken,
    chunk_tx: Option<mpsc::Sender<AudioClip>>,
    speaker: Option<tokio::task::JoinHandle<PlaybackResult>>,
    error: Error,
) -> Result<CycleEnd> {
    shared.set_state(TurnState::Cancelling);
    pipeline.cancel();
    drop(chunk_tx);
    let _ = join_speaker(speaker).await;

    orc.store()
        .finalize(session_id, assistant, MessageStatus::Failed)?;
    emit_error(orc, session_id, &error);
    Ok(CycleEnd::Idle)
}

/// Sequentially play queued clips until the queue closes or cancellation
async fn speaker_task(
    playback: Arc<dyn PlaybackSink>,
    mut rx: mpsc::Receiver<AudioClip>,
    cancel: CancellationToken,
) -> PlaybackResult {
    loop {
        let clip = tokio::select! {
            biased;
            () = cancel.cancelled() => return PlaybackResult::Stopped,
            clip = rx.recv() => match clip {
                Some(clip) => clip,
                None => return PlaybackResult::Finished,
            },
        };

        match playback.play(clip, cancel.clone()).await {
            Ok(PlaybackOutcome::Finished) => {}
            Ok(PlaybackOutcome::Stopped) => return PlaybackResult::Stopped,
            Err(e) => return PlaybackResult::Failed(e),
        }
    }
}

async fn join_speaker(
    speaker: Option<tokio::task::JoinHandle<PlaybackResult>>,
) -> PlaybackResult {
    match speaker {
        None => PlaybackResult::Finished,
        Some(task) => task
            .await
            .unwrap_or_else(|e| PlaybackResult::Failed(Error::Audio(format!(
                "speaker task panicked: {e}"
            )))),
    }
}

/// Drain through Cancelling for a command that arrived before anything
/// was persisted this cycle; nothing to finalize.
fn finish_before_persist(
    orc: &Arc<ConversationOrchestrator>,
    shared: &TurnShared,
    session_id: &str,
) -> CycleEnd {
    shared.set_state(TurnState::Cancelling);
    match shared.take_signal() {
        Some(TurnSignal::Interrupt) => orc.events().emit(StatusEvent::Interrupted {
            session_id: session_id.to_string(),
        }),
        _ => orc.events().emit(StatusEvent::Cancelled {
            session_id: session_id.to_string(),
        }),
    }
    CycleEnd::Idle
}

/// Resolve the recorded signal after the in-flight message was finalized.
///
/// A barge-in while assistant output was active resumes listening in
/// voice mode; everything else returns to idle.
fn resolve_signal(
    orc: &Arc<ConversationOrchestrator>,
    shared: &TurnShared,
    session_id: &str,
    mode: TurnMode,
) -> CycleEnd {
    match shared.take_signal() {
        Some(TurnSignal::Interrupt) => {
            orc.events().emit(StatusEvent::Interrupted {
                session_id: session_id.to_string(),
            });
            if mode == TurnMode::Voice {
                CycleEnd::Resume
            } else {
                CycleEnd::Idle
            }
        }
        _ => {
            orc.events().emit(StatusEvent::Cancelled {
                session_id: session_id.to_string(),
            });
            CycleEnd::Idle
        }
    }
}

/// Build the completion request from the stored history.
///
/// Failed messages are for user inspection only and are excluded;
/// interrupted partial content was seen or heard and stays in context.
fn build_request(orc: &ConversationOrchestrator, history: &[Message]) -> CompletionRequest {
    let config = orc.config();

    let mut messages = Vec::with_capacity(history.len() + 1);
    if let Some(prompt) = &config.system_prompt {
        messages.push(ChatMessage::system(prompt));
    }
    for message in history {
        if message.status == MessageStatus::Failed || message.content.is_empty() {
            continue;
        }
        messages.push(ChatMessage {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
        });
    }

    CompletionRequest {
        model: config.model.clone(),
        messages,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        stream: None,
    }
}

/// Name the session after its first message
fn maybe_autotitle(
    orc: &ConversationOrchestrator,
    session_id: &str,
    ordinal: i64,
    text: &str,
) -> Result<()> {
    if ordinal != 1 {
        return Ok(());
    }
    let session = orc.store().get_session(session_id)?;
    if session.title == DEFAULT_SESSION_TITLE {
        orc.store()
            .rename_session(session_id, &conversation_title(text, TITLE_MAX_CHARS))?;
    }
    Ok(())
}

fn emit_error(orc: &ConversationOrchestrator, session_id: &str, error: &Error) {
    tracing::warn!(session = %session_id, error = %error, "turn ended with error");
    orc.events().emit(StatusEvent::Error {
        session_id: session_id.to_string(),
        kind: error.kind(),
        message: error.to_string(),
    });
}
