//! SSE line parser for the OpenAI streaming chat-completion format
//!
//! The endpoint sends lines like:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}
//!
//! data: {"choices":[{"delta":{},"finish_reason":"stop"}]}
//!
//! data: [DONE]
//! ```
//!
//! Each non-empty `data:` line is either a JSON delta object or the
//! literal `[DONE]` sentinel marking end of stream.

use serde::Deserialize;

use crate::{Error, Result};

/// End-of-stream sentinel
const DONE_SENTINEL: &str = "[DONE]";

/// One parsed unit of the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SseChunk {
    /// Incremental completion text
    Delta(String),
    /// Stream finished, either via finish_reason or the `[DONE]` sentinel
    Done { finish_reason: Option<String> },
}

#[derive(Deserialize)]
struct StreamPayload {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: DeltaContent,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct DeltaContent {
    content: Option<String>,
}

/// Parse one SSE line into zero or more chunks.
///
/// Empty lines, comments (`:`-prefixed) and non-`data:` fields are event
/// framing and yield nothing.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for a `data:` payload that is not valid
/// delta JSON.
pub(crate) fn parse_sse_line(line: &str) -> Result<Vec<SseChunk>> {
    let line = line.trim_end();

    if line.is_empty() || line.starts_with(':') {
        return Ok(vec![]);
    }

    let Some(payload) = line.strip_prefix("data:") else {
        // event:, id:, retry: framing lines
        return Ok(vec![]);
    };
    let payload = payload.trim_start();

    if payload.is_empty() {
        return Ok(vec![]);
    }

    if payload == DONE_SENTINEL {
        return Ok(vec![SseChunk::Done {
            finish_reason: None,
        }]);
    }

    let parsed: StreamPayload = serde_json::from_str(payload)
        .map_err(|e| Error::Protocol(format!("malformed stream delta: {e}")))?;

    let mut chunks = Vec::new();
    if let Some(choice) = parsed.choices.first() {
        if let Some(text) = &choice.delta.content {
            if !text.is_empty() {
                chunks.push(SseChunk::Delta(text.clone()));
            }
        }
        if choice.finish_reason.is_some() {
            chunks.push(SseChunk::Done {
                finish_reason: choice.finish_reason.clone(),
            });
        }
    }

    Ok(chunks)
}
