//! OpenAI-compatible chat completion client
//!
//! Persistence is the orchestrator's responsibility; this module only
//! performs the network exchange and hands back deltas.

mod sse;

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ApiConfig;
use crate::{Error, Result};

use sse::{parse_sse_line, SseChunk};

/// Capacity of the delta channel between the reader task and the consumer
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// One role/content pair of the request history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    #[must_use]
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }
}

/// Chat completion request payload
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// Non-streaming response payload
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// One item delivered by a [`CompletionStream`]
#[derive(Debug)]
pub enum StreamItem {
    /// Incremental completion text, in arrival order
    Delta(String),
    /// The stream finished normally (possibly with zero deltas)
    Done,
    /// The stream failed; no further items follow
    Failed(Error),
}

/// Cancellable, lazy sequence of completion deltas
///
/// After the cancellation token passed to
/// [`ChatCompletionClient::stream_chat`] fires, no further deltas are
/// delivered, even if they are already in flight over the network.
#[derive(Debug)]
pub struct CompletionStream {
    rx: mpsc::Receiver<StreamItem>,
}

impl CompletionStream {
    /// Create a stream plus the sender side that feeds it.
    ///
    /// Used by the HTTP client below and by test doubles.
    #[must_use]
    pub fn channel() -> (mpsc::Sender<StreamItem>, Self) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        (tx, Self { rx })
    }

    /// Next item; None once the sender is gone
    pub async fn next(&mut self) -> Option<StreamItem> {
        self.rx.recv().await
    }
}

/// Client for an OpenAI-compatible chat completion endpoint
#[derive(Debug, Clone)]
pub struct ChatCompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ChatCompletionClient {
    /// Create a new client
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be constructed
    pub fn new(api: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(api.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: api.api_key.clone(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }

    /// Issue a non-streaming completion request and return the full text
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] when the endpoint is unreachable and
    /// [`Error::Protocol`] for non-success statuses or malformed bodies
    pub async fn chat(&self, request: &CompletionRequest) -> Result<String> {
        let mut request = request.clone();
        request.stream = Some(false);

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "sending chat completion request"
        );

        let response = self
            .authorize(self.http.post(self.completions_url()))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!(
                "completion endpoint returned {status}: {body}"
            )));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("malformed completion response: {e}")))?;

        Ok(parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }

    /// Probe the endpoint with a one-token request
    pub async fn test_connection(&self, model: &str) -> bool {
        let request = CompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::user("Hello, this is a connection test.")],
            temperature: None,
            max_tokens: Some(1),
            stream: None,
        };

        match self.chat(&request).await {
            Ok(_) => {
                tracing::info!("completion endpoint reachable");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection test failed");
                false
            }
        }
    }

    /// Start a streaming completion request.
    ///
    /// The returned stream yields deltas in arrival order, terminated by
    /// [`StreamItem::Done`] or [`StreamItem::Failed`]. Cancelling `cancel`
    /// stops delivery immediately; nothing is sent afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] when the endpoint is unreachable and
    /// [`Error::Protocol`] when it rejects the request
    pub async fn stream_chat(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream> {
        let mut request = request;
        request.stream = Some(true);

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "sending streaming chat completion request"
        );

        let response = self
            .authorize(self.http.post(self.completions_url()))
            .header("Accept", "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!(
                "completion endpoint returned {status}: {body}"
            )));
        }

        let (tx, stream) = CompletionStream::channel();
        tokio::spawn(read_sse_stream(response, tx, cancel));
        Ok(stream)
    }
}

/// Drive the SSE byte stream, forwarding chunks until done, error,
/// cancellation, or a dropped receiver.
async fn read_sse_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<StreamItem>,
    cancel: CancellationToken,
) {
    let mut bytes = response.bytes_stream();
    let mut buffer = String::new();

    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("completion stream cancelled, discarding remainder");
                return;
            }
            chunk = bytes.next() => chunk,
        };

        let data = match chunk {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                let _ = tx
                    .send(StreamItem::Failed(Error::Network(format!(
                        "stream read error: {e}"
                    ))))
                    .await;
                return;
            }
            None => break,
        };

        buffer.push_str(&String::from_utf8_lossy(&data));

        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();

            let chunks = match parse_sse_line(&line) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed SSE line");
                    continue;
                }
            };

            for chunk in chunks {
                if cancel.is_cancelled() {
                    return;
                }
                match chunk {
                    SseChunk::Delta(text) => {
                        if tx.send(StreamItem::Delta(text)).await.is_err() {
                            tracing::debug!("stream receiver dropped, stopping");
                            return;
                        }
                    }
                    SseChunk::Done { finish_reason } => {
                        tracing::debug!(?finish_reason, "completion stream finished");
                        let _ = tx.send(StreamItem::Done).await;
                        return;
                    }
                }
            }
        }
    }

    // Some providers close the connection without a [DONE] sentinel
    let _ = tx.send(StreamItem::Done).await;
}

/// Map a transport-level reqwest failure to [`Error::Network`]
fn transport_error(e: reqwest::Error) -> Error {
    Error::Network(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_skips_unset_fields() {
        let request = CompletionRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: None,
            max_tokens: None,
            stream: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("temperature").is_none());
        assert!(json.get("stream").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn test_stream_channel_delivers_in_order() {
        let (tx, mut stream) = CompletionStream::channel();
        tx.send(StreamItem::Delta("a".into())).await.unwrap();
        tx.send(StreamItem::Delta("b".into())).await.unwrap();
        tx.send(StreamItem::Done).await.unwrap();
        drop(tx);

        assert!(matches!(stream.next().await, Some(StreamItem::Delta(d)) if d == "a"));
        assert!(matches!(stream.next().await, Some(StreamItem::Delta(d)) if d == "b"));
        assert!(matches!(stream.next().await, Some(StreamItem::Done)));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let api = ApiConfig {
            base_url: "http://localhost:1234/v1/".into(),
            api_key: String::new(),
            model: "m".into(),
            temperature: None,
            max_tokens: None,
            timeout: Duration::from_secs(5),
            system_prompt: None,
        };
        let client = ChatCompletionClient::new(&api).unwrap();
        assert_eq!(
            client.completions_url(),
            "http://localhost:1234/v1/chat/completions"
        );
    }
}
