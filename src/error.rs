//! Error types for RPChat

use thiserror::Error;

/// Result type alias for RPChat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in RPChat
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device missing or busy
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Audio processing error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Completion endpoint unreachable (transport-level failure)
    #[error("network error: {0}")]
    Network(String),

    /// Completion endpoint reachable but the exchange was malformed
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation cancelled by the user; not a failure
    #[error("cancelled")]
    Cancelled,

    /// A turn was requested while another is active for the session
    #[error("session busy: {0}")]
    Busy(String),

    /// Conversation log invariant violated; indicates a programming error
    #[error("storage invariant violated: {0}")]
    Storage(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Coarse classification carried on error status events
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceUnavailable(_) | Self::Audio(_) => ErrorKind::DeviceUnavailable,
            Self::Stt(_) => ErrorKind::RecognitionFailed,
            Self::Tts(_) => ErrorKind::Synthesis,
            Self::Network(_) | Self::Http(_) => ErrorKind::Network,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Storage(_) => ErrorKind::Storage,
            _ => ErrorKind::Other,
        }
    }
}

/// Error classification surfaced to the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Microphone or speaker busy or missing
    DeviceUnavailable,
    /// Speech could not be recognized
    RecognitionFailed,
    /// Speech could not be synthesized
    Synthesis,
    /// Completion endpoint unreachable
    Network,
    /// Completion endpoint misbehaved
    Protocol,
    /// User-initiated cancellation
    Cancelled,
    /// Turn rejected because another is active
    Busy,
    /// Conversation log invariant violation
    Storage,
    /// Anything else
    Other,
}

impl ErrorKind {
    /// Stable lowercase label for logs and event payloads
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeviceUnavailable => "device_unavailable",
            Self::RecognitionFailed => "recognition_failed",
            Self::Synthesis => "synthesis_failed",
            Self::Network => "network_error",
            Self::Protocol => "protocol_error",
            Self::Cancelled => "cancelled",
            Self::Busy => "busy",
            Self::Storage => "storage_invariant",
            Self::Other => "error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::Network("down".into()).kind(),
            ErrorKind::Network
        );
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::Busy("s1".into()).kind().as_str(),
            "busy"
        );
    }
}
