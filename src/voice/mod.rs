//! Audio capture, playback, speech recognition and synthesis

pub mod capture;
pub mod playback;
pub mod stt;
pub mod tts;

pub use capture::{samples_to_wav, AudioCapture, CaptureOutcome, SAMPLE_RATE};
pub use playback::{decode_mp3, AudioPlayback, PlaybackOutcome};
pub use stt::{Recognition, SpeechToText};
pub use tts::TextToSpeech;

/// Decoded mono audio
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioClip {
    /// Samples in the range [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Samples per second
    pub sample_rate: u32,
}

impl AudioClip {
    /// Create a clip from samples
    #[must_use]
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Whether the clip contains no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Clip length in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}
