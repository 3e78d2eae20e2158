//! Audio capture from microphone
//!
//! Recording is a scoped acquisition: the cpal stream is created inside
//! [`AudioCapture::record`] on a blocking thread and unconditionally
//! dropped before the call returns, whether the utterance completed, the
//! caller cancelled, or an error occurred. The device is therefore never
//! held outside an active recording call.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use tokio_util::sync::CancellationToken;

use crate::config::AudioConfig;
use crate::{Error, Result};

use super::AudioClip;

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16_000;

/// How often the recording loop drains the buffer and checks its tokens
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of one recording call
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// A finished utterance; empty when no speech started in time
    Clip(AudioClip),
    /// The caller aborted; the buffer was discarded
    Cancelled,
}

/// Captures one utterance at a time from the default input device
#[derive(Debug, Clone)]
pub struct AudioCapture {
    tuning: EndpointTuning,
}

impl AudioCapture {
    /// Create a capture source with the given endpointing configuration
    #[must_use]
    pub fn new(audio: &AudioConfig) -> Self {
        Self {
            tuning: EndpointTuning::from_config(audio),
        }
    }

    /// Record a single utterance.
    ///
    /// Returns when the endpointer detects end of speech, `stop` fires
    /// (manual stop; the buffered audio so far is returned), no speech
    /// starts within the configured window (an empty clip), or `cancel`
    /// fires ([`CaptureOutcome::Cancelled`], buffer discarded).
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] if the microphone cannot be
    /// opened
    pub async fn record(
        &self,
        stop: CancellationToken,
        cancel: CancellationToken,
    ) -> Result<CaptureOutcome> {
        let tuning = self.tuning.clone();
        tokio::task::spawn_blocking(move || record_blocking(&tuning, &stop, &cancel))
            .await
            .map_err(|e| Error::Audio(format!("capture task panicked: {e}")))?
    }
}

fn record_blocking(
    tuning: &EndpointTuning,
    stop: &CancellationToken,
    cancel: &CancellationToken,
) -> Result<CaptureOutcome> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .ok_or_else(|| Error::DeviceUnavailable("no suitable input config found".to_string()))?;

    let config = supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        "audio capture opened"
    );

    let buffer = Arc::new(Mutex::new(Vec::<f32>::new()));
    let writer = Arc::clone(&buffer);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = writer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream.play().map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    let started = Instant::now();
    let mut endpointer = Endpointer::new(tuning.clone());

    let outcome = loop {
        std::thread::sleep(POLL_INTERVAL);

        if cancel.is_cancelled() {
            tracing::debug!("capture cancelled, discarding buffer");
            break CaptureOutcome::Cancelled;
        }

        let chunk = buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default();
        let complete = endpointer.push(&chunk);

        if stop.is_cancelled() {
            tracing::debug!("capture stopped manually");
            break CaptureOutcome::Clip(endpointer.take_clip());
        }
        if complete {
            break CaptureOutcome::Clip(endpointer.take_clip());
        }
        if !endpointer.has_speech() && started.elapsed() >= tuning.no_speech_timeout {
            tracing::debug!("no speech within timeout");
            break CaptureOutcome::Clip(AudioClip::default());
        }
    };

    // releases the device
    drop(stream);
    tracing::debug!("audio capture closed");
    Ok(outcome)
}

/// Endpointing thresholds, converted from [`AudioConfig`] durations to
/// sample counts at [`SAMPLE_RATE`]
#[derive(Debug, Clone)]
pub(crate) struct EndpointTuning {
    energy_threshold: f32,
    silence_samples: usize,
    min_speech_samples: usize,
    max_utterance_samples: usize,
    no_speech_timeout: Duration,
}

impl EndpointTuning {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn from_config(audio: &AudioConfig) -> Self {
        let per_ms = SAMPLE_RATE as usize / 1000;
        Self {
            energy_threshold: audio.energy_threshold,
            silence_samples: audio.silence_timeout.as_millis() as usize * per_ms,
            min_speech_samples: audio.min_speech.as_millis() as usize * per_ms,
            max_utterance_samples: audio.max_utterance.as_millis() as usize * per_ms,
            no_speech_timeout: audio.no_speech_timeout,
        }
    }
}

/// Detects the end of one utterance in a stream of samples
#[derive(Debug)]
pub(crate) struct Endpointer {
    tuning: EndpointTuning,
    speech: Vec<f32>,
    started: bool,
    silence_run: usize,
}

impl Endpointer {
    pub(crate) fn new(tuning: EndpointTuning) -> Self {
        Self {
            tuning,
            speech: Vec::new(),
            started: false,
            silence_run: 0,
        }
    }

    /// Feed samples; returns true once the utterance is complete
    pub(crate) fn push(&mut self, samples: &[f32]) -> bool {
        if samples.is_empty() {
            return false;
        }

        let energy = rms(samples);
        let is_speech = energy > self.tuning.energy_threshold;

        if !self.started {
            if is_speech {
                self.started = true;
                self.speech.extend_from_slice(samples);
                self.silence_run = 0;
                tracing::trace!(energy, "speech onset");
            }
            return false;
        }

        self.speech.extend_from_slice(samples);
        if is_speech {
            self.silence_run = 0;
        } else {
            self.silence_run += samples.len();
        }

        if self.silence_run >= self.tuning.silence_samples {
            if self.speech.len().saturating_sub(self.silence_run) >= self.tuning.min_speech_samples
            {
                tracing::debug!(samples = self.speech.len(), "utterance complete");
                return true;
            }
            // false start: a blip shorter than min_speech followed by silence
            if self.silence_run >= self.tuning.silence_samples * 2 {
                tracing::trace!("discarding false start");
                self.reset();
            }
            return false;
        }

        if self.speech.len() >= self.tuning.max_utterance_samples {
            tracing::debug!(samples = self.speech.len(), "utterance hit length cap");
            return true;
        }

        false
    }

    /// Whether speech onset has been observed
    pub(crate) fn has_speech(&self) -> bool {
        self.started
    }

    /// Take the buffered utterance
    pub(crate) fn take_clip(&mut self) -> AudioClip {
        let samples = std::mem::take(&mut self.speech);
        self.started = false;
        self.silence_run = 0;
        AudioClip::new(samples, SAMPLE_RATE)
    }

    fn reset(&mut self) {
        self.speech.clear();
        self.started = false;
        self.silence_run = 0;
    }
}

/// Root-mean-square energy of a chunk
#[allow(clippy::cast_precision_loss)]
fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn tuning() -> EndpointTuning {
        EndpointTuning::from_config(&Config::default().audio)
    }

    fn tone(duration_secs: f32, amplitude: f32) -> Vec<f32> {
        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let n = (SAMPLE_RATE as f32 * duration_secs) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                amplitude * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
            })
            .collect()
    }

    fn silence(duration_secs: f32) -> Vec<f32> {
        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let n = (SAMPLE_RATE as f32 * duration_secs) as usize;
        vec![0.0; n]
    }

    #[test]
    fn test_silence_never_completes() {
        let mut ep = Endpointer::new(tuning());
        assert!(!ep.push(&silence(2.0)));
        assert!(!ep.has_speech());
    }

    #[test]
    fn test_speech_then_silence_completes() {
        let mut ep = Endpointer::new(tuning());
        assert!(!ep.push(&tone(0.5, 0.3)));
        assert!(ep.has_speech());
        assert!(ep.push(&silence(1.0)));

        let clip = ep.take_clip();
        assert!(!clip.is_empty());
        assert_eq!(clip.sample_rate, SAMPLE_RATE);
    }

    #[test]
    fn test_short_blip_is_discarded() {
        let mut ep = Endpointer::new(tuning());
        // 50ms blip is under the 300ms minimum
        assert!(!ep.push(&tone(0.05, 0.3)));
        assert!(!ep.push(&silence(0.8)));
        assert!(!ep.push(&silence(1.0)));
        assert!(!ep.has_speech());
    }

    #[test]
    fn test_max_utterance_cap() {
        let mut ep = Endpointer::new(tuning());
        let mut complete = false;
        for _ in 0..40 {
            if ep.push(&tone(1.0, 0.3)) {
                complete = true;
                break;
            }
        }
        assert!(complete);
    }

    #[test]
    fn test_samples_to_wav_header() {
        let wav = samples_to_wav(&tone(0.1, 0.5), SAMPLE_RATE).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }
}
