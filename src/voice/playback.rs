//! Audio playback to speakers
//!
//! Playback is a scoped acquisition like capture: the cpal stream lives
//! only inside [`AudioPlayback::play`] on a blocking thread and is
//! dropped before the call returns. The cancellation token is polled
//! every 25ms, so barge-in halts output well within the sub-second
//! bound interactive interruption needs.

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

use super::AudioClip;

/// How often the playback loop checks for completion or cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Result of one playback call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The clip played to its end
    Finished,
    /// Output was halted by cancellation; unplayed audio was discarded
    Stopped,
}

/// Plays audio to the default output device
#[derive(Debug, Clone, Default)]
pub struct AudioPlayback;

impl AudioPlayback {
    /// Create a playback sink, probing that an output device exists
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] if no output device is present
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        host.default_output_device()
            .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;
        Ok(Self)
    }

    /// Play a clip to completion or until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] if the speaker cannot be opened
    pub async fn play(
        &self,
        clip: AudioClip,
        cancel: CancellationToken,
    ) -> Result<PlaybackOutcome> {
        if clip.is_empty() {
            return Ok(PlaybackOutcome::Finished);
        }
        tokio::task::spawn_blocking(move || play_blocking(&clip, &cancel))
            .await
            .map_err(|e| Error::Audio(format!("playback task panicked: {e}")))?
    }
}

fn play_blocking(clip: &AudioClip, cancel: &CancellationToken) -> Result<PlaybackOutcome> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

    let rate = clip.sample_rate;
    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(rate)
                && c.max_sample_rate() >= SampleRate(rate)
        })
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(rate)
                    && c.max_sample_rate() >= SampleRate(rate)
            })
        })
        .ok_or_else(|| Error::DeviceUnavailable("no suitable output config found".to_string()))?;

    let config = supported.with_sample_rate(SampleRate(rate)).config();
    let channels = config.channels as usize;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = rate,
        channels,
        "audio playback opened"
    );

    let samples = Arc::new(clip.samples.clone());
    let position = Arc::new(Mutex::new(0usize));
    let finished = Arc::new(Mutex::new(false));

    let cb_samples = Arc::clone(&samples);
    let cb_position = Arc::clone(&position);
    let cb_finished = Arc::clone(&finished);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut pos) = cb_position.lock() else { return };

                for frame in data.chunks_mut(channels) {
                    let sample = if *pos < cb_samples.len() {
                        let s = cb_samples[*pos];
                        *pos += 1;
                        s
                    } else {
                        if let Ok(mut done) = cb_finished.lock() {
                            *done = true;
                        }
                        0.0
                    };

                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream.play().map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    let duration_ms = (samples.len() as u64 * 1000) / u64::from(rate);
    let deadline = Instant::now() + Duration::from_millis(duration_ms + 500);

    let outcome = loop {
        std::thread::sleep(POLL_INTERVAL);

        if cancel.is_cancelled() {
            tracing::debug!("playback stopped");
            break PlaybackOutcome::Stopped;
        }
        if finished.lock().map(|done| *done).unwrap_or(true) {
            break PlaybackOutcome::Finished;
        }
        if Instant::now() > deadline {
            tracing::warn!("playback deadline exceeded");
            break PlaybackOutcome::Finished;
        }
    };

    // releases the device; unplayed audio is discarded
    drop(stream);
    tracing::debug!(?outcome, "audio playback closed");
    Ok(outcome)
}

/// Decode MP3 bytes to an [`AudioClip`]
///
/// Stereo input is averaged down to mono.
///
/// # Errors
///
/// Returns error if decoding fails
pub fn decode_mp3(mp3_data: &[u8]) -> Result<AudioClip> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if sample_rate == 0 {
                    sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                }

                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        (left + right) / 2.0
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Audio("MP3 contained no frames".to_string()));
    }

    Ok(AudioClip::new(samples, sample_rate))
}
