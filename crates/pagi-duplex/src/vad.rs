//! VAD signals and the local (on-device) detector.
//!
//! The local half of the hybrid decider wraps WebRTC VAD: low latency, but it hears
//! the assistant's own audio through the speaker. The remote half arrives over the
//! transport as `vad.remote` events. Both become `VadSignal`s.

use crate::clock::PlaybackClock;
use crate::config::LocalVadConfig;
use crate::error::{DuplexError, DuplexResult};
use crate::playback::PlaybackActivity;
use crate::signal_channel::SignalSender;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Which detector produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadSource {
    /// On-device detector (fast, echo-contaminated during playback).
    Local,
    /// Server-side detector (slower, higher accuracy).
    Remote,
}

/// One speech/no-speech observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VadSignal {
    pub source: VadSource,
    /// Speech probability, 0.0-1.0.
    pub probability: f32,
    /// Position on the session clock when the observation was made.
    pub timestamp: Duration,
    /// Whether assistant audio was playing when the observation was made.
    pub during_playback: bool,
}

impl VadSignal {
    pub fn new(source: VadSource, probability: f32, timestamp: Duration, during_playback: bool) -> Self {
        Self {
            source,
            probability: probability.clamp(0.0, 1.0),
            timestamp,
            during_playback,
        }
    }

    pub fn local(probability: f32, timestamp: Duration) -> Self {
        Self::new(VadSource::Local, probability, timestamp, false)
    }

    pub fn remote(probability: f32, timestamp: Duration) -> Self {
        Self::new(VadSource::Remote, probability, timestamp, false)
    }

    pub fn with_playback(mut self, during_playback: bool) -> Self {
        self.during_playback = during_playback;
        self
    }
}

fn vad_mode(mode: u8) -> VadMode {
    match mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

fn vad_sample_rate(rate: u32) -> DuplexResult<SampleRate> {
    match rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        _ => Err(DuplexError::VadInit(format!(
            "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
            rate
        ))),
    }
}

/// WebRTC VAD over fixed 30ms frames.
///
/// `Vad` holds a raw handle and is not `Send`; build the detector on the thread
/// that will feed it.
pub struct LocalVad {
    vad: Vad,
    config: LocalVadConfig,
    frame_size: usize,
    scratch: Vec<i16>,
}

impl LocalVad {
    pub fn new(config: LocalVadConfig) -> DuplexResult<Self> {
        info!(
            "🎙️ Initializing local VAD (sample_rate: {}Hz, mode: {})",
            config.sample_rate, config.mode
        );

        if config.mode > 3 {
            return Err(DuplexError::VadInit(format!("VAD mode must be 0-3, got {}", config.mode)));
        }
        let sample_rate = vad_sample_rate(config.sample_rate)?;

        // 30ms frames: 480 samples at 16kHz
        let frame_size = (config.sample_rate as usize * 30) / 1000;

        let mut vad = Vad::new();
        vad.set_mode(vad_mode(config.mode));
        vad.set_sample_rate(sample_rate);

        Ok(Self {
            vad,
            config,
            frame_size,
            scratch: Vec::with_capacity(frame_size),
        })
    }

    /// Classify one frame of exactly `frame_size()` samples. Returns 0.0 or 1.0.
    pub fn process_frame(&mut self, audio: &[f32]) -> DuplexResult<f32> {
        if audio.len() != self.frame_size {
            return Err(DuplexError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.frame_size,
                audio.len()
            )));
        }

        self.scratch.clear();
        self.scratch
            .extend(audio.iter().map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16));

        let is_speech = self
            .vad
            .is_voice_segment(&self.scratch)
            .map_err(|e| DuplexError::VadProcessing(format!("VAD processing failed: {:?}", e)))?;

        Ok(if is_speech { 1.0 } else { 0.0 })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Recreate the detector (WebRTC VAD has no explicit reset).
    pub fn reset(&mut self) -> DuplexResult<()> {
        let sample_rate = vad_sample_rate(self.config.sample_rate)?;
        self.vad = Vad::new();
        self.vad.set_mode(vad_mode(self.config.mode));
        self.vad.set_sample_rate(sample_rate);
        Ok(())
    }
}

/// Runs `LocalVad` on captured microphone samples and publishes signals.
///
/// Lives in or next to the capture callback: frames are assembled in a pre-sized
/// buffer and results go out through the latest-signal-wins channel.
pub struct LocalVadProducer {
    detector: LocalVad,
    sender: SignalSender,
    clock: Arc<dyn PlaybackClock>,
    playback: PlaybackActivity,
    pending: Vec<f32>,
}

impl LocalVadProducer {
    pub fn new(
        detector: LocalVad,
        sender: SignalSender,
        clock: Arc<dyn PlaybackClock>,
        playback: PlaybackActivity,
    ) -> Self {
        let frame_size = detector.frame_size();
        Self {
            detector,
            sender,
            clock,
            playback,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Feed raw capture samples. Returns the number of signals published.
    pub fn push_samples(&mut self, samples: &[f32]) -> DuplexResult<usize> {
        let frame_size = self.detector.frame_size();
        let mut published = 0;
        for &sample in samples {
            self.pending.push(sample);
            if self.pending.len() == frame_size {
                let probability = self.detector.process_frame(&self.pending)?;
                self.pending.clear();
                let signal = VadSignal::new(
                    VadSource::Local,
                    probability,
                    self.clock.now()?,
                    self.playback.is_active(),
                );
                if self.sender.send(signal) {
                    debug!("Local VAD backlog full, oldest signal overwritten");
                }
                published += 1;
            }
        }
        Ok(published)
    }
}
