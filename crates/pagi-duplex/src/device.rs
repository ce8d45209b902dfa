//! Real audio devices via cpal.
//!
//! The output callback drives the `PlaybackRenderer`, expanding mono to however many
//! channels the device has. The input callback downmixes microphone audio into an
//! SPSC ring; a dedicated thread owns the WebRTC detector (it is not `Send`) and
//! publishes local VAD signals from there.

use crate::clock::PlaybackClock;
use crate::config::LocalVadConfig;
use crate::error::{DuplexError, DuplexResult};
use crate::playback::{PlaybackActivity, PlaybackRenderer};
use crate::signal_channel::SignalSender;
use crate::vad::{LocalVad, LocalVadProducer};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use rtrb::RingBuffer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// One second of capture at 48kHz.
const CAPTURE_RING_SAMPLES: usize = 48_000;

/// Running output stream. Dropping it stops playback.
pub struct OutputDevice {
    _stream: Stream,
    channels: u16,
}

impl OutputDevice {
    /// Open the default output device at the renderer's sample rate.
    pub fn open(mut renderer: PlaybackRenderer, clock: Arc<dyn PlaybackClock>) -> DuplexResult<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| DuplexError::AudioDevice("No output device available".to_string()))?;
        info!(
            "🔊 Using output device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let channels = device.default_output_config()?.channels().max(1);
        let stream_config = StreamConfig {
            channels,
            sample_rate: SampleRate(renderer.sample_rate()),
            buffer_size: BufferSize::Default,
        };

        let mut mono: Vec<f32> = Vec::with_capacity(4096);
        let stream = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels as usize;
                if mono.len() < frames {
                    mono.resize(frames, 0.0);
                }
                let buf = &mut mono[..frames];
                match clock.now() {
                    Ok(hw_now) => renderer.render(buf, hw_now),
                    Err(_) => buf.fill(0.0),
                }
                for (frame, &sample) in data.chunks_mut(channels as usize).zip(buf.iter()) {
                    frame.fill(sample);
                }
            },
            move |err| {
                warn!("Output stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;

        info!("✅ Output stream started ({} channels)", channels);
        Ok(Self {
            _stream: stream,
            channels,
        })
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

/// Running capture stream plus the local VAD thread. Dropping it stops both.
pub struct InputDevice {
    _stream: Stream,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl InputDevice {
    pub fn open(
        config: LocalVadConfig,
        sender: SignalSender,
        clock: Arc<dyn PlaybackClock>,
        playback: PlaybackActivity,
    ) -> DuplexResult<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| DuplexError::AudioDevice("No input device available".to_string()))?;
        info!(
            "🎤 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let channels = device.default_input_config()?.channels().max(1);
        let stream_config = StreamConfig {
            channels,
            sample_rate: SampleRate(config.sample_rate),
            buffer_size: BufferSize::Default,
        };

        let (mut samples_tx, mut samples_rx) = RingBuffer::<f32>::new(CAPTURE_RING_SAMPLES);
        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels as usize) {
                    let mixed = frame.iter().sum::<f32>() / frame.len() as f32;
                    // Full ring: the VAD thread is behind, drop capture.
                    let _ = samples_tx.push(mixed);
                }
            },
            move |err| {
                warn!("Input stream error: {}", err);
            },
            None,
        )?;

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker = std::thread::Builder::new()
            .name("pagi-duplex-vad".to_string())
            .spawn(move || {
                let detector = match LocalVad::new(config) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("Local VAD unavailable: {}", e);
                        return;
                    }
                };
                let mut producer = LocalVadProducer::new(detector, sender, clock, playback);
                let mut batch = Vec::with_capacity(4096);
                while !worker_stop.load(Ordering::Acquire) {
                    batch.clear();
                    while let Ok(sample) = samples_rx.pop() {
                        batch.push(sample);
                        if batch.len() == batch.capacity() {
                            break;
                        }
                    }
                    if batch.is_empty() {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    if let Err(e) = producer.push_samples(&batch) {
                        warn!("Local VAD error: {}", e);
                        if e.is_fatal() {
                            break;
                        }
                    }
                }
            })?;

        stream.play()?;
        info!("✅ Capture stream and local VAD started");
        Ok(Self {
            _stream: stream,
            stop,
            worker: Some(worker),
        })
    }
}

impl Drop for InputDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::config::PlaybackConfig;
    use crate::playback::PlaybackScheduler;

    #[test]
    #[ignore = "requires an audio output device"]
    fn opens_default_output() {
        let clock: Arc<dyn PlaybackClock> = Arc::new(MonotonicClock::new());
        let (_scheduler, renderer) = PlaybackScheduler::new(PlaybackConfig::default(), Arc::clone(&clock));
        let device = OutputDevice::open(renderer, clock).unwrap();
        assert!(device.channels() >= 1);
    }
}
