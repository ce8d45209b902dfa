//! Duplex configuration: every threshold, window and switch the core consumes.
//!
//! One immutable `DuplexConfig` is built at startup and handed to each component
//! (usually behind an `Arc`). Nothing reads ambient global state after that.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | vad.freshness_window_ms | 300 | Signals older than this are excluded from the vote. |
//! | vad.speech_threshold | 0.5 | Fused probability needed for speech. |
//! | vad.playback_threshold_boost | 0.2 | Added to the threshold while assistant audio plays. |
//! | vad.min_speech_idle_ms / vad.min_speech_playback_ms | 150 / 200 | Speech-start debounce. |
//! | continuation.base_silence_ms | 800 | Silence that ends a turn without continuation cues. |
//! | continuation.max_aggregation_window_ms | 3000 | Absolute bound (1000-10000). |
//! | barge_in.min_confidence | 0.3 | Below this a barge-in is `unclear`. |
//! | barge_in.kill_switch | false | Treat every barge-in as hard. |
//! | barge_in.misfire_rollback_ms | 500 | Window in which an echo-triggered barge-in is undone. |
//! | playback.queue_ceiling_ms | 1000 | Max buffered, unplayed audio. |
//! | playback.watchdog_interval_ms | 500 | Stuck-schedule check period. |
//! | playback.fade_ms | 50 | Hard barge-in fade-out. |
//! | playback.reorder_wait_ms | 100 | Wait for a missing chunk before skipping it. |

use crate::error::{DuplexError, DuplexResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the VAD compensates for assistant audio leaking into the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoSuppressionMode {
    /// Raise the speech threshold while playback is active.
    #[default]
    ThresholdBoost,
    /// Pause playback on the first raw VAD-positive and wait for confirmation.
    Pause,
    /// No playback-specific compensation.
    None,
}

/// Device echo-cancellation quality as reported by the client capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoCancellationTier {
    Excellent,
    #[default]
    Good,
    Fair,
    Poor,
}

impl EchoCancellationTier {
    /// Extra speech threshold applied during playback.
    pub fn threshold_widening(&self) -> f32 {
        match self {
            Self::Excellent | Self::Good => 0.0,
            Self::Fair => 0.05,
            Self::Poor => 0.10,
        }
    }

    /// Extra speech-start debounce applied during playback.
    pub fn min_speech_widening(&self) -> Duration {
        match self {
            Self::Excellent | Self::Good => Duration::ZERO,
            Self::Fair => Duration::from_millis(50),
            Self::Poor => Duration::from_millis(100),
        }
    }
}

/// Local (on-device) detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalVadConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,
    /// Detection mode (0-3, where 3 is most aggressive)
    pub mode: u8,
}

impl Default for LocalVadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 3,
        }
    }
}

/// Hybrid VAD decider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub freshness_window_ms: u64,
    pub idle_local_weight: f32,
    pub idle_remote_weight: f32,
    pub playback_local_weight: f32,
    pub playback_remote_weight: f32,
    pub speech_threshold: f32,
    pub playback_threshold_boost: f32,
    pub min_speech_idle_ms: u64,
    pub min_speech_playback_ms: u64,
    /// Negative decisions needed to report speech end (default: 100ms)
    pub min_silence_ms: u64,
    pub echo_suppression: EchoSuppressionMode,
    pub echo_cancellation: EchoCancellationTier,
    /// Capacity of the latest-signal-wins channel from the capture domain.
    pub signal_channel_capacity: usize,
    pub local: LocalVadConfig,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            freshness_window_ms: 300,
            idle_local_weight: 0.6,
            idle_remote_weight: 0.4,
            playback_local_weight: 0.3,
            playback_remote_weight: 0.7,
            speech_threshold: 0.5,
            playback_threshold_boost: 0.2,
            min_speech_idle_ms: 150,
            min_speech_playback_ms: 200,
            min_silence_ms: 100,
            echo_suppression: EchoSuppressionMode::ThresholdBoost,
            echo_cancellation: EchoCancellationTier::Good,
            signal_channel_capacity: 64,
            local: LocalVadConfig::default(),
        }
    }
}

impl VadConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    pub fn min_silence(&self) -> Duration {
        Duration::from_millis(self.min_silence_ms)
    }
}

/// Continuation predictor and utterance aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    /// Silence that ends a turn when nothing suggests the user will continue (default: 800ms)
    pub base_silence_ms: u64,
    /// Absolute bound on how long an utterance waits for more speech (1000-10000ms)
    pub max_aggregation_window_ms: u64,
    /// Continuation score needed before the timeout is extended
    pub continuation_threshold: f32,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            base_silence_ms: 800,
            max_aggregation_window_ms: 3000,
            continuation_threshold: 0.3,
        }
    }
}

impl ContinuationConfig {
    pub fn base_silence(&self) -> Duration {
        Duration::from_millis(self.base_silence_ms)
    }

    pub fn max_aggregation_window(&self) -> Duration {
        Duration::from_millis(self.max_aggregation_window_ms)
    }
}

/// Barge-in classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    pub min_confidence: f32,
    /// Bypass classification: every VAD-positive during playback is a hard barge-in.
    pub kill_switch: bool,
    /// Fragments with at most this many words count as low-information.
    pub soft_barge_max_words: usize,
    pub misfire_rollback_ms: u64,
    /// How long a soft barge-in may stay paused while the user keeps talking.
    pub soft_barge_hold_ms: u64,
    /// BCP-47 tag used until the transport reports the session language.
    pub default_language: String,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            kill_switch: false,
            soft_barge_max_words: 3,
            misfire_rollback_ms: 500,
            soft_barge_hold_ms: 1000,
            default_language: "en".to_string(),
        }
    }
}

impl BargeInConfig {
    pub fn misfire_rollback(&self) -> Duration {
        Duration::from_millis(self.misfire_rollback_ms)
    }

    pub fn soft_barge_hold(&self) -> Duration {
        Duration::from_millis(self.soft_barge_hold_ms)
    }
}

/// Playback scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output sample rate; chunks in another rate are rejected.
    pub sample_rate: u32,
    pub queue_ceiling_ms: u64,
    pub target_lookahead_ms: u64,
    pub watchdog_interval_ms: u64,
    pub fade_ms: u64,
    /// Out-of-order chunks held while waiting for a missing sequence number.
    pub reorder_depth: usize,
    /// How long a missing sequence number is waited for before it is skipped.
    pub reorder_wait_ms: u64,
    /// Slots in the SPSC ring between the scheduler and the render callback.
    pub ring_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            queue_ceiling_ms: 1000,
            target_lookahead_ms: 50,
            watchdog_interval_ms: 500,
            fade_ms: 50,
            reorder_depth: 8,
            reorder_wait_ms: 100,
            ring_capacity: 256,
        }
    }
}

impl PlaybackConfig {
    pub fn queue_ceiling(&self) -> Duration {
        Duration::from_millis(self.queue_ceiling_ms)
    }

    pub fn target_lookahead(&self) -> Duration {
        Duration::from_millis(self.target_lookahead_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn reorder_wait(&self) -> Duration {
        Duration::from_millis(self.reorder_wait_ms)
    }

    pub fn fade(&self) -> Duration {
        Duration::from_millis(self.fade_ms)
    }

    /// Fade length in output frames.
    pub fn fade_frames(&self) -> u32 {
        (self.fade_ms * self.sample_rate as u64 / 1000) as u32
    }
}

/// Control-plane loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Period of the control tick that drains VAD signals and advances timers.
    pub control_tick_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { control_tick_ms: 10 }
    }
}

impl SessionConfig {
    pub fn control_tick(&self) -> Duration {
        Duration::from_millis(self.control_tick_ms)
    }
}

/// Complete configuration for one duplex session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplexConfig {
    pub vad: VadConfig,
    pub continuation: ContinuationConfig,
    pub barge_in: BargeInConfig,
    pub playback: PlaybackConfig,
    pub session: SessionConfig,
}

impl DuplexConfig {
    /// Load config from file and environment. Precedence: env `PAGI_DUPLEX_CONFIG` path >
    /// `config/duplex.toml` > defaults; `PAGI_DUPLEX__<SECTION>__<FIELD>` overrides either.
    pub fn load() -> DuplexResult<Self> {
        let config_path =
            std::env::var("PAGI_DUPLEX_CONFIG").unwrap_or_else(|_| "config/duplex.toml".to_string());
        let defaults = config::Config::try_from(&DuplexConfig::default())?;
        let builder = config::Config::builder().add_source(defaults);

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("PAGI_DUPLEX").separator("__"))
            .build()?;

        let loaded: DuplexConfig = built.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> DuplexResult<Self> {
        let parsed: DuplexConfig =
            toml::from_str(text).map_err(|e| DuplexError::Config(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject values the components cannot operate with.
    pub fn validate(&self) -> DuplexResult<()> {
        let unit = |name: &str, v: f32| -> DuplexResult<()> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(DuplexError::Config(format!("{} must be within 0.0-1.0, got {}", name, v)))
            }
        };
        unit("vad.idle_local_weight", self.vad.idle_local_weight)?;
        unit("vad.idle_remote_weight", self.vad.idle_remote_weight)?;
        unit("vad.playback_local_weight", self.vad.playback_local_weight)?;
        unit("vad.playback_remote_weight", self.vad.playback_remote_weight)?;
        unit("vad.speech_threshold", self.vad.speech_threshold)?;
        unit("vad.playback_threshold_boost", self.vad.playback_threshold_boost)?;
        unit("continuation.continuation_threshold", self.continuation.continuation_threshold)?;
        unit("barge_in.min_confidence", self.barge_in.min_confidence)?;

        if self.vad.idle_local_weight + self.vad.idle_remote_weight <= 0.0
            || self.vad.playback_local_weight + self.vad.playback_remote_weight <= 0.0
        {
            return Err(DuplexError::Config("VAD weights must not all be zero".to_string()));
        }
        if self.vad.freshness_window_ms == 0 {
            return Err(DuplexError::Config("vad.freshness_window_ms must be > 0".to_string()));
        }
        if self.vad.signal_channel_capacity == 0 {
            return Err(DuplexError::Config("vad.signal_channel_capacity must be > 0".to_string()));
        }

        let window = self.continuation.max_aggregation_window_ms;
        if !(1000..=10000).contains(&window) {
            return Err(DuplexError::Config(format!(
                "continuation.max_aggregation_window_ms must be 1000-10000, got {}",
                window
            )));
        }
        if self.continuation.base_silence_ms == 0 || self.continuation.base_silence_ms > window {
            return Err(DuplexError::Config(format!(
                "continuation.base_silence_ms must be within 1-{}, got {}",
                window, self.continuation.base_silence_ms
            )));
        }

        if self.playback.sample_rate == 0 {
            return Err(DuplexError::Config("playback.sample_rate must be > 0".to_string()));
        }
        if self.playback.queue_ceiling_ms == 0
            || self.playback.target_lookahead_ms == 0
            || self.playback.watchdog_interval_ms == 0
            || self.playback.fade_ms == 0
        {
            return Err(DuplexError::Config(
                "playback ceiling, lookahead, watchdog interval and fade must be > 0".to_string(),
            ));
        }
        if self.playback.ring_capacity == 0 {
            return Err(DuplexError::Config("playback.ring_capacity must be > 0".to_string()));
        }
        if self.session.control_tick_ms == 0 {
            return Err(DuplexError::Config("session.control_tick_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DuplexConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.vad.freshness_window_ms, 300);
        assert_eq!(config.playback.queue_ceiling_ms, 1000);
        assert_eq!(config.playback.fade_frames(), 1200);
        assert_eq!(config.continuation.base_silence(), Duration::from_millis(800));
    }

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let config = DuplexConfig::from_toml_str(
            r#"
            [vad]
            echo_suppression = "pause"
            echo_cancellation = "poor"

            [barge_in]
            kill_switch = true

            [playback]
            sample_rate = 16000
            "#,
        )
        .unwrap();
        assert_eq!(config.vad.echo_suppression, EchoSuppressionMode::Pause);
        assert_eq!(config.vad.echo_cancellation, EchoCancellationTier::Poor);
        assert!(config.barge_in.kill_switch);
        assert_eq!(config.playback.sample_rate, 16000);
        assert_eq!(config.playback.fade_ms, 50);
    }

    #[test]
    fn aggregation_window_bounds_enforced() {
        let mut config = DuplexConfig::default();
        config.continuation.max_aggregation_window_ms = 500;
        assert!(config.validate().is_err());
        config.continuation.max_aggregation_window_ms = 20_000;
        assert!(config.validate().is_err());
        config.continuation.max_aggregation_window_ms = 10_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn weights_out_of_range_rejected() {
        let mut config = DuplexConfig::default();
        config.vad.playback_remote_weight = 1.5;
        assert!(matches!(config.validate(), Err(DuplexError::Config(_))));
    }

    #[test]
    fn tier_widening() {
        assert_eq!(EchoCancellationTier::Excellent.threshold_widening(), 0.0);
        assert!(EchoCancellationTier::Poor.threshold_widening() > EchoCancellationTier::Fair.threshold_widening());
        assert_eq!(EchoCancellationTier::Poor.min_speech_widening(), Duration::from_millis(100));
    }
}
