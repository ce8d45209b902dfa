//! Hybrid VAD decider: fuses the local and remote speech probabilities.
//!
//! While the assistant is silent the fast local detector dominates (0.6 / 0.4).
//! During playback the local microphone also hears the assistant, so the weights
//! flip towards the remote detector (0.3 / 0.7) and the speech threshold is raised.
//! Sources older than the freshness window are left out of the vote entirely.
//!
//! ```text
//! local  ──┐   fresh?   ┌──────────────┐   raw    ┌──────────┐   edges
//!          ├──────────▶ │ weighted avg │ ───────▶ │ debounce │ ───────▶ Started / Ended
//! remote ──┘            └──────────────┘          └──────────┘
//! ```

use crate::config::{EchoSuppressionMode, VadConfig};
use crate::vad::{VadSignal, VadSource};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Signals remembered per source; the freshness window usually evicts earlier.
const MAX_SIGNALS_PER_SOURCE: usize = 32;

/// Outcome of one fusion step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    pub is_speech: bool,
    /// Weighted speech probability over the fresh sources.
    pub confidence: f32,
    /// Threshold the confidence was compared against.
    pub threshold: f32,
    pub used_local: bool,
    pub used_remote: bool,
}

impl VadDecision {
    fn silent(threshold: f32) -> Self {
        Self {
            is_speech: false,
            confidence: 0.0,
            threshold,
            used_local: false,
            used_remote: false,
        }
    }
}

fn is_fresh(config: &VadConfig, signal: &VadSignal, now: Duration) -> bool {
    now.saturating_sub(signal.timestamp) <= config.freshness_window()
}

/// Speech threshold in effect for the given playback state.
pub fn effective_threshold(config: &VadConfig, playback_active: bool) -> f32 {
    if !playback_active {
        return config.speech_threshold;
    }
    let threshold = match config.echo_suppression {
        EchoSuppressionMode::ThresholdBoost => {
            config.speech_threshold
                + config.playback_threshold_boost
                + config.echo_cancellation.threshold_widening()
        }
        EchoSuppressionMode::Pause => {
            config.speech_threshold + config.echo_cancellation.threshold_widening()
        }
        EchoSuppressionMode::None => config.speech_threshold,
    };
    threshold.min(0.95)
}

/// Minimum continuous speech before a speech start is reported.
pub fn min_speech_duration(config: &VadConfig, playback_active: bool) -> Duration {
    if !playback_active {
        return Duration::from_millis(config.min_speech_idle_ms);
    }
    let base = Duration::from_millis(config.min_speech_playback_ms);
    match config.echo_suppression {
        EchoSuppressionMode::None => base,
        _ => base + config.echo_cancellation.min_speech_widening(),
    }
}

/// Fuse the two sources. Stale or missing sources are excluded and the remaining
/// weights renormalised, so a lone fresh source is judged on its own probability.
pub fn decide(
    config: &VadConfig,
    local: Option<&VadSignal>,
    remote: Option<&VadSignal>,
    now: Duration,
    playback_active: bool,
) -> VadDecision {
    let threshold = effective_threshold(config, playback_active);
    let (local_weight, remote_weight) = if playback_active {
        (config.playback_local_weight, config.playback_remote_weight)
    } else {
        (config.idle_local_weight, config.idle_remote_weight)
    };

    let local = local.filter(|s| is_fresh(config, s, now));
    let remote = remote.filter(|s| is_fresh(config, s, now));

    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    if let Some(s) = local {
        weighted += local_weight * s.probability;
        total_weight += local_weight;
    }
    if let Some(s) = remote {
        weighted += remote_weight * s.probability;
        total_weight += remote_weight;
    }

    if total_weight <= f32::EPSILON {
        return VadDecision::silent(threshold);
    }

    let confidence = weighted / total_weight;
    VadDecision {
        is_speech: confidence >= threshold,
        confidence,
        threshold,
        used_local: local.is_some(),
        used_remote: remote.is_some(),
    }
}

/// Debounced speech boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeechEdge {
    /// Speech held for the minimum duration; `at` is when it began.
    Started { at: Duration, confidence: f32 },
    /// Speech fell away for the release period; `at` is when it stopped.
    Ended { at: Duration, duration: Duration },
}

#[derive(Debug, Clone, Copy)]
pub struct VadEvaluation {
    pub decision: VadDecision,
    pub edge: Option<SpeechEdge>,
}

/// Stateful decider: rolling per-source windows plus start/end debounce.
#[derive(Debug)]
pub struct HybridVad {
    config: VadConfig,
    local: VecDeque<VadSignal>,
    remote: VecDeque<VadSignal>,
    speaking: bool,
    candidate_since: Option<Duration>,
    candidate_peak: f32,
    silence_since: Option<Duration>,
    speech_started_at: Option<Duration>,
}

impl HybridVad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            local: VecDeque::with_capacity(MAX_SIGNALS_PER_SOURCE),
            remote: VecDeque::with_capacity(MAX_SIGNALS_PER_SOURCE),
            speaking: false,
            candidate_since: None,
            candidate_peak: 0.0,
            silence_since: None,
            speech_started_at: None,
        }
    }

    pub fn push(&mut self, signal: VadSignal) {
        let window = match signal.source {
            VadSource::Local => &mut self.local,
            VadSource::Remote => &mut self.remote,
        };
        if window.len() == MAX_SIGNALS_PER_SOURCE {
            window.pop_front();
        }
        // Keep each window ordered by timestamp so `back()` is the latest.
        match window.back() {
            Some(last) if last.timestamp > signal.timestamp => {
                let pos = window.partition_point(|s| s.timestamp <= signal.timestamp);
                window.insert(pos, signal);
            }
            _ => window.push_back(signal),
        }
    }

    /// Latest signal from a source that is still inside the freshness window.
    pub fn latest_fresh(&self, source: VadSource, now: Duration) -> Option<&VadSignal> {
        let window = match source {
            VadSource::Local => &self.local,
            VadSource::Remote => &self.remote,
        };
        window.back().filter(|s| is_fresh(&self.config, s, now))
    }

    /// Fold the current windows into a decision and advance the debounce.
    pub fn evaluate(&mut self, now: Duration, playback_active: bool) -> VadEvaluation {
        self.evict_stale(now);
        let decision = decide(
            &self.config,
            self.local.back(),
            self.remote.back(),
            now,
            playback_active,
        );
        let edge = self.debounce(&decision, now, playback_active);
        VadEvaluation { decision, edge }
    }

    fn evict_stale(&mut self, now: Duration) {
        let window = self.config.freshness_window();
        for queue in [&mut self.local, &mut self.remote] {
            while queue
                .front()
                .map(|s| now.saturating_sub(s.timestamp) > window)
                .unwrap_or(false)
            {
                queue.pop_front();
            }
        }
    }

    fn debounce(&mut self, decision: &VadDecision, now: Duration, playback_active: bool) -> Option<SpeechEdge> {
        if decision.is_speech {
            self.silence_since = None;
            if self.speaking {
                return None;
            }
            let since = *self.candidate_since.get_or_insert(now);
            self.candidate_peak = self.candidate_peak.max(decision.confidence);
            if now.saturating_sub(since) >= min_speech_duration(&self.config, playback_active) {
                self.speaking = true;
                self.speech_started_at = Some(since);
                self.candidate_since = None;
                let confidence = self.candidate_peak.max(decision.confidence);
                self.candidate_peak = 0.0;
                debug!("🎤 Speech start confirmed (confidence {:.2})", confidence);
                return Some(SpeechEdge::Started { at: since, confidence });
            }
            return None;
        }

        self.candidate_since = None;
        self.candidate_peak = 0.0;
        if !self.speaking {
            return None;
        }
        let since = *self.silence_since.get_or_insert(now);
        if now.saturating_sub(since) >= self.config.min_silence() {
            self.speaking = false;
            self.silence_since = None;
            let started = self.speech_started_at.take().unwrap_or(since);
            debug!("🤫 Speech end confirmed");
            return Some(SpeechEdge::Ended {
                at: since,
                duration: since.saturating_sub(started),
            });
        }
        None
    }

    /// Whether a debounced speech segment is in progress.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Forget every signal and any segment in progress.
    pub fn reset(&mut self) {
        self.local.clear();
        self.remote.clear();
        self.speaking = false;
        self.candidate_since = None;
        self.candidate_peak = 0.0;
        self.silence_since = None;
        self.speech_started_at = None;
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EchoCancellationTier;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn stale_local_excluded_during_playback() {
        // local at t=0, remote at t=350, decide at t=360 with a 300ms window
        let config = VadConfig::default();
        let local = VadSignal::local(0.1, ms(0));
        let remote = VadSignal::remote(0.8, ms(350));

        let d = decide(&config, Some(&local), Some(&remote), ms(360), true);
        assert!(!d.used_local);
        assert!(d.used_remote);
        assert!((d.confidence - 0.8).abs() < 1e-6);
        assert!((d.threshold - 0.7).abs() < 1e-6);
        assert!(d.is_speech);

        let weak = VadSignal::remote(0.65, ms(350));
        assert!(!decide(&config, Some(&local), Some(&weak), ms(360), true).is_speech);
    }

    #[test]
    fn idle_weights_favor_local() {
        let config = VadConfig::default();
        let local = VadSignal::local(1.0, ms(100));
        let remote = VadSignal::remote(0.0, ms(100));
        let d = decide(&config, Some(&local), Some(&remote), ms(120), false);
        assert!((d.confidence - 0.6).abs() < 1e-6);
        assert!(d.is_speech);

        // Same inputs during playback: 0.3 < 0.7
        let d = decide(&config, Some(&local), Some(&remote), ms(120), true);
        assert!((d.confidence - 0.3).abs() < 1e-6);
        assert!(!d.is_speech);
    }

    #[test]
    fn missing_sources_mean_no_speech() {
        let config = VadConfig::default();
        let d = decide(&config, None, None, ms(0), false);
        assert!(!d.is_speech);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn threshold_widens_with_poor_echo_cancellation() {
        let mut config = VadConfig::default();
        config.echo_cancellation = EchoCancellationTier::Poor;
        assert!((effective_threshold(&config, true) - 0.8).abs() < 1e-6);
        assert_eq!(effective_threshold(&config, false), 0.5);
        assert_eq!(min_speech_duration(&config, true), ms(300));

        config.echo_suppression = EchoSuppressionMode::None;
        assert_eq!(effective_threshold(&config, true), 0.5);
    }

    #[test]
    fn speech_start_is_debounced() {
        let mut vad = HybridVad::new(VadConfig::default());
        let mut started = None;
        for t in (0..=300).step_by(30) {
            vad.push(VadSignal::local(1.0, ms(t)));
            if let Some(edge) = vad.evaluate(ms(t), false).edge {
                started = Some((t, edge));
                break;
            }
        }
        let (t, edge) = started.expect("speech start");
        assert_eq!(t, 150);
        assert_eq!(edge, SpeechEdge::Started { at: ms(0), confidence: 1.0 });
        assert!(vad.is_speaking());
    }

    #[test]
    fn short_burst_never_reports_speech() {
        let mut vad = HybridVad::new(VadConfig::default());
        for t in [0u64, 30, 60, 90] {
            vad.push(VadSignal::local(1.0, ms(t)));
            assert!(vad.evaluate(ms(t), false).edge.is_none());
        }
        for t in [120u64, 150, 180, 210] {
            vad.push(VadSignal::local(0.0, ms(t)));
            assert!(vad.evaluate(ms(t), false).edge.is_none());
        }
        assert!(!vad.is_speaking());
    }

    #[test]
    fn playback_needs_longer_speech() {
        let mut vad = HybridVad::new(VadConfig::default());
        for t in (0..=180).step_by(30) {
            vad.push(VadSignal::remote(0.9, ms(t)));
            assert!(vad.evaluate(ms(t), true).edge.is_none(), "t={}", t);
        }
        vad.push(VadSignal::remote(0.9, ms(210)));
        assert!(matches!(vad.evaluate(ms(210), true).edge, Some(SpeechEdge::Started { .. })));
    }

    #[test]
    fn speech_end_after_release_period() {
        let mut vad = HybridVad::new(VadConfig::default());
        for t in (0..=150).step_by(30) {
            vad.push(VadSignal::local(1.0, ms(t)));
            vad.evaluate(ms(t), false);
        }
        assert!(vad.is_speaking());
        vad.push(VadSignal::local(0.0, ms(180)));
        assert!(vad.evaluate(ms(180), false).edge.is_none());
        vad.push(VadSignal::local(0.0, ms(280)));
        let edge = vad.evaluate(ms(280), false).edge;
        assert_eq!(edge, Some(SpeechEdge::Ended { at: ms(180), duration: ms(180) }));
    }

    #[test]
    fn signals_going_stale_end_speech() {
        let mut vad = HybridVad::new(VadConfig::default());
        for t in (0..=150).step_by(30) {
            vad.push(VadSignal::local(1.0, ms(t)));
            vad.evaluate(ms(t), false);
        }
        // No more signals: at t=460 the last one (t=150) is stale
        assert!(vad.evaluate(ms(460), false).edge.is_none());
        assert!(matches!(vad.evaluate(ms(560), false).edge, Some(SpeechEdge::Ended { .. })));
    }

    #[test]
    fn out_of_order_push_keeps_latest_last() {
        let mut vad = HybridVad::new(VadConfig::default());
        vad.push(VadSignal::remote(0.9, ms(100)));
        vad.push(VadSignal::remote(0.1, ms(50)));
        let latest = vad.latest_fresh(VadSource::Remote, ms(120)).unwrap();
        assert_eq!(latest.timestamp, ms(100));
    }
}
