//! Barge-in classification: what to do when the user speaks over the assistant.
//!
//! ```text
//! kill switch ─────────────▶ HardBarge
//! confidence < min ────────▶ Unclear      (no action)
//! backchannel lexicon ─────▶ Backchannel  (keep playing)
//! stop-intent keyword ─────▶ HardBarge    (fade + clear)
//! ≤ N words / no text ─────▶ SoftBarge    (pause, keep queue)
//! anything else ───────────▶ HardBarge
//! ```
//!
//! An executed barge-in stays revocable for the misfire rollback window: if the remote
//! detector disagrees inside the window the trigger was most likely echo.

use crate::config::BargeInConfig;
use crate::lexicon::{self, Language};
use crate::vad::{VadSignal, VadSource};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Backchannel,
    SoftBarge,
    HardBarge,
    Unclear,
}

impl Classification {
    /// Whether playback is interrupted (paused or faded) for this label.
    pub fn interrupts_playback(&self) -> bool {
        matches!(self, Self::SoftBarge | Self::HardBarge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BargeInPhase {
    Triggered,
    Classified,
    Executed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Backchannel or unclear: nothing was done.
    NoAction,
    /// Remote VAD disagreed inside the rollback window.
    Misfire,
    /// Soft barge released without a real interruption.
    Resumed,
    SessionReset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BargeInEvent {
    pub id: Uuid,
    pub phase: BargeInPhase,
    pub triggered_at: Duration,
    pub confidence: f32,
    pub fragment: Option<String>,
    pub label: Option<Classification>,
    pub action_at: Option<Duration>,
    pub rollback_deadline: Option<Duration>,
    pub cancel_reason: Option<CancelReason>,
}

impl BargeInEvent {
    pub fn trigger(at: Duration, confidence: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase: BargeInPhase::Triggered,
            triggered_at: at,
            confidence: confidence.clamp(0.0, 1.0),
            fragment: None,
            label: None,
            action_at: None,
            rollback_deadline: None,
            cancel_reason: None,
        }
    }

    /// Record a label. Reclassifying a pending soft barge is allowed; a cancelled
    /// event keeps its last label.
    pub fn classify(&mut self, label: Classification, fragment: Option<&str>) {
        if self.phase == BargeInPhase::Cancelled {
            return;
        }
        if let Some(text) = fragment {
            self.fragment = Some(text.to_string());
        }
        self.label = Some(label);
        if self.phase == BargeInPhase::Triggered {
            self.phase = BargeInPhase::Classified;
        }
    }

    /// Mark the action as performed; opens the rollback window.
    pub fn execute(&mut self, at: Duration, rollback_window: Duration) {
        if self.phase == BargeInPhase::Cancelled {
            return;
        }
        self.phase = BargeInPhase::Executed;
        self.action_at = Some(at);
        self.rollback_deadline = Some(at + rollback_window);
    }

    /// Cancel the event. Fails once an executed event is past its rollback deadline,
    /// except that a paused soft barge can always be released.
    pub fn cancel(&mut self, reason: CancelReason, now: Duration) -> bool {
        if self.phase == BargeInPhase::Cancelled {
            return false;
        }
        let releasing_soft = reason == CancelReason::Resumed && self.is_soft_pending();
        if self.is_final(now) && !releasing_soft {
            return false;
        }
        self.phase = BargeInPhase::Cancelled;
        self.cancel_reason = Some(reason);
        true
    }

    /// Executed as a soft barge and not yet resolved.
    pub fn is_soft_pending(&self) -> bool {
        self.phase == BargeInPhase::Executed && self.label == Some(Classification::SoftBarge)
    }

    /// Still open to reclassification by a transcript fragment.
    pub fn is_open(&self) -> bool {
        matches!(self.phase, BargeInPhase::Triggered | BargeInPhase::Classified) || self.is_soft_pending()
    }

    pub fn in_rollback_window(&self, now: Duration) -> bool {
        self.phase == BargeInPhase::Executed
            && self.rollback_deadline.map(|d| now <= d).unwrap_or(false)
    }

    /// Executed and past the rollback deadline, or cancelled.
    pub fn is_final(&self, now: Duration) -> bool {
        match self.phase {
            BargeInPhase::Cancelled => true,
            BargeInPhase::Executed => self.rollback_deadline.map(|d| now > d).unwrap_or(true),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BargeInClassifier {
    config: BargeInConfig,
}

impl BargeInClassifier {
    pub fn new(config: BargeInConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, event: &BargeInEvent, fragment: Option<&str>, language: Language) -> Classification {
        let label = self.rule(event.confidence, fragment.unwrap_or(""), language);
        debug!(
            "🏷️ Barge-in {} classified {:?} (confidence {:.2}, fragment {:?})",
            event.id, label, event.confidence, fragment
        );
        label
    }

    fn rule(&self, confidence: f32, fragment: &str, language: Language) -> Classification {
        if self.config.kill_switch {
            return Classification::HardBarge;
        }
        if confidence < self.config.min_confidence {
            return Classification::Unclear;
        }
        if lexicon::is_backchannel(fragment, language) {
            return Classification::Backchannel;
        }
        if lexicon::has_stop_intent(fragment, language) {
            return Classification::HardBarge;
        }
        if lexicon::word_count(fragment) <= self.config.soft_barge_max_words {
            return Classification::SoftBarge;
        }
        Classification::HardBarge
    }

    /// A remote signal below the base speech threshold inside the rollback window
    /// means the trigger was echo.
    pub fn is_misfire(&self, event: &BargeInEvent, remote: &VadSignal, base_threshold: f32) -> bool {
        if remote.source != VadSource::Remote || !event.in_rollback_window(remote.timestamp) {
            return false;
        }
        let interrupted = event.label.map(|l| l.interrupts_playback()).unwrap_or(false);
        interrupted && remote.timestamp >= event.triggered_at && remote.probability < base_threshold
    }

    pub fn config(&self) -> &BargeInConfig {
        &self.config
    }
}
