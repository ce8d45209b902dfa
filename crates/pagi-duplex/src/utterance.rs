//! Utterance aggregation: merges transcript segments split by short pauses into one
//! logical user turn.
//!
//! States: Empty → Accumulating → (finalized, emitted once) → Empty.
//! The deadline is recomputed from the last speech activity using the continuation
//! predictor, so "I want the pasta and..." waits longer than "Book it."

use crate::continuation::{ContinuationPredictor, Prediction, ProsodyFeatures};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// One final transcript segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    pub at: Duration,
    pub confidence: f32,
}

/// A logical user turn made of one or more segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub id: Uuid,
    pub segments: Vec<Segment>,
    pub opened_at: Duration,
    /// When the utterance finalizes if nothing else happens.
    pub deadline: Duration,
    pub finalized: bool,
}

impl Utterance {
    fn open(at: Duration, deadline: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            segments: Vec::new(),
            opened_at: at,
            deadline,
            finalized: false,
        }
    }

    /// Segment texts joined with single spaces.
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn mean_confidence(&self) -> f32 {
        if self.segments.is_empty() {
            return 0.0;
        }
        self.segments.iter().map(|s| s.confidence).sum::<f32>() / self.segments.len() as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Empty,
    Accumulating,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorOutcome {
    /// Still waiting for more speech (or nothing open).
    Pending,
    Finalized(Utterance),
    /// The window closed without any transcript.
    Discarded { id: Uuid },
}

#[derive(Debug)]
struct Open {
    utterance: Utterance,
    last_activity: Duration,
    partial: Option<String>,
    prosody: Option<ProsodyFeatures>,
}

#[derive(Debug)]
pub struct UtteranceAggregator {
    predictor: ContinuationPredictor,
    open: Option<Open>,
}

impl UtteranceAggregator {
    pub fn new(predictor: ContinuationPredictor) -> Self {
        Self { predictor, open: None }
    }

    pub fn state(&self) -> AggregatorState {
        if self.open.is_some() {
            AggregatorState::Accumulating
        } else {
            AggregatorState::Empty
        }
    }

    /// Speech began. Opens a new utterance if none is open and returns its id.
    pub fn speech_started(&mut self, at: Duration) -> Option<Uuid> {
        match self.open.as_mut() {
            Some(open) => {
                open.last_activity = open.last_activity.max(at);
                None
            }
            None => {
                let deadline = at + self.predictor.config().base_silence();
                let utterance = Utterance::open(at, deadline);
                let id = utterance.id;
                debug!("📝 Utterance {} opened", id);
                self.open = Some(Open {
                    utterance,
                    last_activity: at,
                    partial: None,
                    prosody: None,
                });
                Some(id)
            }
        }
    }

    /// Speech stopped at `at`; silence is measured from here.
    pub fn speech_paused(&mut self, at: Duration) {
        if let Some(open) = self.open.as_mut() {
            open.last_activity = open.last_activity.max(at);
        }
        self.refresh_deadline(at);
    }

    /// Replace the in-progress hypothesis for the current segment.
    pub fn update_partial(&mut self, text: &str, at: Duration) {
        if self.open.is_none() {
            self.speech_started(at);
        }
        if let Some(open) = self.open.as_mut() {
            open.partial = Some(text.to_string());
            open.last_activity = open.last_activity.max(at);
        }
    }

    /// Append a final segment, opening an utterance if needed.
    pub fn append_segment(
        &mut self,
        text: &str,
        confidence: f32,
        at: Duration,
        prosody: Option<ProsodyFeatures>,
    ) -> Uuid {
        if self.open.is_none() {
            self.speech_started(at);
        }
        let id = match self.open.as_mut() {
            Some(open) => {
                open.utterance.segments.push(Segment {
                    text: text.to_string(),
                    at,
                    confidence: confidence.clamp(0.0, 1.0),
                });
                open.partial = None;
                open.prosody = prosody.or(open.prosody);
                open.last_activity = open.last_activity.max(at);
                open.utterance.id
            }
            None => Uuid::nil(),
        };
        self.refresh_deadline(at);
        id
    }

    /// Advance the aggregation timer. While the user is speaking nothing finalizes.
    pub fn poll(&mut self, now: Duration, user_speaking: bool) -> AggregatorOutcome {
        let Some(open) = self.open.as_mut() else {
            return AggregatorOutcome::Pending;
        };

        if user_speaking {
            open.last_activity = open.last_activity.max(now);
            let prediction = Self::predict(&self.predictor, open, now);
            open.utterance.deadline = open.last_activity + prediction.extended_timeout;
            return AggregatorOutcome::Pending;
        }

        let prediction = Self::predict(&self.predictor, open, now);
        open.utterance.deadline = open.last_activity + prediction.extended_timeout;
        if prediction.should_wait && now < open.utterance.deadline {
            return AggregatorOutcome::Pending;
        }

        self.finalize()
    }

    fn predict(predictor: &ContinuationPredictor, open: &Open, now: Duration) -> Prediction {
        let trailing = open
            .partial
            .as_deref()
            .or_else(|| open.utterance.segments.last().map(|s| s.text.as_str()))
            .unwrap_or("");
        let silence = now.saturating_sub(open.last_activity);
        predictor.predict(trailing, silence, open.prosody.as_ref())
    }

    fn refresh_deadline(&mut self, now: Duration) {
        if let Some(open) = self.open.as_mut() {
            let prediction = Self::predict(&self.predictor, open, now);
            open.utterance.deadline = open.last_activity + prediction.extended_timeout;
        }
    }

    fn finalize(&mut self) -> AggregatorOutcome {
        let Some(mut open) = self.open.take() else {
            return AggregatorOutcome::Pending;
        };

        // A partial that never became final still counts as what the user said.
        if let Some(partial) = open.partial.take() {
            if !partial.trim().is_empty() {
                open.utterance.segments.push(Segment {
                    text: partial,
                    at: open.last_activity,
                    confidence: 0.0,
                });
            }
        }

        if open.utterance.segments.is_empty() {
            debug!("🗑️ Utterance {} closed without transcript", open.utterance.id);
            return AggregatorOutcome::Discarded { id: open.utterance.id };
        }

        open.utterance.finalized = true;
        info!(
            "✅ Utterance finalized: {} ({} segments)",
            open.utterance.text(),
            open.utterance.segments.len()
        );
        AggregatorOutcome::Finalized(open.utterance)
    }

    /// Drop the open utterance without emitting it.
    pub fn discard(&mut self) -> Option<Uuid> {
        self.open.take().map(|open| open.utterance.id)
    }

    pub fn current(&self) -> Option<&Utterance> {
        self.open.as_ref().map(|o| &o.utterance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContinuationConfig;

    fn aggregator() -> UtteranceAggregator {
        UtteranceAggregator::new(ContinuationPredictor::new(ContinuationConfig::default()))
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn opens_with_base_deadline() {
        let mut agg = aggregator();
        assert!(agg.speech_started(ms(100)).is_some());
        assert_eq!(agg.state(), AggregatorState::Accumulating);
        assert_eq!(agg.current().unwrap().deadline, ms(900));
        // Second start inside the same window does not open another
        assert!(agg.speech_started(ms(200)).is_none());
    }

    #[test]
    fn short_pause_merges_segments() {
        let mut agg = aggregator();
        agg.speech_started(ms(0));
        agg.append_segment("I want the pasta and", 0.9, ms(1000), None);
        agg.speech_paused(ms(1000));
        assert_eq!(agg.poll(ms(1500), false), AggregatorOutcome::Pending);

        agg.speech_started(ms(1600));
        agg.append_segment("a glass of wine.", 0.8, ms(2500), None);
        agg.speech_paused(ms(2500));
        assert_eq!(agg.poll(ms(3000), false), AggregatorOutcome::Pending);

        match agg.poll(ms(3400), false) {
            AggregatorOutcome::Finalized(u) => {
                assert_eq!(u.text(), "I want the pasta and a glass of wine.");
                assert!(u.finalized);
                assert_eq!(u.segments.len(), 2);
            }
            other => panic!("expected finalized, got {:?}", other),
        }
        assert_eq!(agg.state(), AggregatorState::Empty);
        assert_eq!(agg.poll(ms(5000), false), AggregatorOutcome::Pending);
    }

    #[test]
    fn complete_sentence_finalizes_at_base_silence() {
        let mut agg = aggregator();
        agg.speech_started(ms(0));
        agg.append_segment("Book it.", 0.95, ms(600), None);
        agg.speech_paused(ms(600));
        assert_eq!(agg.poll(ms(1300), false), AggregatorOutcome::Pending);
        assert!(matches!(agg.poll(ms(1400), false), AggregatorOutcome::Finalized(_)));
    }

    #[test]
    fn speaking_user_holds_window_open() {
        let mut agg = aggregator();
        agg.speech_started(ms(0));
        agg.append_segment("so", 0.9, ms(100), None);
        for t in (200..5000).step_by(100) {
            assert_eq!(agg.poll(ms(t), true), AggregatorOutcome::Pending);
        }
    }

    #[test]
    fn silence_past_max_window_always_finalizes() {
        let mut agg = aggregator();
        agg.speech_started(ms(0));
        agg.append_segment("and um, because", 0.9, ms(200), None);
        agg.speech_paused(ms(200));
        assert!(matches!(agg.poll(ms(3200), false), AggregatorOutcome::Finalized(_)));
    }

    #[test]
    fn empty_window_is_discarded() {
        let mut agg = aggregator();
        let id = agg.speech_started(ms(0)).unwrap();
        agg.speech_paused(ms(150));
        assert_eq!(agg.poll(ms(1000), false), AggregatorOutcome::Discarded { id });
    }

    #[test]
    fn partial_is_kept_when_final_never_arrives() {
        let mut agg = aggregator();
        agg.update_partial("turn off the lights.", ms(300));
        agg.speech_paused(ms(300));
        match agg.poll(ms(1200), false) {
            AggregatorOutcome::Finalized(u) => assert_eq!(u.text(), "turn off the lights."),
            other => panic!("expected finalized, got {:?}", other),
        }
    }

    #[test]
    fn speech_after_finalization_starts_new_utterance() {
        let mut agg = aggregator();
        agg.speech_started(ms(0));
        let first = agg.append_segment("Hello.", 0.9, ms(300), None);
        agg.speech_paused(ms(300));
        assert!(matches!(agg.poll(ms(1200), false), AggregatorOutcome::Finalized(_)));

        let second = agg.speech_started(ms(1300)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn discard_drops_open_utterance() {
        let mut agg = aggregator();
        let id = agg.speech_started(ms(0)).unwrap();
        assert_eq!(agg.discard(), Some(id));
        assert_eq!(agg.state(), AggregatorState::Empty);
        assert_eq!(agg.discard(), None);
    }
}
