//! Continuation predictor: will the user keep talking after this pause?
//!
//! Scores lexical cues in the trailing transcript and optional prosody, then stretches
//! the end-of-turn timeout between the base silence threshold and the aggregation window.

use crate::config::ContinuationConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CONJUNCTIONS: &[&str] = &[
    "and", "but", "or", "so", "because", "cause", "since", "although", "though", "while",
    "if", "unless", "then", "plus", "also", "y", "pero", "o", "porque", "et", "mais", "ou",
    "und", "aber", "oder", "weil", "e", "ma", "perché",
];

const FILLERS: &[&str] = &[
    "um", "uh", "umm", "uhh", "er", "erm", "hmm", "like", "well", "basically", "actually",
    "eh", "este", "pues", "bueno", "euh", "ben", "äh", "ähm", "ehm", "cioè", "tipo", "né",
];

const INCOMPLETE_ENDINGS: &[&str] = &[
    "the", "a", "an", "to", "of", "for", "with", "in", "on", "at", "from", "about", "into",
    "my", "your", "our", "their", "his", "her", "its", "this", "that", "these", "those",
    "is", "are", "was", "were", "be", "have", "has", "had", "will", "would", "could",
    "should", "can", "i", "we", "you", "they", "he", "she", "it", "what", "which", "who",
    "where", "when", "how", "el", "la", "los", "las", "un", "una", "de", "le", "les", "des",
    "der", "die", "das", "ein", "eine",
];

const CONJUNCTION_WEIGHT: f32 = 0.5;
const FILLER_WEIGHT: f32 = 0.4;
const INCOMPLETE_WEIGHT: f32 = 0.35;
const TRAILING_PAUSE_MARK_WEIGHT: f32 = 0.3;
const TERMINAL_PUNCTUATION_WEIGHT: f32 = -0.3;

/// Pre-extracted prosodic features of the last speech segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProsodyFeatures {
    /// Pitch slope over the final ~300ms; positive means rising.
    pub pitch_trend: f32,
    /// Energy slope over the final ~300ms; negative means trailing off.
    pub energy_trend: f32,
    /// Syllables per second.
    pub speaking_rate: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub should_wait: bool,
    /// How long silence may last before the turn ends.
    pub extended_timeout: Duration,
    /// Continuation likelihood in [0, 1].
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct ContinuationPredictor {
    config: ContinuationConfig,
}

impl ContinuationPredictor {
    pub fn new(config: ContinuationConfig) -> Self {
        Self { config }
    }

    /// Score how likely the user is to continue, from the transcript tail and prosody.
    pub fn score(&self, trailing: &str, prosody: Option<&ProsodyFeatures>) -> f32 {
        let mut score = lexical_score(trailing);

        if let Some(p) = prosody {
            if p.pitch_trend > 0.05 {
                score += 0.2;
            } else if p.pitch_trend < -0.1 {
                score -= 0.2;
            }
            if p.energy_trend < -0.3 {
                score -= 0.1;
            }
            if p.speaking_rate > 0.0 && p.speaking_rate < 2.5 {
                score += 0.1;
            }
        }

        score.clamp(0.0, 1.0)
    }

    /// Decide whether to keep waiting after `silence` of quiet.
    pub fn predict(&self, trailing: &str, silence: Duration, prosody: Option<&ProsodyFeatures>) -> Prediction {
        let base = self.config.base_silence();
        let max = self.config.max_aggregation_window();
        let score = self.score(trailing, prosody);

        let extended_timeout = if score >= self.config.continuation_threshold {
            let span = max.saturating_sub(base).as_secs_f32();
            (base + Duration::from_secs_f32(span * score)).clamp(base, max)
        } else {
            base
        };

        let should_wait = silence < max && silence < extended_timeout;
        Prediction {
            should_wait,
            extended_timeout,
            score,
        }
    }

    pub fn config(&self) -> &ContinuationConfig {
        &self.config
    }
}

fn lexical_score(trailing: &str) -> f32 {
    let trimmed = trailing.trim_end();
    if trimmed.is_empty() {
        return 0.0;
    }

    let mut score = 0.0;
    if trimmed.ends_with(',') || trimmed.ends_with("...") || trimmed.ends_with('…') || trimmed.ends_with('-') {
        score += TRAILING_PAUSE_MARK_WEIGHT;
    } else if trimmed.ends_with(['.', '!', '?', '。', '！', '？']) {
        score += TERMINAL_PUNCTUATION_WEIGHT;
    }

    let last_word = trimmed
        .split_whitespace()
        .last()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .unwrap_or_default();

    if CONJUNCTIONS.contains(&last_word.as_str()) {
        score += CONJUNCTION_WEIGHT;
    } else if FILLERS.contains(&last_word.as_str()) {
        score += FILLER_WEIGHT;
    } else if INCOMPLETE_ENDINGS.contains(&last_word.as_str()) {
        score += INCOMPLETE_WEIGHT;
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predictor() -> ContinuationPredictor {
        ContinuationPredictor::new(ContinuationConfig::default())
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn complete_sentence_uses_base_timeout() {
        let p = predictor().predict("Book me a table for two.", ms(500), None);
        assert_eq!(p.extended_timeout, ms(800));
        assert!(p.should_wait);

        let p = predictor().predict("Book me a table for two.", ms(850), None);
        assert!(!p.should_wait);
    }

    #[test]
    fn trailing_conjunction_extends_timeout() {
        let p = predictor().predict("I want the pasta and", ms(1200), None);
        assert!(p.score >= 0.5);
        assert!(p.extended_timeout > ms(800));
        assert!(p.extended_timeout <= ms(3000));
        assert!(p.should_wait);
    }

    #[test]
    fn filler_extends_timeout() {
        let p = predictor().predict("so I was thinking, um", ms(1000), None);
        assert!(p.should_wait);
    }

    #[test]
    fn silence_past_window_never_waits() {
        let p = predictor().predict("and, um, because", ms(3000), None);
        assert!(!p.should_wait);
        let p = predictor().predict("and, um, because", ms(10_000), None);
        assert!(!p.should_wait);
    }

    #[test]
    fn rising_pitch_pushes_score_up() {
        let rising = ProsodyFeatures {
            pitch_trend: 0.2,
            energy_trend: 0.0,
            speaking_rate: 4.0,
        };
        let falling = ProsodyFeatures {
            pitch_trend: -0.3,
            energy_trend: -0.5,
            speaking_rate: 4.0,
        };
        let with_rise = predictor().score("I was going to the", Some(&rising));
        let with_fall = predictor().score("I was going to the", Some(&falling));
        assert!(with_rise > with_fall);
    }

    #[test]
    fn score_stays_in_unit_range() {
        let slow = ProsodyFeatures {
            pitch_trend: 1.0,
            energy_trend: 0.0,
            speaking_rate: 1.0,
        };
        let s = predictor().score("well, and", Some(&slow));
        assert!((0.0..=1.0).contains(&s));
        assert_eq!(predictor().score("", None), 0.0);
    }

    #[test]
    fn timeout_respects_configured_window() {
        let predictor = ContinuationPredictor::new(ContinuationConfig {
            base_silence_ms: 500,
            max_aggregation_window_ms: 1000,
            continuation_threshold: 0.3,
        });
        let p = predictor.predict("and, um", ms(900), None);
        assert!(p.extended_timeout <= ms(1000));
        assert!(p.extended_timeout >= ms(500));
    }
}
