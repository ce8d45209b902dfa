//! Typed telemetry: the session's append-only event log and audio history counters.

use crate::barge_in::{CancelReason, Classification};
use crate::clock::as_ms;
use crate::session::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    QueueOverflow {
        dropped_seqs: Vec<u64>,
        dropped_ms: u64,
    },
    ScheduleReset {
        behind_ms: u64,
        rescheduled: usize,
    },
    SequenceGap {
        expected: u64,
        resumed_at: u64,
    },
    ChunkRejected {
        seq: u64,
        reason: String,
    },
    ChunkDiscarded {
        seq: u64,
        state: SessionState,
    },
    BargeInTriggered {
        id: Uuid,
        confidence: f32,
    },
    BargeInClassified {
        id: Uuid,
        label: Classification,
        fragment: Option<String>,
    },
    BargeInExecuted {
        id: Uuid,
        label: Classification,
    },
    BargeInCancelled {
        id: Uuid,
        reason: CancelReason,
    },
    StateTransition {
        from: SessionState,
        to: SessionState,
    },
    TransitionRejected {
        from: SessionState,
        request: String,
    },
    UtteranceFinalized {
        id: Uuid,
        segments: usize,
    },
    UtteranceDiscarded {
        id: Uuid,
    },
    TransportOutOfOrder {
        seq: u64,
        last_seq: u64,
    },
    SessionReset {
        reason: String,
    },
}

impl TelemetryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueOverflow { .. } => "queue_overflow",
            Self::ScheduleReset { .. } => "schedule_reset",
            Self::SequenceGap { .. } => "sequence_gap",
            Self::ChunkRejected { .. } => "chunk_rejected",
            Self::ChunkDiscarded { .. } => "chunk_discarded",
            Self::BargeInTriggered { .. } => "barge_in_triggered",
            Self::BargeInClassified { .. } => "barge_in_classified",
            Self::BargeInExecuted { .. } => "barge_in_executed",
            Self::BargeInCancelled { .. } => "barge_in_cancelled",
            Self::StateTransition { .. } => "state_transition",
            Self::TransitionRejected { .. } => "transition_rejected",
            Self::UtteranceFinalized { .. } => "utterance_finalized",
            Self::UtteranceDiscarded { .. } => "utterance_discarded",
            Self::TransportOutOfOrder { .. } => "transport_out_of_order",
            Self::SessionReset { .. } => "session_reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    /// Session clock position.
    pub at_ms: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TelemetryEvent,
}

/// Append-only log owned by the session. Readers get a shared slice.
#[derive(Debug, Clone)]
pub struct EventLog {
    session_id: Uuid,
    entries: Vec<LoggedEvent>,
}

impl EventLog {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            entries: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, at: Duration, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::QueueOverflow { dropped_seqs, dropped_ms } => {
                warn!("📦 Queue overflow: dropped {:?} ({}ms)", dropped_seqs, dropped_ms)
            }
            TelemetryEvent::ScheduleReset { behind_ms, rescheduled } => {
                warn!("⏱️ Schedule reset: {}ms behind, {} chunks rescheduled", behind_ms, rescheduled)
            }
            TelemetryEvent::SequenceGap { expected, resumed_at } => {
                warn!("🕳️ Sequence gap: expected {}, resumed at {}", expected, resumed_at)
            }
            TelemetryEvent::ChunkRejected { seq, reason } => warn!("🚫 Chunk {} rejected: {}", seq, reason),
            TelemetryEvent::TransportOutOfOrder { seq, last_seq } => {
                warn!("🔀 Transport event {} after {} ignored", seq, last_seq)
            }
            TelemetryEvent::StateTransition { from, to } => info!("🔄 {:?} → {:?}", from, to),
            TelemetryEvent::SessionReset { reason } => warn!("♻️ Session reset: {}", reason),
            other => debug!(session = %self.session_id, "📊 {}", other.kind()),
        }
        self.entries.push(LoggedEvent {
            at_ms: as_ms(at),
            recorded_at: Utc::now(),
            event,
        });
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn events(&self) -> &[LoggedEvent] {
        &self.entries
    }

    pub fn count(&self, kind: &str) -> usize {
        self.entries.iter().filter(|e| e.event.kind() == kind).count()
    }

    pub fn last_of(&self, kind: &str) -> Option<&LoggedEvent> {
        self.entries.iter().rev().find(|e| e.event.kind() == kind)
    }

    pub fn to_json_lines(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What happened to assistant audio over the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioHistory {
    pub received: u64,
    pub scheduled: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub discarded: u64,
    pub played: u64,
    pub replayed: u64,
    pub acked: u64,
    pub last_acked_seq: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_counts_by_kind() {
        let mut log = EventLog::new(Uuid::new_v4());
        log.record(
            Duration::from_millis(10),
            TelemetryEvent::QueueOverflow {
                dropped_seqs: vec![0, 1],
                dropped_ms: 600,
            },
        );
        log.record(
            Duration::from_millis(20),
            TelemetryEvent::StateTransition {
                from: SessionState::Idle,
                to: SessionState::Listening,
            },
        );
        assert_eq!(log.len(), 2);
        assert_eq!(log.count("queue_overflow"), 1);
        assert_eq!(log.count("schedule_reset"), 0);
        assert_eq!(log.last_of("state_transition").unwrap().at_ms, 20);
    }

    #[test]
    fn json_lines_are_tagged() {
        let mut log = EventLog::new(Uuid::new_v4());
        log.record(
            Duration::from_millis(5),
            TelemetryEvent::SessionReset {
                reason: "connection dropped".to_string(),
            },
        );
        let text = log.to_json_lines().unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["kind"], "session_reset");
        assert_eq!(value["at_ms"], 5);
    }
}
