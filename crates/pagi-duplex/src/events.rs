//! Field-level transport contract: inbound events and outbound commands.
//!
//! Framing and encoding stay with the transport; these are the decoded shapes.

use crate::config::DuplexConfig;
use crate::continuation::ProsodyFeatures;
use crate::error::DuplexResult;
use crate::session::SessionState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// PCM payload encoding of an `audio.chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    #[default]
    Pcm16Le,
    F32Le,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportEvent {
    /// Transport sequence number, increasing per session. On the wire this is
    /// `event_seq`; `seq` inside a payload is the audio chunk sequence.
    #[serde(rename = "event_seq")]
    pub seq: u64,
    pub ts_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "speech.partial")]
    SpeechPartial { text: String, confidence: f32 },
    #[serde(rename = "speech.final")]
    SpeechFinal {
        text: String,
        confidence: f32,
        #[serde(default)]
        prosody: Option<ProsodyFeatures>,
    },
    #[serde(rename = "audio.chunk")]
    AudioChunk {
        seq: u64,
        bytes: Vec<u8>,
        sample_rate: u32,
        #[serde(default)]
        encoding: AudioEncoding,
    },
    #[serde(rename = "playback.ack")]
    PlaybackAck { seq: u64 },
    #[serde(rename = "connection.dropped")]
    ConnectionDropped {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Server-side VAD probability.
    #[serde(rename = "vad.remote")]
    VadRemote { probability: f32 },
    /// The assistant response stream has no more chunks.
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "session.language")]
    SessionLanguage { tag: String },
}

impl TransportEvent {
    pub fn new(seq: u64, ts_ms: u64, kind: EventKind) -> Self {
        Self { seq, ts_ms, kind }
    }

    pub fn from_json(text: &str) -> DuplexResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Build an `audio.chunk` from f32 samples in the configured output format.
    pub fn audio_chunk(seq: u64, ts_ms: u64, chunk_seq: u64, samples: &[f32], config: &DuplexConfig) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(
            seq,
            ts_ms,
            EventKind::AudioChunk {
                seq: chunk_seq,
                bytes,
                sample_rate: config.playback.sample_rate,
                encoding: AudioEncoding::Pcm16Le,
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub seq: u64,
    pub ts_ms: u64,
    #[serde(flatten)]
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CommandKind {
    #[serde(rename = "playback.fade")]
    PlaybackFade { duration_ms: u64 },
    #[serde(rename = "playback.pause")]
    PlaybackPause,
    #[serde(rename = "playback.resume")]
    PlaybackResume {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_seq: Option<u64>,
    },
    #[serde(rename = "playback.stop")]
    PlaybackStop,
    #[serde(rename = "state.transition")]
    StateTransition { from: SessionState, to: SessionState },
    /// A finalized user turn, ready for response generation.
    #[serde(rename = "utterance.commit")]
    UtteranceCommit {
        utterance_id: Uuid,
        text: String,
        segments: usize,
        /// Mean ASR confidence over the committed segments.
        confidence: f32,
    },
    /// Abandon the response being generated.
    #[serde(rename = "response.cancel")]
    ResponseCancel,
    /// Audio from `from_seq` onward is gone and must be produced again.
    #[serde(rename = "response.resynthesize")]
    ResponseResynthesize { from_seq: u64 },
}

impl Command {
    pub fn to_json(&self) -> DuplexResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_events() {
        let event = TransportEvent::from_json(
            r#"{"event_seq":3,"ts_ms":120,"type":"speech.final","text":"hello","confidence":0.9}"#,
        )
        .unwrap();
        assert_eq!(event.seq, 3);
        assert!(matches!(event.kind, EventKind::SpeechFinal { prosody: None, .. }));

        let event = TransportEvent::from_json(
            r#"{"event_seq":4,"ts_ms":130,"type":"audio.chunk","seq":9,"bytes":[0,0],"sample_rate":24000}"#,
        )
        .unwrap();
        assert_eq!(event.seq, 4);
        match event.kind {
            EventKind::AudioChunk { seq, encoding, .. } => {
                assert_eq!(seq, 9);
                assert_eq!(encoding, AudioEncoding::Pcm16Le);
            }
            other => panic!("unexpected {:?}", other),
        }

        let event =
            TransportEvent::from_json(r#"{"event_seq":5,"ts_ms":140,"type":"connection.dropped"}"#).unwrap();
        assert_eq!(event.kind, EventKind::ConnectionDropped { reason: None });
    }

    #[test]
    fn commands_serialize_with_type_tag() {
        let cmd = Command {
            seq: 1,
            ts_ms: 250,
            kind: CommandKind::PlaybackFade { duration_ms: 50 },
        };
        let value: serde_json::Value = serde_json::from_str(&cmd.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "playback.fade");
        assert_eq!(value["duration_ms"], 50);

        let resume = Command {
            seq: 2,
            ts_ms: 300,
            kind: CommandKind::PlaybackResume { from_seq: None },
        };
        let value: serde_json::Value = serde_json::from_str(&resume.to_json().unwrap()).unwrap();
        assert!(value.get("from_seq").is_none());
    }

    #[test]
    fn audio_chunk_helper_encodes_pcm16() {
        let config = DuplexConfig::default();
        let event = TransportEvent::audio_chunk(1, 0, 7, &[0.0, 1.0], &config);
        match event.kind {
            EventKind::AudioChunk { seq, bytes, sample_rate, encoding } => {
                assert_eq!(seq, 7);
                assert_eq!(bytes, vec![0, 0, 0xff, 0x7f]);
                assert_eq!(sample_rate, 24000);
                assert_eq!(encoding, AudioEncoding::Pcm16Le);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
