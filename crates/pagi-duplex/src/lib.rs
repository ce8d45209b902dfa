//! # PAGI Duplex - Full-Duplex Turn-Taking Core
//!
//! Decides when the user is speaking, when their turn is over, and what to do when
//! they talk over the assistant, while keeping assistant playback click-free and
//! sample-accurate against the hardware clock.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Session (control plane)                   │
//! │  ┌────────────┐   ┌─────────────────┐   ┌──────────────────────┐  │
//! │  │ Hybrid VAD │ → │ Utterance Aggr. │ → │   utterance.commit   │  │
//! │  │ local+remote│  │ + Continuation  │   └──────────────────────┘  │
//! │  └────────────┘   └─────────────────┘                             │
//! │        ↓ speech during playback                                   │
//! │  ┌────────────┐   ┌─────────────────┐      SPSC ring (rtrb)       │
//! │  │  Barge-in  │ → │    Playback     │ ═══════════════════════╗    │
//! │  │ Classifier │   │   Scheduler     │                        ║    │
//! │  └────────────┘   └─────────────────┘                        ║    │
//! └──────────────────────────────────────────────────────────────║────┘
//!          ▲ latest-wins VAD signals (crossbeam)                  ▼
//!   ┌─────────────┐                                   ┌──────────────────┐
//!   │  Local VAD  │ ← microphone                       │ PlaybackRenderer │ → speaker
//!   │ (WebRTC)    │                                   │ (audio callback)  │
//!   └─────────────┘                                   └──────────────────┘
//! ```
//!
//! Transport events come in through [`Session::handle_event`]; commands for the
//! transport come out of [`Session::take_commands`]. [`SessionRunner`] wires both to
//! tokio with the control tick and playback watchdog.

pub mod barge_in;
pub mod clock;
pub mod config;
pub mod continuation;
#[cfg(feature = "device")]
pub mod device;
pub mod error;
pub mod events;
pub mod hybrid_vad;
pub mod lexicon;
pub mod playback;
pub mod runner;
pub mod session;
pub mod signal_channel;
pub mod telemetry;
pub mod utterance;
pub mod vad;

pub use barge_in::{BargeInClassifier, BargeInEvent, BargeInPhase, CancelReason, Classification};
pub use clock::{ManualClock, MonotonicClock, PlaybackClock};
pub use crate::config::{
    BargeInConfig, ContinuationConfig, DuplexConfig, EchoCancellationTier, EchoSuppressionMode,
    LocalVadConfig, PlaybackConfig, SessionConfig, VadConfig,
};
pub use continuation::{ContinuationPredictor, Prediction, ProsodyFeatures};
#[cfg(feature = "device")]
pub use device::{InputDevice, OutputDevice};
pub use error::{DuplexError, DuplexResult};
pub use events::{AudioEncoding, Command, CommandKind, EventKind, TransportEvent};
pub use hybrid_vad::{HybridVad, SpeechEdge, VadDecision, VadEvaluation};
pub use lexicon::Language;
pub use playback::{
    AudioChunk, AudioFormat, FadeOutcome, PlaybackActivity, PlaybackMode, PlaybackRenderer,
    PlaybackScheduler, Restore,
};
pub use runner::{RunSummary, SessionRunner};
pub use session::{Session, SessionState, TransitionRequest};
pub use signal_channel::{signal_channel, SignalReceiver, SignalSender};
pub use telemetry::{AudioHistory, EventLog, LoggedEvent, TelemetryEvent};
pub use utterance::{AggregatorOutcome, AggregatorState, Segment, Utterance, UtteranceAggregator};
pub use vad::{LocalVad, LocalVadProducer, VadSignal, VadSource};
