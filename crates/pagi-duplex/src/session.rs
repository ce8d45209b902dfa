//! Session orchestrator - the root of the turn-taking core
//!
//! Owns the session state machine and composes the hybrid VAD, utterance aggregator,
//! barge-in classifier and playback scheduler. Transport events, VAD signals and timer
//! ticks go in; commands come out through an outbox and everything notable lands in
//! the append-only event log.
//!
//! ```text
//!          speech start             utterance finalized          first audio
//!   Idle ───────────────▶ Listening ───────────────────▶ Processing ──────────▶ Speaking
//!    ▲                      ▲   │ ▲                           │                    │
//!    │                      │   │ └─── new speech ────────────┘                    │
//!    │                      │   └────────────── misfire rollback ─────────────────▶│
//!    │                      └──────────────────── barge-in executed ───────────────┤
//!    └─────────────── response complete + drained (user silent) ───────────────────┘
//! ```

use crate::barge_in::{BargeInClassifier, BargeInEvent, CancelReason, Classification};
use crate::clock::{as_ms, PlaybackClock};
use crate::config::{DuplexConfig, EchoSuppressionMode};
use crate::continuation::{ContinuationPredictor, ProsodyFeatures};
use crate::error::{DuplexError, DuplexResult};
use crate::events::{AudioEncoding, Command, CommandKind, EventKind, TransportEvent};
use crate::hybrid_vad::{HybridVad, SpeechEdge};
use crate::lexicon::Language;
use crate::playback::{
    AudioChunk, AudioFormat, PlaybackActivity, PlaybackRenderer, PlaybackScheduler, Restore,
};
use crate::telemetry::{AudioHistory, EventLog, TelemetryEvent};
use crate::utterance::{AggregatorOutcome, UtteranceAggregator};
use crate::vad::{VadSignal, VadSource};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Listening,
    Processing,
    Speaking,
}

/// A component's request to move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRequest {
    SpeechStarted,
    UtteranceFinalized,
    /// The listening window closed without any transcript.
    UtteranceDiscarded,
    FirstAudio,
    BargeInExecuted,
    MisfireRollback,
    ResponseComplete { user_speaking: bool },
    ConnectionDropped,
    Fatal,
}

impl SessionState {
    /// The state `request` leads to, or `None` if it is not valid from here.
    pub fn accept(self, request: TransitionRequest) -> Option<SessionState> {
        use SessionState::*;
        use TransitionRequest as R;
        match (self, request) {
            (_, R::ConnectionDropped | R::Fatal) => Some(Idle),
            (Idle | Processing, R::SpeechStarted) => Some(Listening),
            (Listening, R::UtteranceFinalized) => Some(Processing),
            (Listening, R::UtteranceDiscarded) => Some(Idle),
            (Processing, R::FirstAudio) => Some(Speaking),
            (Processing, R::ResponseComplete { .. }) => Some(Idle),
            (Speaking, R::BargeInExecuted) => Some(Listening),
            (Listening, R::MisfireRollback) => Some(Speaking),
            (Speaking, R::ResponseComplete { user_speaking }) => {
                Some(if user_speaking { Listening } else { Idle })
            }
            _ => None,
        }
    }
}

/// One full-duplex conversation.
pub struct Session {
    id: Uuid,
    config: Arc<DuplexConfig>,
    clock: Arc<dyn PlaybackClock>,
    state: SessionState,

    // Components
    vad: HybridVad,
    aggregator: UtteranceAggregator,
    classifier: BargeInClassifier,
    scheduler: PlaybackScheduler,

    // Turn bookkeeping
    language: Language,
    barge_in: Option<BargeInEvent>,
    /// Transcript heard during playback before any barge-in was confirmed.
    recent_fragment: Option<(String, Duration)>,
    user_speaking: bool,
    response_done: bool,
    echo_paused: bool,

    // Transport
    last_event_seq: Option<u64>,
    command_seq: u64,
    outbox: Vec<Command>,

    log: EventLog,
    last_now: Duration,
}

impl Session {
    pub fn new(
        config: Arc<DuplexConfig>,
        clock: Arc<dyn PlaybackClock>,
    ) -> DuplexResult<(Self, PlaybackRenderer)> {
        info!("🎭 Initializing duplex session");
        config.validate()?;

        let (scheduler, renderer) = PlaybackScheduler::new(config.playback.clone(), Arc::clone(&clock));
        let id = Uuid::new_v4();
        let session = Self {
            id,
            vad: HybridVad::new(config.vad.clone()),
            aggregator: UtteranceAggregator::new(ContinuationPredictor::new(config.continuation.clone())),
            classifier: BargeInClassifier::new(config.barge_in.clone()),
            scheduler,
            language: Language::from_tag(&config.barge_in.default_language),
            state: SessionState::Idle,
            barge_in: None,
            recent_fragment: None,
            user_speaking: false,
            response_done: false,
            echo_paused: false,
            last_event_seq: None,
            command_seq: 0,
            outbox: Vec::new(),
            log: EventLog::new(id),
            last_now: Duration::ZERO,
            config,
            clock,
        };

        info!("✅ Duplex session {} initialized", id);
        Ok((session, renderer))
    }

    /// Apply one inbound transport event.
    pub fn handle_event(&mut self, event: TransportEvent) -> DuplexResult<()> {
        let result = self.apply_event(event);
        self.guard(result)
    }

    /// Apply one VAD observation (local from the capture domain, or remote).
    pub fn on_vad_signal(&mut self, signal: VadSignal) -> DuplexResult<()> {
        let result = self.now().and_then(|now| self.apply_vad_signal(signal, now));
        self.guard(result)
    }

    /// Control tick: advance debounce, aggregation and barge-in timers.
    pub fn tick(&mut self) -> DuplexResult<()> {
        let result = self.now().and_then(|now| self.apply_tick(now));
        self.guard(result)
    }

    /// Playback stall check. Returns true if the schedule was reset.
    pub fn watchdog(&mut self) -> DuplexResult<bool> {
        let result = self.now().map(|now| {
            let reset = self.scheduler.watchdog(now);
            self.flush_notices(now);
            reset
        });
        self.guard(result)
    }

    /// Take every command produced so far, oldest first.
    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.outbox)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub fn audio_history(&self) -> AudioHistory {
        self.scheduler.history()
    }

    pub fn active_barge_in(&self) -> Option<&BargeInEvent> {
        self.barge_in.as_ref()
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn is_user_speaking(&self) -> bool {
        self.user_speaking
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn playback_activity(&self) -> PlaybackActivity {
        self.scheduler.activity()
    }

    pub fn config(&self) -> &DuplexConfig {
        &self.config
    }

    fn now(&mut self) -> DuplexResult<Duration> {
        let now = self.clock.now()?;
        self.last_now = now;
        Ok(now)
    }

    /// Fatal errors reset the session before propagating.
    fn guard<T>(&mut self, result: DuplexResult<T>) -> DuplexResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("❌ Fatal error, resetting session: {}", e);
                let at = self.last_now;
                self.reset(TransitionRequest::Fatal, e.to_string(), at);
            }
        }
        result
    }

    fn apply_event(&mut self, event: TransportEvent) -> DuplexResult<()> {
        let now = self.now()?;

        if let Some(last_seq) = self.last_event_seq {
            if event.seq <= last_seq {
                self.log.record(
                    now,
                    TelemetryEvent::TransportOutOfOrder {
                        seq: event.seq,
                        last_seq,
                    },
                );
                return Ok(());
            }
        }
        self.last_event_seq = Some(event.seq);

        match event.kind {
            EventKind::SpeechPartial { text, confidence } => {
                self.on_transcript(&text, confidence, false, None, now)
            }
            EventKind::SpeechFinal {
                text,
                confidence,
                prosody,
            } => self.on_transcript(&text, confidence, true, prosody, now),
            EventKind::AudioChunk {
                seq,
                bytes,
                sample_rate,
                encoding,
            } => self.on_audio(seq, &bytes, sample_rate, encoding, now)?,
            EventKind::PlaybackAck { seq } => self.scheduler.acknowledge(seq),
            EventKind::ConnectionDropped { reason } => {
                let reason = reason.unwrap_or_else(|| "connection dropped".to_string());
                warn!("🔌 Connection dropped: {}", reason);
                self.reset(TransitionRequest::ConnectionDropped, reason, now);
            }
            EventKind::VadRemote { probability } => {
                // Stamped on arrival so freshness is judged on the local clock.
                self.apply_vad_signal(VadSignal::remote(probability, now), now)?
            }
            EventKind::ResponseDone => {
                self.response_done = true;
                self.check_response_complete(now);
            }
            EventKind::SessionLanguage { tag } => {
                self.language = Language::from_tag(&tag);
                info!("🌐 Session language set to {} ({})", self.language.tag(), tag);
            }
        }

        self.flush_notices(now);
        Ok(())
    }

    fn apply_tick(&mut self, now: Duration) -> DuplexResult<()> {
        self.scheduler.reconcile();
        self.scheduler.poll_reorder(now);
        self.scheduler.pump();
        self.evaluate_vad(now);
        self.expire_barge_in(now);
        self.poll_aggregator(now);
        self.check_response_complete(now);
        self.flush_notices(now);
        Ok(())
    }

    // ---- VAD ---------------------------------------------------------------

    fn playback_context(&self) -> bool {
        self.state == SessionState::Speaking && (self.scheduler.is_playback_active() || self.echo_paused)
    }

    fn apply_vad_signal(&mut self, signal: VadSignal, now: Duration) -> DuplexResult<()> {
        let signal = signal.with_playback(self.playback_context());

        if signal.source == VadSource::Remote {
            self.check_misfire(&signal, now);
        }
        self.vad.push(signal);
        self.evaluate_vad(now);
        self.flush_notices(now);
        Ok(())
    }

    fn evaluate_vad(&mut self, now: Duration) {
        let playback_active = self.playback_context();
        let evaluation = self.vad.evaluate(now, playback_active);

        // Pause mode: silence the assistant on the first raw positive, undo it if the
        // debounce never confirms.
        if self.config.vad.echo_suppression == EchoSuppressionMode::Pause
            && self.state == SessionState::Speaking
            && self.barge_in.is_none()
        {
            if evaluation.decision.is_speech && !self.echo_paused && self.scheduler.pause() {
                self.echo_paused = true;
                self.push_command(CommandKind::PlaybackPause, now);
            } else if !evaluation.decision.is_speech && self.echo_paused && !self.vad.is_speaking() {
                self.release_echo_pause(now);
            }
        }

        match evaluation.edge {
            Some(SpeechEdge::Started { at, confidence }) => self.on_speech_started(at, confidence, now),
            Some(SpeechEdge::Ended { at, .. }) => self.on_speech_ended(at, now),
            None => {}
        }
    }

    fn release_echo_pause(&mut self, now: Duration) {
        self.echo_paused = false;
        if self.scheduler.resume(now) {
            self.push_command(CommandKind::PlaybackResume { from_seq: None }, now);
        }
    }

    fn on_speech_started(&mut self, at: Duration, confidence: f32, now: Duration) {
        self.user_speaking = true;
        match self.state {
            SessionState::Idle => {
                self.transition(TransitionRequest::SpeechStarted, now);
                self.aggregator.speech_started(at);
            }
            SessionState::Listening => {
                self.aggregator.speech_started(at);
            }
            SessionState::Processing => {
                self.supersede_response(now);
                self.aggregator.speech_started(at);
            }
            SessionState::Speaking => {
                if self.barge_in.as_ref().map(|b| b.is_open()).unwrap_or(false) {
                    return;
                }
                self.trigger_barge_in(at, confidence, now);
            }
        }
    }

    fn on_speech_ended(&mut self, at: Duration, now: Duration) {
        self.user_speaking = false;
        self.aggregator.speech_paused(at);

        // A soft barge that never turned into anything: carry on talking.
        if self.state == SessionState::Speaking
            && self.barge_in.as_ref().map(|b| b.is_soft_pending()).unwrap_or(false)
        {
            self.release_soft_barge(now);
        }
        if self.echo_paused {
            self.release_echo_pause(now);
        }
    }

    /// New user speech while a response is being prepared replaces that response.
    fn supersede_response(&mut self, now: Duration) {
        if self.transition(TransitionRequest::SpeechStarted, now) {
            self.push_command(CommandKind::ResponseCancel, now);
        }
    }

    // ---- Transcripts -------------------------------------------------------

    fn on_transcript(
        &mut self,
        text: &str,
        confidence: f32,
        is_final: bool,
        prosody: Option<ProsodyFeatures>,
        now: Duration,
    ) {
        match self.state {
            SessionState::Idle => {
                self.transition(TransitionRequest::SpeechStarted, now);
                self.aggregator.speech_started(now);
            }
            SessionState::Processing => {
                self.supersede_response(now);
                self.aggregator.speech_started(now);
            }
            SessionState::Listening => {}
            SessionState::Speaking => {
                if self.barge_in.as_ref().map(|b| b.is_open()).unwrap_or(false) {
                    self.reclassify_barge_in(text, now);
                } else {
                    debug!("Transcript during playback held for classification: {:?}", text);
                    self.recent_fragment = Some((text.to_string(), now));
                }
                return;
            }
        }

        if is_final {
            self.aggregator.append_segment(text, confidence, now, prosody);
        } else {
            self.aggregator.update_partial(text, now);
        }
    }

    // ---- Barge-in ----------------------------------------------------------

    fn trigger_barge_in(&mut self, at: Duration, confidence: f32, now: Duration) {
        let event = BargeInEvent::trigger(at, confidence);
        info!("⚡ Barge-in triggered (confidence {:.2})", confidence);
        self.log.record(
            now,
            TelemetryEvent::BargeInTriggered {
                id: event.id,
                confidence,
            },
        );
        let window = self.config.vad.freshness_window();
        let fragment = self
            .recent_fragment
            .take()
            .filter(|(_, heard)| *heard + window >= at)
            .map(|(text, _)| text);
        let label = self.classifier.classify(&event, fragment.as_deref(), self.language);
        self.barge_in = Some(event);
        self.act_on(label, fragment.as_deref(), now);
    }

    fn reclassify_barge_in(&mut self, text: &str, now: Duration) {
        let Some(event) = self.barge_in.as_ref() else {
            return;
        };
        let label = self.classifier.classify(event, Some(text), self.language);
        self.act_on(label, Some(text), now);
    }

    fn act_on(&mut self, label: Classification, fragment: Option<&str>, now: Duration) {
        let Some(event) = self.barge_in.as_mut() else {
            return;
        };
        let record = |id| TelemetryEvent::BargeInClassified {
            id,
            label,
            fragment: fragment.map(str::to_string),
        };

        // A paused soft barge only changes course on a backchannel or a hard barge.
        if event.is_soft_pending() && label != Classification::HardBarge {
            let id = event.id;
            self.log.record(now, record(id));
            if label == Classification::Backchannel {
                self.release_soft_barge(now);
            }
            return;
        }

        event.classify(label, fragment);
        let id = event.id;
        self.log.record(now, record(id));

        match label {
            Classification::Backchannel | Classification::Unclear => {
                self.cancel_barge_in(CancelReason::NoAction, now);
                if self.echo_paused {
                    self.release_echo_pause(now);
                }
            }
            Classification::SoftBarge => {
                // An echo pause already silenced playback.
                if self.scheduler.pause() {
                    self.push_command(CommandKind::PlaybackPause, now);
                }
                self.echo_paused = false;
                self.execute_barge_in(label, now);
            }
            Classification::HardBarge => self.execute_hard_barge(now),
        }
    }

    fn execute_barge_in(&mut self, label: Classification, now: Duration) {
        let window = self.config.barge_in.misfire_rollback();
        if let Some(event) = self.barge_in.as_mut() {
            event.execute(now, window);
            let id = event.id;
            self.log.record(now, TelemetryEvent::BargeInExecuted { id, label });
        }
    }

    fn execute_hard_barge(&mut self, now: Duration) {
        self.echo_paused = false;
        let outcome = self.scheduler.fade_out_and_clear();
        if outcome.faded {
            self.push_command(
                CommandKind::PlaybackFade {
                    duration_ms: self.config.playback.fade_ms,
                },
                now,
            );
        } else {
            self.push_command(CommandKind::PlaybackStop, now);
        }
        self.execute_barge_in(Classification::HardBarge, now);

        if self.transition(TransitionRequest::BargeInExecuted, now) {
            let (from, fragment) = match self.barge_in.as_ref() {
                Some(b) => (b.triggered_at, b.fragment.clone()),
                None => (now, None),
            };
            self.aggregator.speech_started(from);
            if let Some(text) = fragment {
                self.aggregator.update_partial(&text, now);
            }
        }
    }

    fn release_soft_barge(&mut self, now: Duration) {
        if let Some(event) = self.barge_in.as_mut() {
            if event.cancel(CancelReason::Resumed, now) {
                let id = event.id;
                self.log.record(
                    now,
                    TelemetryEvent::BargeInCancelled {
                        id,
                        reason: CancelReason::Resumed,
                    },
                );
            }
        }
        self.barge_in = None;
        if self.scheduler.resume(now) {
            self.push_command(CommandKind::PlaybackResume { from_seq: None }, now);
        }
    }

    fn cancel_barge_in(&mut self, reason: CancelReason, now: Duration) {
        if let Some(mut event) = self.barge_in.take() {
            if event.cancel(reason, now) {
                self.log.record(now, TelemetryEvent::BargeInCancelled { id: event.id, reason });
            }
        }
    }

    /// Remote detector disagrees inside the rollback window: the trigger was echo.
    fn check_misfire(&mut self, remote: &VadSignal, now: Duration) {
        let base = self.config.vad.speech_threshold;
        let Some(event) = self.barge_in.as_ref() else {
            return;
        };
        if !self.classifier.is_misfire(event, remote, base) {
            return;
        }
        let label = event.label;
        warn!("↩️ Barge-in misfire (remote VAD {:.2}), rolling back", remote.probability);
        self.cancel_barge_in(CancelReason::Misfire, now);
        self.user_speaking = false;
        self.vad.reset();

        match label {
            Some(Classification::HardBarge) => {
                if let Some(id) = self.aggregator.discard() {
                    self.log.record(now, TelemetryEvent::UtteranceDiscarded { id });
                }
                let restore = self.scheduler.restore(now);
                self.transition(TransitionRequest::MisfireRollback, now);
                match restore {
                    Restore::Replayed { from_seq, .. } => self.push_command(
                        CommandKind::PlaybackResume {
                            from_seq: Some(from_seq),
                        },
                        now,
                    ),
                    Restore::Resynthesize { from_seq } => {
                        self.push_command(CommandKind::ResponseResynthesize { from_seq }, now)
                    }
                    Restore::Nothing => self.push_command(CommandKind::PlaybackResume { from_seq: None }, now),
                }
            }
            _ => {
                if self.scheduler.resume(now) {
                    self.push_command(CommandKind::PlaybackResume { from_seq: None }, now);
                }
            }
        }
    }

    fn expire_barge_in(&mut self, now: Duration) {
        let Some(event) = self.barge_in.as_ref() else {
            return;
        };

        // Soft barge with the user still talking past the hold: a real interruption.
        if event.is_soft_pending()
            && self.user_speaking
            && now.saturating_sub(event.triggered_at) >= self.config.barge_in.soft_barge_hold()
        {
            info!("⚡ Soft barge-in held past {}ms, escalating", self.config.barge_in.soft_barge_hold_ms);
            let id = event.id;
            self.log.record(
                now,
                TelemetryEvent::BargeInClassified {
                    id,
                    label: Classification::HardBarge,
                    fragment: None,
                },
            );
            if let Some(event) = self.barge_in.as_mut() {
                event.classify(Classification::HardBarge, None);
            }
            self.execute_hard_barge(now);
            return;
        }

        if event.label == Some(Classification::HardBarge) && event.is_final(now) {
            debug!("🔒 Barge-in {} final", event.id);
            let cleared = self.scheduler.discard_stash();
            if cleared > 0 {
                debug!("Dropped {} stashed chunks", cleared);
            }
            self.barge_in = None;
            self.push_command(CommandKind::ResponseCancel, now);
        }
    }

    // ---- Utterances --------------------------------------------------------

    fn poll_aggregator(&mut self, now: Duration) {
        if self.state != SessionState::Listening {
            return;
        }
        // Hold off while a hard barge-in can still be rolled back.
        if self
            .barge_in
            .as_ref()
            .map(|b| b.in_rollback_window(now))
            .unwrap_or(false)
        {
            return;
        }

        match self.aggregator.poll(now, self.user_speaking) {
            AggregatorOutcome::Pending => {}
            AggregatorOutcome::Finalized(utterance) => {
                self.log.record(
                    now,
                    TelemetryEvent::UtteranceFinalized {
                        id: utterance.id,
                        segments: utterance.segments.len(),
                    },
                );
                self.push_command(
                    CommandKind::UtteranceCommit {
                        utterance_id: utterance.id,
                        text: utterance.text(),
                        segments: utterance.segments.len(),
                        confidence: utterance.mean_confidence(),
                    },
                    now,
                );
                self.transition(TransitionRequest::UtteranceFinalized, now);
            }
            AggregatorOutcome::Discarded { id } => {
                self.log.record(now, TelemetryEvent::UtteranceDiscarded { id });
                self.transition(TransitionRequest::UtteranceDiscarded, now);
            }
        }
    }

    // ---- Audio -------------------------------------------------------------

    fn on_audio(
        &mut self,
        seq: u64,
        bytes: &[u8],
        sample_rate: u32,
        encoding: AudioEncoding,
        now: Duration,
    ) -> DuplexResult<()> {
        let format = AudioFormat { sample_rate, encoding };
        let chunk = match AudioChunk::from_bytes(seq, bytes, format) {
            Ok(chunk) => chunk,
            Err(DuplexError::InvalidChunk(reason)) => {
                self.scheduler.note_discarded(seq);
                self.log.record(now, TelemetryEvent::ChunkRejected { seq, reason });
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match self.state {
            SessionState::Processing => {
                self.scheduler.begin_response();
                self.response_done = false;
                self.scheduler.enqueue(chunk)?;
                self.transition(TransitionRequest::FirstAudio, now);
            }
            SessionState::Speaking => self.scheduler.enqueue(chunk)?,
            SessionState::Listening
                if self
                    .barge_in
                    .as_ref()
                    .map(|b| b.in_rollback_window(now))
                    .unwrap_or(false) =>
            {
                self.scheduler.stash_chunk(chunk);
            }
            state => {
                self.scheduler.note_discarded(seq);
                self.log.record(now, TelemetryEvent::ChunkDiscarded { seq, state });
            }
        }
        Ok(())
    }

    fn check_response_complete(&mut self, now: Duration) {
        let complete = match self.state {
            SessionState::Speaking => {
                self.response_done && self.scheduler.is_drained() && self.barge_in.is_none()
            }
            SessionState::Processing => self.response_done && self.scheduler.is_drained(),
            _ => false,
        };
        if !complete {
            return;
        }
        let user_speaking = self.user_speaking;
        if self.transition(TransitionRequest::ResponseComplete { user_speaking }, now) {
            self.response_done = false;
            if self.state == SessionState::Listening {
                self.aggregator.speech_started(now);
            }
        }
    }

    // ---- Plumbing ----------------------------------------------------------

    fn transition(&mut self, request: TransitionRequest, now: Duration) -> bool {
        let from = self.state;
        match from.accept(request) {
            Some(to) => {
                if to != from {
                    self.state = to;
                    self.recent_fragment = None;
                    if to == SessionState::Processing {
                        self.response_done = false;
                    }
                    self.log.record(now, TelemetryEvent::StateTransition { from, to });
                    self.push_command(CommandKind::StateTransition { from, to }, now);
                }
                true
            }
            None => {
                self.log.record(
                    now,
                    TelemetryEvent::TransitionRejected {
                        from,
                        request: format!("{:?}", request),
                    },
                );
                false
            }
        }
    }

    fn push_command(&mut self, kind: CommandKind, now: Duration) {
        self.command_seq += 1;
        self.outbox.push(Command {
            seq: self.command_seq,
            ts_ms: as_ms(now),
            kind,
        });
    }

    fn flush_notices(&mut self, now: Duration) {
        for notice in self.scheduler.take_notices() {
            self.log.record(now, notice);
        }
    }

    /// Connection drop or fatal error: back to Idle with nothing in flight.
    fn reset(&mut self, request: TransitionRequest, reason: String, now: Duration) {
        self.cancel_barge_in(CancelReason::SessionReset, now);
        if let Some(id) = self.aggregator.discard() {
            self.log.record(now, TelemetryEvent::UtteranceDiscarded { id });
        }
        let had_audio = !self.scheduler.is_drained() || self.scheduler.has_stash();
        self.scheduler.reset();
        if had_audio {
            self.push_command(CommandKind::PlaybackStop, now);
        }
        self.vad.reset();
        self.recent_fragment = None;
        self.user_speaking = false;
        self.response_done = false;
        self.echo_paused = false;
        self.transition(request, now);
        self.flush_notices(now);
        self.log.record(now, TelemetryEvent::SessionReset { reason });
    }
}
