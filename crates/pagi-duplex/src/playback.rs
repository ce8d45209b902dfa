//! Click-free, gapless scheduling of assistant audio onto the hardware clock.
//!
//! The scheduler is split across the two execution domains:
//!
//! ```text
//!   control plane                              audio callback
//! ┌────────────────────┐   rtrb SPSC (items)  ┌────────────────────┐
//! │ PlaybackScheduler  │ ───────────────────▶ │ PlaybackRenderer   │ ──▶ hardware
//! │  reorder, ceiling, │ ◀─────────────────── │  gain ramp, flush  │
//! │  watchdog, stash   │   rtrb SPSC (spent)  │  watermarks        │
//! └────────────────────┘                      └────────────────────┘
//!            └──────────── atomics (RenderShared) ────────┘
//! ```
//!
//! The renderer never locks or allocates. Commands reach it as atomics read at the
//! start of each callback; progress flows back the same way. Finished sample buffers
//! return through the spent ring so they are freed on the control plane.

use crate::clock::{as_ms, PlaybackClock};
use crate::config::PlaybackConfig;
use crate::error::{DuplexError, DuplexResult};
use crate::events::AudioEncoding;
use crate::telemetry::{AudioHistory, TelemetryEvent};
use rtrb::{Consumer, Producer, RingBuffer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
}

/// One unit of assistant audio, mono f32, immutable once built.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub seq: u64,
    pub samples: Arc<[f32]>,
    pub format: AudioFormat,
    /// Start on the hardware timeline; `None` until scheduled.
    pub scheduled_at: Option<Duration>,
}

impl AudioChunk {
    /// Decode a transport payload.
    pub fn from_bytes(seq: u64, bytes: &[u8], format: AudioFormat) -> DuplexResult<Self> {
        if format.sample_rate == 0 {
            return Err(DuplexError::InvalidChunk(format!("chunk {} has sample rate 0", seq)));
        }
        if seq == u64::MAX {
            return Err(DuplexError::InvalidChunk(format!("sequence number {} out of range", seq)));
        }
        let samples: Vec<f32> = match format.encoding {
            AudioEncoding::Pcm16Le => {
                if bytes.len() % 2 != 0 {
                    return Err(DuplexError::InvalidChunk(format!(
                        "chunk {}: {} bytes is not whole pcm16 samples",
                        seq,
                        bytes.len()
                    )));
                }
                bytes
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
                    .collect()
            }
            AudioEncoding::F32Le => {
                if bytes.len() % 4 != 0 {
                    return Err(DuplexError::InvalidChunk(format!(
                        "chunk {}: {} bytes is not whole f32 samples",
                        seq,
                        bytes.len()
                    )));
                }
                bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect()
            }
        };
        if samples.is_empty() {
            return Err(DuplexError::InvalidChunk(format!("chunk {} is empty", seq)));
        }
        Ok(Self::from_samples(seq, samples, format))
    }

    pub fn from_samples(seq: u64, samples: Vec<f32>, format: AudioFormat) -> Self {
        Self {
            seq,
            samples: samples.into(),
            format,
            scheduled_at: None,
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len()
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.samples.len() as u64, self.format.sample_rate)
    }
}

fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    Duration::from_nanos(frames * 1_000_000_000 / sample_rate.max(1) as u64)
}

/// Cross-domain control and progress words. Slot watermarks are 1-based; 0 means none.
#[derive(Debug, Default)]
pub(crate) struct RenderShared {
    paused: AtomicBool,
    flush_through: AtomicU64,
    fade_generation: AtomicU64,
    fade_frames: AtomicU32,
    fade_flush_through: AtomicU64,
    anchor_generation: AtomicU64,
    anchor_us: AtomicU64,
    played_through: AtomicU64,
    head_slot: AtomicU64,
    head_frames: AtomicU64,
    frames_rendered: AtomicU64,
    fades_completed: AtomicU64,
    active: AtomicBool,
}

/// Read-only view of whether assistant audio is audible, for the capture domain.
#[derive(Debug, Clone, Default)]
pub struct PlaybackActivity {
    shared: Option<Arc<RenderShared>>,
}

impl PlaybackActivity {
    /// A view that always reports silence (no scheduler attached).
    pub fn inactive() -> Self {
        Self { shared: None }
    }

    pub fn is_active(&self) -> bool {
        self.shared
            .as_ref()
            .map(|s| s.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

struct RenderItem {
    slot: u64,
    samples: Arc<[f32]>,
}

#[derive(Debug)]
struct Entry {
    slot: u64,
    chunk: AudioChunk,
    start: Duration,
    end: Duration,
    sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    Playing,
    Paused,
    Stopped,
}

/// Audio cleared by a hard barge-in, kept until the rollback window closes.
#[derive(Debug)]
struct Stash {
    /// Chunk that was playing (or next up) when the fade began.
    resume_seq: Option<u64>,
    chunks: VecDeque<AudioChunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restore {
    /// Stashed chunks were re-queued starting at `from_seq`.
    Replayed { from_seq: u64, count: usize },
    /// The resume chunk is gone; audio from `from_seq` must be synthesized again.
    Resynthesize { from_seq: u64 },
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FadeOutcome {
    /// False when the flush was immediate (already paused or nothing queued).
    pub faded: bool,
    pub stashed: usize,
}

/// Control-plane half of the playback scheduler.
pub struct PlaybackScheduler {
    config: PlaybackConfig,
    clock: Arc<dyn PlaybackClock>,
    shared: Arc<RenderShared>,
    items: Producer<RenderItem>,
    spent: Consumer<Arc<[f32]>>,
    entries: VecDeque<Entry>,
    reorder: BTreeMap<u64, AudioChunk>,
    gap_since: Option<Duration>,
    /// Next sequence number to schedule, shared by every response of the session.
    /// `None` until the first chunk fixes the baseline.
    expected_seq: Option<u64>,
    next_free: Duration,
    next_slot: u64,
    mode: PlaybackMode,
    stash: Option<Stash>,
    pending_fade: Option<u64>,
    history: AudioHistory,
    notices: Vec<TelemetryEvent>,
}

impl PlaybackScheduler {
    pub fn new(config: PlaybackConfig, clock: Arc<dyn PlaybackClock>) -> (Self, PlaybackRenderer) {
        info!(
            "🔊 Initializing playback scheduler ({}Hz, ceiling {}ms, lookahead {}ms)",
            config.sample_rate, config.queue_ceiling_ms, config.target_lookahead_ms
        );
        let capacity = config.ring_capacity.max(1);
        let (items_tx, items_rx) = RingBuffer::new(capacity);
        let (spent_tx, spent_rx) = RingBuffer::new(capacity * 2);
        let shared = Arc::new(RenderShared::default());

        let renderer = PlaybackRenderer {
            items: items_rx,
            spent: spent_tx,
            shared: Arc::clone(&shared),
            sample_rate: config.sample_rate.max(1) as u64,
            current: None,
            position: 0,
            waiting: true,
            flush_seen: 0,
            anchor_seen: 0,
            fade_seen: 0,
            fade_total: 0,
            fade_done: 0,
            fade_flush: 0,
            fading: false,
        };

        let scheduler = Self {
            config,
            clock,
            shared,
            items: items_tx,
            spent: spent_rx,
            entries: VecDeque::new(),
            reorder: BTreeMap::new(),
            gap_since: None,
            expected_seq: None,
            next_free: Duration::ZERO,
            next_slot: 1,
            mode: PlaybackMode::Playing,
            stash: None,
            pending_fade: None,
            history: AudioHistory::default(),
            notices: Vec::new(),
        };
        (scheduler, renderer)
    }

    /// Accept a chunk from the response stream. Rejections and overflow are
    /// reported through notices; only a clock failure is an error.
    pub fn enqueue(&mut self, chunk: AudioChunk) -> DuplexResult<()> {
        let now = self.clock.now()?;
        self.history.received += 1;
        self.reconcile();

        if chunk.format.sample_rate != self.config.sample_rate {
            let reason = format!(
                "sample rate {} does not match output rate {}",
                chunk.format.sample_rate, self.config.sample_rate
            );
            self.reject(chunk.seq, reason);
            return Ok(());
        }

        if chunk.seq.checked_add(1).is_none() {
            self.reject(chunk.seq, "sequence number out of range".to_string());
            return Ok(());
        }
        if self.reorder.contains_key(&chunk.seq) {
            self.reject(chunk.seq, "duplicate sequence number".to_string());
            return Ok(());
        }

        let Some(expected) = self.expected_seq else {
            self.hold_for_baseline(chunk, now);
            self.enforce_ceiling(now);
            self.pump();
            self.update_activity();
            return Ok(());
        };
        if chunk.seq < expected {
            self.reject(chunk.seq, "duplicate or late sequence number".to_string());
            return Ok(());
        }

        if chunk.seq == expected {
            self.schedule(chunk, now);
            self.drain_reorder(now);
        } else {
            debug!("🔀 Chunk {} held for reorder (expecting {})", chunk.seq, expected);
            self.reorder.insert(chunk.seq, chunk);
            self.gap_since.get_or_insert(now);
            if self.reorder.len() > self.config.reorder_depth {
                self.skip_gap(now);
            }
        }

        self.enforce_ceiling(now);
        self.pump();
        self.update_activity();
        Ok(())
    }

    /// No baseline yet: seq 0 starts playback at once, anything else waits out the
    /// reorder window in case lower numbers are still in flight.
    fn hold_for_baseline(&mut self, chunk: AudioChunk, now: Duration) {
        debug!("🔀 Chunk {} held until the sequence baseline is known", chunk.seq);
        self.reorder.insert(chunk.seq, chunk);
        self.gap_since.get_or_insert(now);
        if self.reorder.contains_key(&0) {
            self.expected_seq = Some(0);
            self.drain_reorder(now);
        } else if self.reorder.len() > self.config.reorder_depth {
            self.skip_gap(now);
        }
    }

    fn reject(&mut self, seq: u64, reason: String) {
        self.history.rejected += 1;
        self.notices.push(TelemetryEvent::ChunkRejected { seq, reason });
    }

    fn schedule(&mut self, mut chunk: AudioChunk, now: Duration) {
        let start = if self.entries.is_empty() {
            let start = now + self.config.target_lookahead();
            self.set_anchor(start);
            start
        } else {
            self.next_free
        };
        let end = start + chunk.duration();
        self.next_free = end;
        chunk.scheduled_at = Some(start);
        self.expected_seq = Some(chunk.seq.saturating_add(1));

        let slot = self.next_slot;
        self.next_slot += 1;
        self.history.scheduled += 1;
        self.entries.push_back(Entry {
            slot,
            chunk,
            start,
            end,
            sent: false,
        });
    }

    fn drain_reorder(&mut self, now: Duration) {
        while let Some(next) = self.expected_seq {
            match self.reorder.remove(&next) {
                Some(chunk) => self.schedule(chunk, now),
                None => break,
            }
        }
        if self.reorder.is_empty() {
            self.gap_since = None;
        }
    }

    /// Give up on the missing sequence numbers and continue from the oldest held chunk.
    fn skip_gap(&mut self, now: Duration) {
        let Some(&resumed_at) = self.reorder.keys().next() else {
            return;
        };
        match self.expected_seq {
            Some(expected) => self.notices.push(TelemetryEvent::SequenceGap { expected, resumed_at }),
            None => debug!("Sequence baseline fixed at {}", resumed_at),
        }
        self.expected_seq = Some(resumed_at);
        self.drain_reorder(now);
        if !self.reorder.is_empty() {
            self.gap_since = Some(now);
        }
    }

    fn enforce_ceiling(&mut self, now: Duration) {
        let ceiling = self.config.queue_ceiling();
        let mut dropped = Vec::new();
        let mut dropped_duration = Duration::ZERO;
        let mut first_start = None;
        let mut last_slot = 0;

        while self.queued_duration() > ceiling {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            first_start.get_or_insert(entry.start);
            last_slot = entry.slot;
            dropped_duration += entry.chunk.duration();
            dropped.push(entry.chunk.seq);
        }

        if dropped.is_empty() {
            return;
        }
        self.shared.flush_through.fetch_max(last_slot, Ordering::AcqRel);
        self.history.dropped += dropped.len() as u64;
        let restart = first_start
            .unwrap_or(now)
            .max(now + self.config.target_lookahead());
        self.reschedule_from(restart);
        self.notices.push(TelemetryEvent::QueueOverflow {
            dropped_seqs: dropped,
            dropped_ms: as_ms(dropped_duration),
        });
    }

    fn reschedule_from(&mut self, start: Duration) {
        self.set_anchor(start);
        let mut at = start;
        for entry in self.entries.iter_mut() {
            let duration = entry.chunk.duration();
            entry.start = at;
            entry.end = at + duration;
            entry.chunk.scheduled_at = Some(at);
            at = entry.end;
        }
        self.next_free = at;
    }

    fn set_anchor(&self, at: Duration) {
        self.shared.anchor_us.store(at.as_micros() as u64, Ordering::Release);
        self.shared.anchor_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Move scheduled entries into the render ring while it has room.
    pub fn pump(&mut self) -> usize {
        let mut pushed = 0;
        for entry in self.entries.iter_mut().filter(|e| !e.sent) {
            let item = RenderItem {
                slot: entry.slot,
                samples: Arc::clone(&entry.chunk.samples),
            };
            if self.items.push(item).is_err() {
                break;
            }
            entry.sent = true;
            pushed += 1;
        }
        pushed
    }

    /// Fold render progress back into the schedule and free spent buffers.
    pub fn reconcile(&mut self) {
        let played = self.shared.played_through.load(Ordering::Acquire);
        while self.entries.front().map(|e| e.slot <= played).unwrap_or(false) {
            self.entries.pop_front();
            self.history.played += 1;
        }
        while self.spent.pop().is_ok() {}

        if let Some(generation) = self.pending_fade {
            if self.shared.fades_completed.load(Ordering::Acquire) >= generation {
                debug!("🔉 Fade-out complete");
                self.pending_fade = None;
            }
        }
        self.update_activity();
    }

    /// Stop waiting for missing sequence numbers once the reorder window has passed.
    /// Returns true if held chunks were released.
    pub fn poll_reorder(&mut self, now: Duration) -> bool {
        let Some(since) = self.gap_since else {
            return false;
        };
        if now.saturating_sub(since) < self.config.reorder_wait() {
            return false;
        }
        self.skip_gap(now);
        self.enforce_ceiling(now);
        self.pump();
        self.update_activity();
        true
    }

    /// Periodic check for a stalled schedule. Returns true if it was reset.
    pub fn watchdog(&mut self, now: Duration) -> bool {
        self.reconcile();
        self.poll_reorder(now);

        if self.mode != PlaybackMode::Playing {
            return false;
        }
        let Some(head_end) = self.entries.front().map(|e| e.end) else {
            return false;
        };
        let tolerance = self.config.target_lookahead() * 2;
        if now <= head_end + tolerance {
            return false;
        }

        let behind = now.saturating_sub(head_end);
        let rescheduled = self.entries.len();
        self.reschedule_from(now + self.config.target_lookahead());
        self.notices.push(TelemetryEvent::ScheduleReset {
            behind_ms: as_ms(behind),
            rescheduled,
        });
        true
    }

    /// Silence output without touching the queue (soft barge-in).
    pub fn pause(&mut self) -> bool {
        if self.mode != PlaybackMode::Playing {
            return false;
        }
        self.shared.paused.store(true, Ordering::Release);
        self.mode = PlaybackMode::Paused;
        self.update_activity();
        debug!("⏸️ Playback paused ({} chunks held)", self.entries.len());
        true
    }

    /// Continue after a pause; the queue restarts at now + lookahead.
    pub fn resume(&mut self, now: Duration) -> bool {
        if self.mode != PlaybackMode::Paused {
            return false;
        }
        self.reschedule_from(now + self.config.target_lookahead());
        self.shared.paused.store(false, Ordering::Release);
        self.mode = PlaybackMode::Playing;
        self.update_activity();
        debug!("▶️ Playback resumed");
        true
    }

    /// Hard barge-in: ramp to silence over the fade length, then drop everything queued.
    /// Cleared chunks are stashed for a possible rollback.
    pub fn fade_out_and_clear(&mut self) -> FadeOutcome {
        self.reconcile();
        let resume_seq = self.entries.front().map(|e| e.chunk.seq);
        let last_slot = self
            .entries
            .back()
            .map(|e| e.slot)
            .unwrap_or(self.next_slot - 1);

        let mut chunks: VecDeque<AudioChunk> = self.entries.drain(..).map(|e| e.chunk).collect();
        chunks.extend(std::mem::take(&mut self.reorder).into_values());
        self.gap_since = None;
        let stashed = chunks.len();

        let faded = self.mode == PlaybackMode::Playing && stashed > 0;
        if faded {
            self.shared.fade_flush_through.store(last_slot, Ordering::Release);
            self.shared
                .fade_frames
                .store(self.config.fade_frames(), Ordering::Release);
            let generation = self.shared.fade_generation.fetch_add(1, Ordering::AcqRel) + 1;
            self.pending_fade = Some(generation);
        } else {
            self.shared.flush_through.fetch_max(last_slot, Ordering::AcqRel);
        }
        self.shared.paused.store(false, Ordering::Release);
        self.mode = PlaybackMode::Stopped;

        self.stash = Some(Stash { resume_seq, chunks });
        self.trim_stash();
        self.update_activity();
        info!(
            "🛑 Playback {} ({} chunks stashed)",
            if faded { "fading out" } else { "flushed" },
            stashed
        );
        FadeOutcome { faded, stashed }
    }

    /// Keep a chunk that arrived after a hard barge-in, in case it is rolled back.
    /// Returns false when there is no open stash (the chunk is discarded).
    pub fn stash_chunk(&mut self, chunk: AudioChunk) -> bool {
        if chunk.seq.checked_add(1).is_none() {
            self.reject(chunk.seq, "sequence number out of range".to_string());
            return false;
        }
        self.advance_expected(chunk.seq);
        let Some(stash) = self.stash.as_mut() else {
            self.history.discarded += 1;
            return false;
        };
        if stash.chunks.iter().any(|c| c.seq == chunk.seq) {
            self.reject(chunk.seq, "duplicate sequence number".to_string());
            return false;
        }
        let pos = stash.chunks.partition_point(|c| c.seq < chunk.seq);
        stash.chunks.insert(pos, chunk);
        self.trim_stash();
        true
    }

    fn trim_stash(&mut self) {
        let ceiling = self.config.queue_ceiling();
        let Some(stash) = self.stash.as_mut() else {
            return;
        };
        let mut total: Duration = stash.chunks.iter().map(|c| c.duration()).sum();
        while total > ceiling {
            match stash.chunks.pop_front() {
                Some(chunk) => {
                    total = total.saturating_sub(chunk.duration());
                    self.history.discarded += 1;
                }
                None => break,
            }
        }
    }

    /// A chunk the session chose not to play; keeps the sequence tracking in step.
    pub fn note_discarded(&mut self, seq: u64) {
        self.history.discarded += 1;
        self.advance_expected(seq);
    }

    fn advance_expected(&mut self, seq: u64) {
        let Some(after) = seq.checked_add(1) else {
            return;
        };
        let next = self.expected_seq.map_or(after, |e| e.max(after));
        self.expected_seq = Some(next);
        self.reorder.retain(|&k, _| k > seq);
        if self.reorder.is_empty() {
            self.gap_since = None;
        }
    }

    /// Undo a hard barge-in: replay from the stash, or ask for re-synthesis when the
    /// chunk that was playing is no longer buffered.
    pub fn restore(&mut self, now: Duration) -> Restore {
        let Some(stash) = self.stash.take() else {
            return Restore::Nothing;
        };
        self.shared.paused.store(false, Ordering::Release);
        self.mode = PlaybackMode::Playing;

        let from_seq = match (stash.resume_seq, stash.chunks.front()) {
            (Some(resume), Some(first)) if first.seq == resume => resume,
            (None, Some(first)) => first.seq,
            (Some(resume), _) => {
                self.history.discarded += stash.chunks.len() as u64;
                warn!("🔁 Resume chunk {} no longer buffered, requesting re-synthesis", resume);
                self.update_activity();
                return Restore::Resynthesize { from_seq: resume };
            }
            (None, None) => {
                self.update_activity();
                return Restore::Nothing;
            }
        };

        // Replay the contiguous run; anything past a gap goes back to waiting for it.
        let mut count = 0;
        let mut next = None;
        for mut chunk in stash.chunks {
            chunk.scheduled_at = None;
            if next.map_or(true, |n| n == chunk.seq) {
                next = Some(chunk.seq.saturating_add(1));
                self.schedule(chunk, now);
                count += 1;
            } else {
                self.reorder.insert(chunk.seq, chunk);
            }
        }
        if !self.reorder.is_empty() {
            self.gap_since = Some(now);
        }
        self.history.replayed += count as u64;
        self.enforce_ceiling(now);
        self.pump();
        self.update_activity();
        info!(
            "🔁 Replaying {} stashed chunks from {} ({} held for a gap)",
            count,
            from_seq,
            self.reorder.len()
        );
        Restore::Replayed { from_seq, count }
    }

    /// Rollback window closed: the stash can go.
    pub fn discard_stash(&mut self) -> usize {
        match self.stash.take() {
            Some(stash) => {
                self.history.discarded += stash.chunks.len() as u64;
                if let Some(last) = stash.chunks.back().map(|c| c.seq) {
                    self.advance_expected(last);
                }
                stash.chunks.len()
            }
            None => 0,
        }
    }

    pub fn has_stash(&self) -> bool {
        self.stash.is_some()
    }

    /// Drop everything immediately, no fade, no stash.
    pub fn stop(&mut self) {
        let last_slot = self
            .entries
            .back()
            .map(|e| e.slot)
            .unwrap_or(self.next_slot - 1);
        self.shared.flush_through.fetch_max(last_slot, Ordering::AcqRel);
        self.history.discarded += (self.entries.len() + self.reorder.len()) as u64;
        self.entries.clear();
        self.reorder.clear();
        self.gap_since = None;
        self.discard_stash();
        self.shared.paused.store(false, Ordering::Release);
        self.mode = PlaybackMode::Stopped;
        self.update_activity();
    }

    /// Full reset after a fatal error or connection drop.
    pub fn reset(&mut self) {
        self.stop();
        self.expected_seq = None;
        self.pending_fade = None;
    }

    /// Start accepting audio for a new response. Sequence numbering carries on from
    /// the previous one.
    pub fn begin_response(&mut self) {
        self.discard_stash();
        self.shared.paused.store(false, Ordering::Release);
        self.mode = PlaybackMode::Playing;
        self.update_activity();
    }

    /// Remote playout confirmation.
    pub fn acknowledge(&mut self, seq: u64) {
        self.history.acked += 1;
        self.history.last_acked_seq = Some(self.history.last_acked_seq.map_or(seq, |s| s.max(seq)));
    }

    fn update_activity(&self) {
        self.shared
            .active
            .store(self.is_playback_active(), Ordering::Release);
    }

    /// Assistant audio is queued and audible.
    pub fn is_playback_active(&self) -> bool {
        self.mode == PlaybackMode::Playing && !self.entries.is_empty()
    }

    /// Nothing left to play or fade.
    pub fn is_drained(&self) -> bool {
        self.entries.is_empty() && self.reorder.is_empty() && self.pending_fade.is_none()
    }

    pub fn is_fading(&self) -> bool {
        self.pending_fade.is_some()
    }

    /// Duration of audio not yet played, net of what the renderer has already
    /// consumed from the head chunk.
    pub fn queued_duration(&self) -> Duration {
        let total: Duration = self.entries.iter().map(|e| e.chunk.duration()).sum();
        total.saturating_sub(self.head_progress())
    }

    fn head_progress(&self) -> Duration {
        let Some(head) = self.entries.front() else {
            return Duration::ZERO;
        };
        if self.shared.head_slot.load(Ordering::Acquire) != head.slot {
            return Duration::ZERO;
        }
        let frames = self
            .shared
            .head_frames
            .load(Ordering::Acquire)
            .min(head.chunk.frames() as u64);
        frames_to_duration(frames, head.chunk.format.sample_rate)
    }

    /// Next sequence number the scheduler will play, once known.
    pub fn expected_seq(&self) -> Option<u64> {
        self.expected_seq
    }

    pub fn queued_len(&self) -> usize {
        self.entries.len()
    }

    /// Sequence numbers currently scheduled, oldest first.
    pub fn queued_seqs(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.chunk.seq).collect()
    }

    /// Scheduled (start, end) of each queued chunk.
    pub fn schedule_windows(&self) -> Vec<(u64, Duration, Duration)> {
        self.entries.iter().map(|e| (e.chunk.seq, e.start, e.end)).collect()
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn history(&self) -> AudioHistory {
        self.history
    }

    pub fn take_notices(&mut self) -> Vec<TelemetryEvent> {
        std::mem::take(&mut self.notices)
    }

    pub fn activity(&self) -> PlaybackActivity {
        PlaybackActivity {
            shared: Some(Arc::clone(&self.shared)),
        }
    }

    pub fn frames_rendered(&self) -> u64 {
        self.shared.frames_rendered.load(Ordering::Acquire)
    }

    pub fn fades_completed(&self) -> u64 {
        self.shared.fades_completed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }
}

/// Audio-callback half. Owned by whatever drives the output device.
pub struct PlaybackRenderer {
    items: Consumer<RenderItem>,
    spent: Producer<Arc<[f32]>>,
    shared: Arc<RenderShared>,
    sample_rate: u64,
    current: Option<RenderItem>,
    position: usize,
    /// Hold output until the anchor (after an underrun, pause or reschedule).
    waiting: bool,
    flush_seen: u64,
    anchor_seen: u64,
    fade_seen: u64,
    fade_total: u32,
    fade_done: u32,
    fade_flush: u64,
    fading: bool,
}

impl PlaybackRenderer {
    /// Fill `out` with mono samples; `hw_now` is the hardware time of `out[0]`.
    pub fn render(&mut self, out: &mut [f32], hw_now: Duration) {
        let flush = self.shared.flush_through.load(Ordering::Acquire);
        self.apply_flush(flush);

        let anchor_generation = self.shared.anchor_generation.load(Ordering::Acquire);
        if anchor_generation != self.anchor_seen {
            self.anchor_seen = anchor_generation;
            self.waiting = true;
        }

        let fade_generation = self.shared.fade_generation.load(Ordering::Acquire);
        if fade_generation != self.fade_seen {
            self.fade_seen = fade_generation;
            self.fade_total = self.shared.fade_frames.load(Ordering::Acquire);
            self.fade_flush = self.shared.fade_flush_through.load(Ordering::Acquire);
            self.fade_done = 0;
            self.fading = true;
            if self.fade_total == 0 {
                self.finish_fade();
            }
        }

        if self.shared.paused.load(Ordering::Acquire) {
            out.fill(0.0);
            self.waiting = true;
            self.shared
                .frames_rendered
                .fetch_add(out.len() as u64, Ordering::Release);
            return;
        }

        let anchor = self.shared.anchor_us.load(Ordering::Acquire);
        let start_us = hw_now.as_micros() as u64;
        for (i, frame) in out.iter_mut().enumerate() {
            let t = start_us + (i as u64 * 1_000_000) / self.sample_rate;
            let sample = self.next_sample(t, anchor);
            let gain = if self.fading {
                self.fade_done += 1;
                1.0 - self.fade_done as f32 / self.fade_total as f32
            } else {
                1.0
            };
            *frame = sample * gain;
            if self.fading && self.fade_done >= self.fade_total {
                self.finish_fade();
            }
        }

        let (slot, frames) = self
            .current
            .as_ref()
            .map_or((0, 0), |item| (item.slot, self.position as u64));
        self.shared.head_frames.store(frames, Ordering::Release);
        self.shared.head_slot.store(slot, Ordering::Release);

        self.shared
            .frames_rendered
            .fetch_add(out.len() as u64, Ordering::Release);
    }

    fn next_sample(&mut self, t: u64, anchor: u64) -> f32 {
        loop {
            if self.current.is_none() {
                let head_slot = match self.items.peek() {
                    Ok(item) => item.slot,
                    Err(_) => {
                        self.waiting = true;
                        return 0.0;
                    }
                };
                if head_slot <= self.flush_seen {
                    if let Ok(item) = self.items.pop() {
                        self.release(item);
                    }
                    continue;
                }
                if self.waiting && t < anchor {
                    return 0.0;
                }
                match self.items.pop() {
                    Ok(item) => {
                        self.current = Some(item);
                        self.position = 0;
                    }
                    Err(_) => return 0.0,
                }
            }

            if self.waiting {
                if t < anchor {
                    return 0.0;
                }
                self.waiting = false;
            }

            let Some(item) = self.current.as_ref() else {
                return 0.0;
            };
            if self.position >= item.samples.len() {
                self.finish_current();
                continue;
            }
            let sample = item.samples[self.position];
            self.position += 1;
            if self.position == item.samples.len() {
                self.finish_current();
            }
            return sample;
        }
    }

    fn finish_current(&mut self) {
        if let Some(item) = self.current.take() {
            self.shared.played_through.fetch_max(item.slot, Ordering::AcqRel);
            self.release(item);
        }
        self.position = 0;
    }

    fn apply_flush(&mut self, watermark: u64) {
        if watermark <= self.flush_seen {
            return;
        }
        self.flush_seen = watermark;
        if self.current.as_ref().map(|c| c.slot <= watermark).unwrap_or(false) {
            if let Some(item) = self.current.take() {
                self.release(item);
            }
            self.position = 0;
        }
    }

    fn finish_fade(&mut self) {
        self.fading = false;
        self.shared.flush_through.fetch_max(self.fade_flush, Ordering::AcqRel);
        self.apply_flush(self.fade_flush);
        self.shared.fades_completed.fetch_add(1, Ordering::Release);
    }

    fn release(&mut self, item: RenderItem) {
        // A full spent ring means the control plane has stalled; the buffer is then
        // freed here.
        let _ = self.spent.push(item.samples);
    }

    /// No chunk in progress and nothing waiting in the ring.
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.items.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const RATE: u32 = 24000;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn format() -> AudioFormat {
        AudioFormat {
            sample_rate: RATE,
            encoding: AudioEncoding::F32Le,
        }
    }

    fn chunk(seq: u64, millis: u64, value: f32) -> AudioChunk {
        let frames = (RATE as u64 * millis / 1000) as usize;
        AudioChunk::from_samples(seq, vec![value; frames], format())
    }

    fn setup() -> (PlaybackScheduler, PlaybackRenderer, ManualClock) {
        let clock = ManualClock::new();
        let (scheduler, renderer) =
            PlaybackScheduler::new(PlaybackConfig::default(), Arc::new(clock.clone()));
        (scheduler, renderer, clock)
    }

    #[test]
    fn decodes_pcm16_and_f32() {
        let pcm = AudioChunk::from_bytes(
            0,
            &[0x00, 0x40, 0x00, 0xc0],
            AudioFormat {
                sample_rate: RATE,
                encoding: AudioEncoding::Pcm16Le,
            },
        )
        .unwrap();
        assert_eq!(&pcm.samples[..], &[0.5, -0.5]);

        let bytes: Vec<u8> = 0.25f32.to_le_bytes().to_vec();
        let f = AudioChunk::from_bytes(1, &bytes, format()).unwrap();
        assert_eq!(&f.samples[..], &[0.25]);

        assert!(AudioChunk::from_bytes(2, &[0x00], format()).is_err());
        assert!(AudioChunk::from_bytes(3, &[], format()).is_err());
    }

    #[test]
    fn chunks_are_scheduled_back_to_back() {
        let (mut scheduler, _renderer, clock) = setup();
        clock.set_ms(100);
        for seq in 0..3 {
            scheduler.enqueue(chunk(seq, 20, 0.1)).unwrap();
        }
        let windows = scheduler.schedule_windows();
        assert_eq!(windows[0].1, ms(150));
        for pair in windows.windows(2) {
            assert_eq!(pair[0].2, pair[1].1);
        }
    }

    #[test]
    fn renders_in_order_without_gaps() {
        let (mut scheduler, mut renderer, _clock) = setup();
        scheduler.enqueue(chunk(0, 10, 0.1)).unwrap();
        scheduler.enqueue(chunk(1, 10, 0.2)).unwrap();
        scheduler.enqueue(chunk(2, 10, 0.3)).unwrap();

        let mut out = vec![1.0f32; 2400];
        renderer.render(&mut out, Duration::ZERO);

        // 50ms lookahead = 1200 frames of silence, then 3 x 240 frames
        assert!(out[..1200].iter().all(|&s| s == 0.0));
        assert!(out[1200..1440].iter().all(|&s| s == 0.1));
        assert!(out[1440..1680].iter().all(|&s| s == 0.2));
        assert!(out[1680..1920].iter().all(|&s| s == 0.3));
        assert!(out[1920..].iter().all(|&s| s == 0.0));

        scheduler.reconcile();
        assert!(scheduler.is_drained());
        assert_eq!(scheduler.history().played, 3);
    }

    #[test]
    fn ceiling_drops_two_oldest_of_five() {
        let (mut scheduler, _renderer, _clock) = setup();
        for seq in 0..5 {
            scheduler.enqueue(chunk(seq, 300, 0.5)).unwrap();
        }
        assert_eq!(scheduler.queued_seqs(), vec![2, 3, 4]);
        assert_eq!(scheduler.queued_duration(), ms(900));
        assert_eq!(scheduler.history().dropped, 2);

        let overflows: Vec<_> = scheduler
            .take_notices()
            .into_iter()
            .filter_map(|n| match n {
                TelemetryEvent::QueueOverflow { dropped_seqs, .. } => Some(dropped_seqs),
                _ => None,
            })
            .collect();
        assert_eq!(overflows, vec![vec![0], vec![1]]);
    }

    #[test]
    fn dropped_chunks_are_never_played() {
        let (mut scheduler, mut renderer, _clock) = setup();
        for seq in 0..5 {
            scheduler.enqueue(chunk(seq, 300, seq as f32 / 10.0)).unwrap();
        }
        let mut out = vec![0.0f32; 1200 + 7200];
        renderer.render(&mut out, Duration::ZERO);
        // first audible chunk is seq 2
        assert_eq!(out[1200], 0.2);
    }

    #[test]
    fn hard_barge_fade_is_exact_then_empty() {
        let (mut scheduler, mut renderer, _clock) = setup();
        scheduler.enqueue(chunk(0, 500, 0.5)).unwrap();
        scheduler.enqueue(chunk(1, 500, 0.5)).unwrap();

        let mut warmup = vec![0.0f32; 1300];
        renderer.render(&mut warmup, Duration::ZERO);
        assert_eq!(warmup[1250], 0.5);

        let outcome = scheduler.fade_out_and_clear();
        assert!(outcome.faded);
        assert_eq!(outcome.stashed, 2);
        assert_eq!(scheduler.queued_len(), 0);

        let fade_frames = PlaybackConfig::default().fade_frames() as usize;
        let mut out = vec![0.0f32; fade_frames + 480];
        renderer.render(&mut out, ms(1300 / 24));
        assert!((out[0] - 0.5 * (1.0 - 1.0 / fade_frames as f32)).abs() < 1e-6);
        assert!(out[..fade_frames - 1].iter().all(|&s| s > 0.0));
        for w in out[..fade_frames].windows(2) {
            assert!(w[1] <= w[0]);
        }
        assert_eq!(out[fade_frames - 1], 0.0);
        assert!(out[fade_frames..].iter().all(|&s| s == 0.0));
        assert!(renderer.is_idle());

        scheduler.reconcile();
        assert_eq!(scheduler.fades_completed(), 1);
        assert!(scheduler.is_drained());
    }

    #[test]
    fn fade_while_paused_flushes_immediately() {
        let (mut scheduler, mut renderer, _clock) = setup();
        scheduler.enqueue(chunk(0, 100, 0.5)).unwrap();
        assert!(scheduler.pause());
        let outcome = scheduler.fade_out_and_clear();
        assert!(!outcome.faded);
        assert!(scheduler.is_drained());

        let mut out = vec![1.0f32; 4800];
        renderer.render(&mut out, Duration::ZERO);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn pause_keeps_queue_and_resume_restarts_after_lookahead() {
        let (mut scheduler, mut renderer, clock) = setup();
        scheduler.enqueue(chunk(0, 100, 0.5)).unwrap();
        assert!(scheduler.pause());
        assert!(!scheduler.is_playback_active());

        let mut out = vec![1.0f32; 2400];
        renderer.render(&mut out, Duration::ZERO);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(scheduler.queued_len(), 1);

        clock.set_ms(200);
        assert!(scheduler.resume(ms(200)));
        assert_eq!(scheduler.schedule_windows()[0].1, ms(250));
        let mut out = vec![0.0f32; 2400];
        renderer.render(&mut out, ms(200));
        assert_eq!(out[1199], 0.0);
        assert_eq!(out[1200], 0.5);
    }

    #[test]
    fn watchdog_resets_stalled_schedule_once() {
        let (mut scheduler, _renderer, clock) = setup();
        scheduler.enqueue(chunk(0, 100, 0.5)).unwrap();
        // scheduled 50..150ms, never rendered; tolerance is 100ms
        assert!(!scheduler.watchdog(ms(250)));
        clock.set_ms(260);
        assert!(scheduler.watchdog(ms(260)));
        assert_eq!(scheduler.schedule_windows()[0].1, ms(310));
        assert!(!scheduler.watchdog(ms(300)));
        let resets = scheduler
            .take_notices()
            .iter()
            .filter(|n| matches!(n, TelemetryEvent::ScheduleReset { .. }))
            .count();
        assert_eq!(resets, 1);
    }

    #[test]
    fn watchdog_quiet_when_rendering_keeps_up() {
        let (mut scheduler, mut renderer, clock) = setup();
        let mut out = vec![0.0f32; 240];
        for seq in 0..20 {
            scheduler.enqueue(chunk(seq, 10, 0.1)).unwrap();
        }
        for step in 0..60u64 {
            let now = ms(step * 10);
            clock.set(now);
            renderer.render(&mut out, now);
            scheduler.reconcile();
            scheduler.pump();
            assert!(!scheduler.watchdog(now));
        }
        assert_eq!(scheduler.history().played, 20);
    }

    #[test]
    fn out_of_order_chunks_are_reordered() {
        let (mut scheduler, _renderer, _clock) = setup();
        scheduler.enqueue(chunk(0, 10, 0.1)).unwrap();
        scheduler.enqueue(chunk(2, 10, 0.1)).unwrap();
        assert_eq!(scheduler.queued_seqs(), vec![0]);
        scheduler.enqueue(chunk(1, 10, 0.1)).unwrap();
        assert_eq!(scheduler.queued_seqs(), vec![0, 1, 2]);
    }

    #[test]
    fn duplicates_are_rejected_not_dropped_silently() {
        let (mut scheduler, _renderer, _clock) = setup();
        scheduler.enqueue(chunk(0, 10, 0.1)).unwrap();
        scheduler.enqueue(chunk(0, 10, 0.1)).unwrap();
        assert_eq!(scheduler.queued_len(), 1);
        assert_eq!(scheduler.history().rejected, 1);
        assert!(scheduler
            .take_notices()
            .iter()
            .any(|n| matches!(n, TelemetryEvent::ChunkRejected { seq: 0, .. })));
    }

    #[test]
    fn persistent_gap_is_skipped_and_reported() {
        let (mut scheduler, _renderer, _clock) = setup();
        scheduler.enqueue(chunk(0, 10, 0.1)).unwrap();
        for seq in 2..=10 {
            scheduler.enqueue(chunk(seq, 10, 0.1)).unwrap();
        }
        assert_eq!(scheduler.queued_seqs(), (0..=10).filter(|s| *s != 1).collect::<Vec<_>>());
        assert!(scheduler
            .take_notices()
            .iter()
            .any(|n| matches!(n, TelemetryEvent::SequenceGap { expected: 1, resumed_at: 2 })));
    }

    #[test]
    fn wrong_sample_rate_is_rejected() {
        let (mut scheduler, _renderer, _clock) = setup();
        let bad = AudioChunk::from_samples(
            0,
            vec![0.0; 160],
            AudioFormat {
                sample_rate: 16000,
                encoding: AudioEncoding::Pcm16Le,
            },
        );
        scheduler.enqueue(bad).unwrap();
        assert_eq!(scheduler.queued_len(), 0);
        assert_eq!(scheduler.history().rejected, 1);
    }

    #[test]
    fn restore_replays_from_stash() {
        let (mut scheduler, _renderer, _clock) = setup();
        scheduler.enqueue(chunk(0, 100, 0.5)).unwrap();
        scheduler.enqueue(chunk(1, 100, 0.5)).unwrap();
        scheduler.fade_out_and_clear();
        assert!(scheduler.stash_chunk(chunk(2, 100, 0.5)));

        let restore = scheduler.restore(ms(200));
        assert_eq!(restore, Restore::Replayed { from_seq: 0, count: 3 });
        assert_eq!(scheduler.queued_seqs(), vec![0, 1, 2]);
        assert_eq!(scheduler.schedule_windows()[0].1, ms(250));
        assert_eq!(scheduler.mode(), PlaybackMode::Playing);
        assert_eq!(scheduler.history().replayed, 3);
    }

    #[test]
    fn restore_requests_resynthesis_when_resume_chunk_is_gone() {
        let (mut scheduler, _renderer, _clock) = setup();
        scheduler.enqueue(chunk(0, 600, 0.5)).unwrap();
        scheduler.fade_out_and_clear();
        // pushes the stash over the ceiling, evicting chunk 0
        scheduler.stash_chunk(chunk(1, 600, 0.5));
        assert_eq!(scheduler.restore(ms(100)), Restore::Resynthesize { from_seq: 0 });
        assert_eq!(scheduler.restore(ms(100)), Restore::Nothing);
    }

    #[test]
    fn activity_flag_tracks_queue() {
        let (mut scheduler, mut renderer, _clock) = setup();
        let activity = scheduler.activity();
        assert!(!activity.is_active());
        scheduler.enqueue(chunk(0, 10, 0.1)).unwrap();
        assert!(activity.is_active());

        let mut out = vec![0.0f32; 2400];
        renderer.render(&mut out, Duration::ZERO);
        scheduler.reconcile();
        assert!(!activity.is_active());
    }

    #[test]
    fn first_chunk_other_than_zero_waits_for_the_reorder_window() {
        let (mut scheduler, _renderer, _clock) = setup();
        scheduler.enqueue(chunk(5, 10, 0.1)).unwrap();
        assert!(scheduler.queued_seqs().is_empty());
        assert_eq!(scheduler.expected_seq(), None);

        assert!(!scheduler.poll_reorder(ms(50)));
        assert!(scheduler.poll_reorder(ms(100)));
        assert_eq!(scheduler.queued_seqs(), vec![5]);
        assert_eq!(scheduler.expected_seq(), Some(6));
        assert!(!scheduler
            .take_notices()
            .iter()
            .any(|n| matches!(n, TelemetryEvent::SequenceGap { .. })));

        scheduler.enqueue(chunk(4, 10, 0.1)).unwrap();
        assert_eq!(scheduler.history().rejected, 1);
    }

    #[test]
    fn opening_chunks_out_of_order_are_reordered() {
        let (mut scheduler, _renderer, _clock) = setup();
        scheduler.enqueue(chunk(1, 10, 0.2)).unwrap();
        scheduler.enqueue(chunk(0, 10, 0.1)).unwrap();
        assert_eq!(scheduler.queued_seqs(), vec![0, 1]);
        assert_eq!(scheduler.history().rejected, 0);
    }

    #[test]
    fn highest_sequence_number_is_rejected() {
        let (mut scheduler, _renderer, _clock) = setup();
        scheduler.enqueue(chunk(u64::MAX, 10, 0.1)).unwrap();
        assert_eq!(scheduler.queued_len(), 0);
        assert_eq!(scheduler.history().rejected, 1);
        assert_eq!(scheduler.expected_seq(), None);
        assert!(!scheduler.stash_chunk(chunk(u64::MAX, 10, 0.1)));
        assert!(AudioChunk::from_bytes(u64::MAX, &0.1f32.to_le_bytes(), format()).is_err());
    }

    #[test]
    fn ceiling_ignores_audio_already_played_from_the_head() {
        let (mut scheduler, mut renderer, _clock) = setup();
        scheduler.enqueue(chunk(0, 600, 0.5)).unwrap();
        // lookahead, then 300ms of chunk 0
        let mut out = vec![0.0f32; 1200 + 7200];
        renderer.render(&mut out, Duration::ZERO);

        scheduler.enqueue(chunk(1, 600, 0.5)).unwrap();
        assert_eq!(scheduler.queued_seqs(), vec![0, 1]);
        assert_eq!(scheduler.history().dropped, 0);
        assert_eq!(scheduler.queued_duration(), ms(900));
    }

    #[test]
    fn restore_keeps_chunks_past_a_gap_waiting() {
        let (mut scheduler, _renderer, _clock) = setup();
        scheduler.enqueue(chunk(0, 100, 0.1)).unwrap();
        scheduler.enqueue(chunk(1, 100, 0.2)).unwrap();
        scheduler.enqueue(chunk(3, 100, 0.4)).unwrap();
        scheduler.fade_out_and_clear();

        assert_eq!(scheduler.restore(ms(200)), Restore::Replayed { from_seq: 0, count: 2 });
        assert_eq!(scheduler.queued_seqs(), vec![0, 1]);

        scheduler.enqueue(chunk(2, 100, 0.3)).unwrap();
        assert_eq!(scheduler.queued_seqs(), vec![0, 1, 2, 3]);
        assert!(!scheduler
            .take_notices()
            .iter()
            .any(|n| matches!(n, TelemetryEvent::SequenceGap { .. })));
    }

    #[test]
    fn clock_failure_is_an_error() {
        let (mut scheduler, _renderer, clock) = setup();
        clock.set_unavailable(true);
        let err = scheduler.enqueue(chunk(0, 10, 0.1)).unwrap_err();
        assert!(err.is_fatal());
    }
}
