//! Async control loop around a `Session`.
//!
//! One task owns the session. It multiplexes transport events, the control tick
//! (which also drains local VAD signals) and the playback watchdog, and forwards
//! every produced command to the transport.

use crate::error::{DuplexError, DuplexResult};
use crate::events::{Command, TransportEvent};
use crate::session::{Session, SessionState};
use crate::signal_channel::SignalReceiver;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Counters for one `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub events: u64,
    pub signals: u64,
    pub ticks: u64,
    pub watchdog_resets: u64,
    pub commands: u64,
    pub final_state: Option<SessionState>,
}

enum Wake {
    Event(TransportEvent),
    Tick,
    Watchdog,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct SessionRunner {
    session: Session,
    signals: Option<SignalReceiver>,
    commands: mpsc::Sender<Command>,
}

impl SessionRunner {
    pub fn new(session: Session, signals: Option<SignalReceiver>, commands: mpsc::Sender<Command>) -> Self {
        Self {
            session,
            signals,
            commands,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Drive the session until the event stream ends. Fatal errors stop the loop
    /// after the session has reset itself.
    pub async fn run<S>(&mut self, mut events: S) -> DuplexResult<RunSummary>
    where
        S: Stream<Item = TransportEvent> + Unpin,
    {
        let config = self.session.config();
        let mut tick = interval(config.session.control_tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watchdog = interval(config.playback.watchdog_interval());
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("🎭 Session {} control loop started", self.session.id());
        let mut summary = RunSummary::default();

        loop {
            let wake = tokio::select! {
                event = events.next() => match event {
                    Some(e) => Wake::Event(e),
                    None => Wake::Closed,
                },
                _ = tick.tick() => Wake::Tick,
                _ = watchdog.tick() => Wake::Watchdog,
            };

            let step = self.wake(wake, &mut summary);
            // Commands queued by a fatal reset still reach the transport.
            summary.commands += self.forward().await?;
            if step? == Flow::Stop {
                break;
            }
        }

        summary.final_state = Some(self.session.state());
        info!(
            "✅ Session {} control loop finished ({} events, {} commands)",
            self.session.id(),
            summary.events,
            summary.commands
        );
        Ok(summary)
    }

    fn wake(&mut self, wake: Wake, summary: &mut RunSummary) -> DuplexResult<Flow> {
        match wake {
            Wake::Event(event) => {
                summary.events += 1;
                Self::settle(self.session.handle_event(event))?;
            }
            Wake::Tick => {
                summary.ticks += 1;
                summary.signals += self.drain_signals()?;
                Self::settle(self.session.tick())?;
            }
            Wake::Watchdog => {
                if Self::settle(self.session.watchdog())?.unwrap_or(false) {
                    summary.watchdog_resets += 1;
                }
            }
            Wake::Closed => {
                debug!("Transport stream ended");
                summary.signals += self.drain_signals()?;
                Self::settle(self.session.tick())?;
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn drain_signals(&mut self) -> DuplexResult<u64> {
        let Some(rx) = self.signals.as_ref() else {
            return Ok(0);
        };
        let signals = rx.drain();
        let count = signals.len() as u64;
        for signal in signals {
            Self::settle(self.session.on_vad_signal(signal))?;
        }
        Ok(count)
    }

    async fn forward(&mut self) -> DuplexResult<u64> {
        let commands = self.session.take_commands();
        let count = commands.len() as u64;
        for command in commands {
            self.commands
                .send(command)
                .await
                .map_err(|e| DuplexError::ChannelSend(format!("command receiver closed: {}", e)))?;
        }
        Ok(count)
    }

    /// Fatal errors end the loop; anything else was already handled by the session.
    fn settle<T>(result: DuplexResult<T>) -> DuplexResult<Option<T>> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("⚠️ Session error: {}", e);
                Ok(None)
            }
        }
    }
}
