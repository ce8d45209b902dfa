//! Example: scripted full-duplex conversation
//!
//! Drives a session through the async runner on the real clock with a virtual
//! speaker thread standing in for the audio device: the user asks a question, the
//! assistant starts answering, the user interrupts with "wait", and asks again.
//!
//! Run with `cargo run --example duplex_sim` (add `-- --json` to dump the event log).

use anyhow::Result;
use pagi_duplex::{
    signal_channel, Command, DuplexConfig, EventKind, MonotonicClock, PlaybackClock, Session, SessionRunner,
    TransportEvent, VadSignal,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn tone(ms: u64, sample_rate: u32) -> Vec<f32> {
    let frames = (sample_rate as u64 * ms / 1000) as usize;
    (0..frames)
        .map(|i| 0.3 * (i as f32 * 440.0 * std::f32::consts::TAU / sample_rate as f32).sin())
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let dump_json = std::env::args().any(|a| a == "--json");

    info!("🎭 PAGI Duplex simulation");
    info!("=========================");

    let config = Arc::new(DuplexConfig::load()?);
    let clock: Arc<dyn PlaybackClock> = Arc::new(MonotonicClock::new());
    let (session, mut renderer) = Session::new(Arc::clone(&config), Arc::clone(&clock))?;

    // Virtual speaker: render 10ms blocks on the session clock.
    let running = Arc::new(AtomicBool::new(true));
    let speaker = {
        let running = Arc::clone(&running);
        let clock = Arc::clone(&clock);
        let frames = (config.playback.sample_rate / 100) as usize;
        std::thread::spawn(move || {
            let mut block = vec![0.0f32; frames];
            while running.load(Ordering::Acquire) {
                if let Ok(now) = clock.now() {
                    renderer.render(&mut block, now);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        })
    };

    let (signal_tx, signal_rx) = signal_channel(config.vad.signal_channel_capacity);
    let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(64);
    let (command_tx, mut command_rx) = mpsc::channel::<Command>(64);

    let printer = tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            if let Ok(json) = command.to_json() {
                info!("📤 {}", json);
            }
        }
    });

    // Microphone stand-in: (start ms, end ms, probability).
    let vad_clock = Arc::clone(&clock);
    let microphone = tokio::spawn(async move {
        let script = [(0, 400, 0.9), (400, 2000, 0.0), (2000, 2400, 0.9), (2400, 5000, 0.0)];
        for (start, end, probability) in script {
            for _ in (start..end).step_by(10) {
                if let Ok(now) = vad_clock.now() {
                    signal_tx.send(VadSignal::local(probability, now));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    });

    let transport_config = Arc::clone(&config);
    let transport = tokio::spawn(async move {
        let sample_rate = transport_config.playback.sample_rate;
        let mut seq = 0u64;
        let mut at = 0u64;
        let mut next = |kind: EventKind, ts: u64| {
            seq += 1;
            TransportEvent::new(seq, ts, kind)
        };
        let script: Vec<(u64, EventKind)> = vec![
            (300, EventKind::SpeechFinal {
                text: "tell me about the tides".into(),
                confidence: 0.92,
                prosody: None,
            }),
            (1600, EventKind::SessionLanguage { tag: "en-US".into() }),
        ];
        for (ts, kind) in script {
            tokio::time::sleep(Duration::from_millis(ts - at)).await;
            at = ts;
            if event_tx.send(next(kind, ts)).await.is_err() {
                return;
            }
        }

        // Response audio, 100ms chunks.
        for chunk_seq in 0..8u64 {
            seq += 1;
            let event = TransportEvent::audio_chunk(seq, at, chunk_seq, &tone(100, sample_rate), &transport_config);
            if event_tx.send(event).await.is_err() {
                return;
            }
        }

        let script: Vec<(u64, EventKind)> = vec![
            (2050, EventKind::SpeechPartial {
                text: "wait".into(),
                confidence: 0.7,
            }),
            (2450, EventKind::SpeechFinal {
                text: "wait, what about the moon?".into(),
                confidence: 0.9,
                prosody: None,
            }),
            (4500, EventKind::ResponseDone),
        ];
        for (ts, kind) in script {
            tokio::time::sleep(Duration::from_millis(ts - at)).await;
            at = ts;
            seq += 1;
            if event_tx.send(TransportEvent::new(seq, ts, kind)).await.is_err() {
                return;
            }
        }
    });

    let mut runner = SessionRunner::new(session, Some(signal_rx), command_tx);
    let summary = runner.run(ReceiverStream::new(event_rx)).await?;
    info!("✅ Finished: {:?}", summary);

    transport.await?;
    microphone.await?;
    let session = runner.into_session();
    printer.await?;

    running.store(false, Ordering::Release);
    let _ = speaker.join();

    let history = session.audio_history();
    info!(
        "🔊 Audio: received {}, played {}, dropped {}, replayed {}",
        history.received, history.played, history.dropped, history.replayed
    );
    if dump_json {
        print!("{}", session.event_log().to_json_lines()?);
    }

    info!("👋 Goodbye!");
    Ok(())
}
