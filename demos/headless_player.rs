//! Headless host: connects to a studio, plays timelines and prints the inputs
//! it would inject.
//!
//! Timeline files hold one line per input line: a frame count, the held keys,
//! and optionally `*speed` to mark a breakpoint, e.g. `12 R J *0.5`.
//!
//! ```text
//! RUST_LOG=taslink=debug cargo run --example headless_player -- 34729
//! ```

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use taslink::{
    Controller, HostBridge, InputSet, InputSink, LinkConfig, LinkError, PlaybackConfig,
    PlaybackScheduler, ScriptTimeline, SideEffect, TargetRate, TasLink, TickClock, Timeline,
    TimelineLine, TimelineParser,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Idle frame period while nothing is playing.
const IDLE_PERIOD: Duration = Duration::from_millis(20);

/// Frame period shared between the scheduler's clock and the host loop.
#[derive(Clone, Default)]
struct LoopClock(Arc<Mutex<Option<TargetRate>>>);

impl LoopClock {
    fn period(&self) -> Duration {
        match *self.0.lock().unwrap() {
            Some(TargetRate::Fixed(fps)) if fps > 0.0 => Duration::from_secs_f64(1.0 / fps),
            Some(_) => Duration::ZERO,
            None => IDLE_PERIOD,
        }
    }
}

impl TickClock for LoopClock {
    fn arm(&mut self, rate: TargetRate) {
        *self.0.lock().unwrap() = Some(rate);
    }

    fn disarm(&mut self) {
        *self.0.lock().unwrap() = None;
    }
}

struct PrintingSink;

impl InputSink for PrintingSink {
    fn apply(&mut self, input: &InputSet) {
        println!("input [{input}]");
    }

    fn release_all(&mut self) {
        println!("input released");
    }
}

struct ConsoleHost {
    started: Instant,
}

impl HostBridge for ConsoleHost {
    fn set_paused(&mut self, paused: bool) {
        println!("paused: {paused}");
    }

    fn scene_reset(&mut self, target: &str) {
        println!("scene reset to {target}");
    }

    fn diagnostic(&self) -> Option<String> {
        Some(format!("uptime {:.1}s", self.started.elapsed().as_secs_f64()))
    }
}

struct LineParser;

impl TimelineParser for LineParser {
    fn parse(&self, text: &str) -> taslink::Result<Arc<dyn Timeline>> {
        let mut lines = Vec::new();
        for (number, raw) in text.lines().enumerate() {
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let mut words = raw.split_whitespace();
            let frames = words
                .next()
                .and_then(|word| word.parse().ok())
                .ok_or_else(|| LinkError::timeline("parse", format!("line {}", number + 1)))?;

            let mut line = TimelineLine::new(frames, InputSet::released()).at_source_line(number);
            let mut keys = Vec::new();
            for word in words {
                match word.strip_prefix('*').map(str::parse::<f64>) {
                    Some(Ok(speed)) => line = line.with_effect(SideEffect::Breakpoint { speed }),
                    Some(Err(_)) => {
                        return Err(LinkError::timeline("parse", format!("bad speed on line {}", number + 1)));
                    }
                    None => keys.push(word),
                }
            }
            line.input = InputSet::from_keys(keys);
            lines.push(line);
        }
        Ok(Arc::new(ScriptTimeline::new(lines)?))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = LinkConfig::default();
    if let Some(port) = std::env::args().nth(1) {
        config = config.with_port(port.parse()?);
    }
    info!("Connecting to studio at {}", config.address);
    let client = TasLink::connect(config)?;

    let clock = LoopClock::default();
    let scheduler = PlaybackScheduler::new(PlaybackConfig::default(), clock.clone(), PrintingSink);
    let controller = Arc::new(Controller::new(
        scheduler,
        ConsoleHost { started: Instant::now() },
        LineParser,
        Arc::clone(&client),
        &tokio::runtime::Handle::current(),
    ));

    let events = client.take_events().ok_or("event stream already taken")?;
    let runner = Arc::clone(&controller);
    tokio::spawn(async move { runner.run_events(events).await });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(clock.period()) => {
                controller.before_update();
                controller.late_update();
                // Unbounded playback still yields so studio events get through.
                tokio::task::yield_now().await;
            }
        }
    }

    info!("Shutting down");
    controller.shutdown().await;
    client.join().await;
    Ok(())
}
