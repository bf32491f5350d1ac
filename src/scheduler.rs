//! Frame-exact playback of a timeline, driven by the host's frame clock.
//!
//! The scheduler is a cooperative state machine: the host calls
//! [`PlaybackScheduler::tick`] once per frame callback and reacts to the
//! returned [`PlaybackEvent`]s. It never spawns threads or timers of its own.
//!
//! ## Tick Processing
//!
//! 1. Resolve the cursor at the active frame; past the end, stop and emit
//!    [`PlaybackEvent::Finished`]
//! 2. Run the line's side effects in order (breakpoints re-run the lookahead)
//! 3. Inject the line's inputs and emit [`PlaybackEvent::Advance`]
//! 4. Increment the active frame
//!
//! Resolution errors abandon the tick before anything is committed, so the
//! next tick retries the same frame.
//!
//! ## Playback Rate
//!
//! The clock rate is chosen once per [`start`](PlaybackScheduler::start): the
//! first breakpoint's speed factor times the nominal rate, or unbounded when the
//! timeline has no breakpoint. Breakpoints hit mid-run are reported but do not
//! change the rate.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::config::PlaybackConfig;
use crate::timeline::{InputSet, SideEffect, Timeline};
use crate::{LinkError, Result};

/// Target rate for the host's frame clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetRate {
    /// Frames per second.
    Fixed(f64),
    /// As fast as the host can tick.
    Unbounded,
}

impl TargetRate {
    /// Rate for the breakpoint found by a lookahead, if any.
    ///
    /// A zero nominal rate or a speed that is not a positive finite number
    /// cannot arm a clock and falls back to unbounded.
    pub fn from_lookahead(nominal_fps: u32, breakpoint: Option<f64>) -> Self {
        match breakpoint {
            Some(speed) if nominal_fps > 0 && speed.is_finite() && speed > 0.0 => {
                TargetRate::Fixed(f64::from(nominal_fps) * speed)
            }
            _ => TargetRate::Unbounded,
        }
    }
}

/// Host frame clock the scheduler arms and disarms.
pub trait TickClock: Send {
    fn arm(&mut self, rate: TargetRate);
    fn disarm(&mut self);
}

/// Host input injection.
pub trait InputSink: Send {
    fn apply(&mut self, input: &InputSet);
    /// Return every key to the released state.
    fn release_all(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    Stopped,
    Running,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Stopped => f.write_str("stopped"),
            PlaybackState::Running => f.write_str("running"),
        }
    }
}

/// Signal produced by a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Advance {
        input: InputSet,
        line_index: usize,
        source_line: usize,
        frame_in_line: u32,
    },
    BreakpointHit {
        speed: f64,
        /// No further breakpoint exists after this line.
        last: bool,
    },
    SceneReset {
        target: String,
    },
    Finished,
}

/// Timeline player.
pub struct PlaybackScheduler<C, I> {
    config: PlaybackConfig,
    clock: C,
    input: I,
    timeline: Option<Arc<dyn Timeline>>,
    state: PlaybackState,
    active_frame: u64,
    target_rate: TargetRate,
}

impl<C, I> PlaybackScheduler<C, I>
where
    C: TickClock,
    I: InputSink,
{
    pub fn new(config: PlaybackConfig, clock: C, input: I) -> Self {
        Self {
            config,
            clock,
            input,
            timeline: None,
            state: PlaybackState::Stopped,
            active_frame: 0,
            target_rate: TargetRate::Unbounded,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == PlaybackState::Running
    }

    pub fn active_frame(&self) -> u64 {
        self.active_frame
    }

    /// Rate chosen by the last start.
    pub fn target_rate(&self) -> TargetRate {
        self.target_rate
    }

    pub fn timeline(&self) -> Option<&Arc<dyn Timeline>> {
        self.timeline.as_ref()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    /// Replace the timeline. Clearing it while running stops playback.
    pub fn set_timeline(&mut self, timeline: Option<Arc<dyn Timeline>>) {
        if timeline.is_none() && self.is_running() {
            info!("Timeline cleared while running, stopping playback");
            self.halt();
        }
        self.timeline = timeline;
    }

    /// Stopped -> Running from frame 0.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(LinkError::invalid_state("start playback", self.state.to_string()));
        }
        let timeline = self
            .timeline
            .as_ref()
            .ok_or_else(|| LinkError::invalid_state("start playback", "no timeline is loaded"))?;

        self.active_frame = 0;
        let breakpoint = timeline.next_breakpoint(0);
        self.target_rate = TargetRate::from_lookahead(self.config.nominal_fps, breakpoint);
        if let (Some(speed), TargetRate::Unbounded) = (breakpoint, self.target_rate) {
            warn!(
                "Breakpoint speed {} at {} fps gives no usable rate, running unbounded",
                speed, self.config.nominal_fps
            );
        }

        info!(
            "Starting playback: {} frames, rate {:?}",
            timeline.total_frames(),
            self.target_rate
        );
        self.clock.arm(self.target_rate);
        self.state = PlaybackState::Running;
        Ok(())
    }

    /// Stopped -> Running keeping the active frame and the rate of the last start.
    pub fn resume(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(LinkError::invalid_state("resume playback", self.state.to_string()));
        }
        if self.timeline.is_none() {
            return Err(LinkError::invalid_state("resume playback", "no timeline is loaded"));
        }

        debug!("Resuming playback at frame {}", self.active_frame);
        self.clock.arm(self.target_rate);
        self.state = PlaybackState::Running;
        Ok(())
    }

    /// Running -> Stopped; releases every injected key.
    pub fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(LinkError::invalid_state("stop playback", self.state.to_string()));
        }
        debug!("Stopping playback at frame {}", self.active_frame);
        self.halt();
        Ok(())
    }

    /// Process one frame. Errors are logged and the tick is skipped.
    pub fn tick(&mut self) -> Vec<PlaybackEvent> {
        if !self.is_running() {
            return Vec::new();
        }
        match self.try_tick() {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to perform input at frame {}: {}", self.active_frame, e);
                Vec::new()
            }
        }
    }

    /// Process one frame, returning resolution errors instead of logging them.
    ///
    /// Nothing is mutated when an error is returned.
    pub fn try_tick(&mut self) -> Result<Vec<PlaybackEvent>> {
        if !self.is_running() {
            return Err(LinkError::invalid_state("tick", self.state.to_string()));
        }
        let timeline = Arc::clone(
            self.timeline
                .as_ref()
                .ok_or_else(|| LinkError::invalid_state("tick", "no timeline is loaded"))?,
        );

        let Some(cursor) = timeline.cursor_at(self.active_frame)? else {
            info!("Timeline finished after {} frames", self.active_frame);
            self.halt();
            return Ok(vec![PlaybackEvent::Finished]);
        };

        let mut events = Vec::with_capacity(cursor.effects.len() + 1);
        for effect in &cursor.effects {
            match effect {
                SideEffect::Breakpoint { speed } => {
                    let last = timeline.next_breakpoint(cursor.line_index + 1).is_none();
                    debug!(
                        "Breakpoint hit on line {} (speed {}, last {})",
                        cursor.source_line, speed, last
                    );
                    events.push(PlaybackEvent::BreakpointHit { speed: *speed, last });
                }
                SideEffect::Call { target } => {
                    events.push(PlaybackEvent::SceneReset { target: target.clone() });
                }
                SideEffect::Comment(_) | SideEffect::Property { .. } => {}
            }
        }

        trace!(
            "Frame {}: line {} +{} [{}]",
            self.active_frame, cursor.line_index, cursor.frame_in_line, cursor.input
        );
        self.input.apply(&cursor.input);
        events.push(PlaybackEvent::Advance {
            input: cursor.input,
            line_index: cursor.line_index,
            source_line: cursor.source_line,
            frame_in_line: cursor.frame_in_line,
        });
        self.active_frame += 1;
        Ok(events)
    }

    fn halt(&mut self) {
        self.clock.disarm();
        self.input.release_all();
        self.state = PlaybackState::Stopped;
    }
}
