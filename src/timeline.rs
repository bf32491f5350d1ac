//! Read-only view of a parsed input timeline.
//!
//! Parsing the timeline's source text is the job of an external library; this
//! module only fixes the boundary the scheduler consumes:
//!
//! - [`TimelineParser`] turns source text into a [`Timeline`]
//! - [`Timeline::cursor_at`] resolves a global frame to a [`CursorState`]
//! - [`Timeline::next_breakpoint`] scans forward for the next speed marker
//!
//! [`ScriptTimeline`] is an in-memory implementation built from typed lines.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::{LinkError, Result};

/// Keys held down during one frame, by their timeline names ("L", "J", ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct InputSet {
    keys: BTreeSet<String>,
}

impl InputSet {
    /// No keys held.
    pub fn released() -> Self {
        Self::default()
    }

    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { keys: keys.into_iter().map(Into::into).collect() }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

impl fmt::Display for InputSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.iter().collect();
        f.write_str(&keys.join(","))
    }
}

/// Annotation attached to a timeline line.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Pause marker; `speed` multiplies the nominal frame rate.
    Breakpoint { speed: f64 },
    /// Reset the scene to a fixed reference point.
    Call { target: String },
    Comment(String),
    Property { name: String, value: String },
}

/// One input line: a key set held for `frames` frames.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineLine {
    pub frames: u32,
    pub input: InputSet,
    pub effects: Vec<SideEffect>,
    /// Line number in the source text, for display.
    pub source_line: usize,
}

impl TimelineLine {
    pub fn new(frames: u32, input: InputSet) -> Self {
        Self { frames, input, effects: Vec::new(), source_line: 0 }
    }

    pub fn with_effect(mut self, effect: SideEffect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn at_source_line(mut self, source_line: usize) -> Self {
        self.source_line = source_line;
        self
    }

    pub fn breakpoint(&self) -> Option<f64> {
        self.effects.iter().find_map(|effect| match effect {
            SideEffect::Breakpoint { speed } => Some(*speed),
            _ => None,
        })
    }
}

/// Resolved view of the timeline at one global frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorState {
    pub line_index: usize,
    pub source_line: usize,
    pub frame_in_line: u32,
    pub input: InputSet,
    /// Only populated on a line's first frame, so each annotation fires once.
    pub effects: Vec<SideEffect>,
}

/// Timeline as seen by the scheduler.
pub trait Timeline: Send + Sync + 'static {
    /// Resolve `frame`, or `None` once it is past the end.
    fn cursor_at(&self, frame: u64) -> Result<Option<CursorState>>;

    fn line_count(&self) -> usize;

    /// Line `index`, if it exists.
    fn line(&self, index: usize) -> Option<&TimelineLine>;

    /// Total playable frames.
    fn total_frames(&self) -> u64;

    /// Speed factor of the first breakpoint at or after `from_line`.
    fn next_breakpoint(&self, from_line: usize) -> Option<f64> {
        (from_line..self.line_count()).find_map(|index| self.line(index)?.breakpoint())
    }
}

/// Source text to [`Timeline`].
pub trait TimelineParser: Send + Sync + 'static {
    fn parse(&self, text: &str) -> Result<Arc<dyn Timeline>>;
}

/// In-memory timeline over typed lines.
#[derive(Debug, Clone, Default)]
pub struct ScriptTimeline {
    lines: Vec<TimelineLine>,
    /// First global frame of each line.
    starts: Vec<u64>,
    total_frames: u64,
}

impl ScriptTimeline {
    /// Build a timeline; every line must last at least one frame.
    pub fn new(lines: Vec<TimelineLine>) -> Result<Self> {
        let mut starts = Vec::with_capacity(lines.len());
        let mut total = 0u64;
        for (index, line) in lines.iter().enumerate() {
            if line.frames == 0 {
                return Err(LinkError::timeline(
                    "timeline construction",
                    format!("line {} (source line {}) has zero frames", index, line.source_line),
                ));
            }
            starts.push(total);
            total += u64::from(line.frames);
        }
        Ok(Self { lines, starts, total_frames: total })
    }

    pub fn lines(&self) -> &[TimelineLine] {
        &self.lines
    }
}

impl Timeline for ScriptTimeline {
    fn cursor_at(&self, frame: u64) -> Result<Option<CursorState>> {
        if frame >= self.total_frames {
            return Ok(None);
        }

        // Last line whose start is <= frame.
        let index = self.starts.partition_point(|start| *start <= frame) - 1;
        let line = &self.lines[index];
        let frame_in_line = u32::try_from(frame - self.starts[index]).map_err(|_| {
            LinkError::timeline("cursor lookup", format!("frame {frame} overflows line {index}"))
        })?;

        Ok(Some(CursorState {
            line_index: index,
            source_line: line.source_line,
            frame_in_line,
            input: line.input.clone(),
            effects: if frame_in_line == 0 { line.effects.clone() } else { Vec::new() },
        }))
    }

    fn line_count(&self) -> usize {
        self.lines.len()
    }

    fn line(&self, index: usize) -> Option<&TimelineLine> {
        self.lines.get(index)
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }
}
