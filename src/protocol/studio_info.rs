//! Playback telemetry record sent with `SetStudioInfo`.
//!
//! The link treats the encoded record as opaque bytes. The default encoding
//! writes every integer as big-endian `i32` and every string as a big-endian
//! `u32` byte length followed by UTF-8 bytes, in field declaration order.

use serde::{Deserialize, Serialize};

use crate::{ClientOpCode, LinkError, Result};

/// Progress snapshot shown by the studio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudioInfo {
    /// Zero-based timeline line, or -1 when nothing is playing.
    pub current_line: i32,
    /// Frame-in-line label, one-based ("3" for the third frame of a line).
    pub current_line_suffix: String,
    /// Frames played since the last start.
    pub current_frame_in_tas: i32,
    pub total_frames: i32,
    pub save_state_line: i32,
    pub tas_states: i32,
    pub game_info: String,
    pub level_name: String,
}

impl StudioInfo {
    /// Progress record for an advancing timeline.
    pub fn progress(line: usize, frame_in_line: u32, active_frame: u64) -> Self {
        Self {
            current_line: clamp_i32(line as u64),
            current_line_suffix: (u64::from(frame_in_line) + 1).to_string(),
            current_frame_in_tas: clamp_i32(active_frame),
            total_frames: 0,
            save_state_line: 0,
            tas_states: 0,
            game_info: String::new(),
            level_name: String::new(),
        }
    }

    /// The sentinel instance sent whenever playback is not running.
    pub fn invalid() -> Self {
        Self {
            current_line: -1,
            current_line_suffix: String::new(),
            current_frame_in_tas: 0,
            total_frames: 0,
            save_state_line: -1,
            tas_states: 0,
            game_info: String::new(),
            level_name: String::new(),
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.current_line < 0
    }
}

fn clamp_i32(value: u64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Turns a [`StudioInfo`] into the `SetStudioInfo` payload.
pub trait StudioInfoEncoder: Send + Sync + 'static {
    fn encode(&self, info: &StudioInfo) -> Vec<u8>;
}

/// Default big-endian encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryStudioInfoEncoder;

impl StudioInfoEncoder for BinaryStudioInfoEncoder {
    fn encode(&self, info: &StudioInfo) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            6 * 4
                + 3 * 4
                + info.current_line_suffix.len()
                + info.game_info.len()
                + info.level_name.len(),
        );
        out.extend_from_slice(&info.current_line.to_be_bytes());
        put_str(&mut out, &info.current_line_suffix);
        out.extend_from_slice(&info.current_frame_in_tas.to_be_bytes());
        out.extend_from_slice(&info.total_frames.to_be_bytes());
        out.extend_from_slice(&info.save_state_line.to_be_bytes());
        out.extend_from_slice(&info.tas_states.to_be_bytes());
        put_str(&mut out, &info.game_info);
        put_str(&mut out, &info.level_name);
        out
    }
}

impl BinaryStudioInfoEncoder {
    /// Decode a payload produced by [`StudioInfoEncoder::encode`].
    pub fn decode(&self, data: &[u8]) -> Result<StudioInfo> {
        let mut cursor = Reader { data, offset: 0 };
        let info = StudioInfo {
            current_line: cursor.i32()?,
            current_line_suffix: cursor.string()?,
            current_frame_in_tas: cursor.i32()?,
            total_frames: cursor.i32()?,
            save_state_line: cursor.i32()?,
            tas_states: cursor.i32()?,
            game_info: cursor.string()?,
            level_name: cursor.string()?,
        };
        if cursor.offset != data.len() {
            return Err(malformed(format!("{} trailing bytes", data.len() - cursor.offset)));
        }
        Ok(info)
    }
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn malformed(details: String) -> LinkError {
    LinkError::protocol(ClientOpCode::SetStudioInfo.into(), details)
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl Reader<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| malformed(format!("record truncated at offset {}", self.offset)))?;
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let bytes = self.take(4)?;
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| malformed(format!("string is not UTF-8: {e}")))
    }
}
