//! Opcodes and message types exchanged with the studio.
//!
//! Every message on the wire is `[opcode: u8][len: u32 BE][payload: len bytes]`.
//! The opcode space is split by direction: [`ClientOpCode`] values travel from the
//! player to the studio, [`ServerOpCode`] values from the studio to the player.
//! The two enumerations overlap numerically; direction disambiguates them.

mod studio_info;

pub use studio_info::{BinaryStudioInfoEncoder, StudioInfo, StudioInfoEncoder};

use std::fmt;

use crate::{LinkError, Result};

/// Opcodes sent by the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientOpCode {
    /// Handshake; always the first message after connecting, empty payload.
    EstablishConnection = 0,
    /// Graceful shutdown notice, empty payload.
    CloseConnection = 1,
    /// Encoded [`StudioInfo`] record.
    SetStudioInfo = 2,
    /// Free-form UTF-8 diagnostic text.
    SetInfoString = 3,
}

impl From<ClientOpCode> for u8 {
    fn from(opcode: ClientOpCode) -> Self {
        opcode as u8
    }
}

impl TryFrom<u8> for ClientOpCode {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ClientOpCode::EstablishConnection),
            1 => Ok(ClientOpCode::CloseConnection),
            2 => Ok(ClientOpCode::SetStudioInfo),
            3 => Ok(ClientOpCode::SetInfoString),
            other => Err(LinkError::protocol(other, "unknown client opcode")),
        }
    }
}

/// Opcodes sent by the studio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerOpCode {
    /// One byte keybind code.
    KeybindTriggered = 0,
    /// UTF-8 path to the timeline source; empty clears the active timeline.
    SendPath = 1,
}

impl From<ServerOpCode> for u8 {
    fn from(opcode: ServerOpCode) -> Self {
        opcode as u8
    }
}

impl TryFrom<u8> for ServerOpCode {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ServerOpCode::KeybindTriggered),
            1 => Ok(ServerOpCode::SendPath),
            other => Err(LinkError::protocol(other, "unknown server opcode")),
        }
    }
}

/// Keybinds the studio can trigger remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Keybind {
    StartStop = 0,
    FrameAdvance = 1,
    PauseResume = 2,
    /// Reserved; accepted and ignored.
    ToggleHitboxes = 3,
}

impl TryFrom<u8> for Keybind {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Keybind::StartStop),
            1 => Ok(Keybind::FrameAdvance),
            2 => Ok(Keybind::PauseResume),
            3 => Ok(Keybind::ToggleHitboxes),
            other => Err(LinkError::protocol(
                ServerOpCode::KeybindTriggered.into(),
                format!("unknown keybind code {other}"),
            )),
        }
    }
}

impl fmt::Display for Keybind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Keybind::StartStop => "StartStop",
            Keybind::FrameAdvance => "FrameAdvance",
            Keybind::PauseResume => "PauseResume",
            Keybind::ToggleHitboxes => "ToggleHitboxes",
        };
        f.write_str(name)
    }
}

/// A raw framed message: one opcode byte plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(opcode: impl Into<u8>, payload: impl Into<Vec<u8>>) -> Self {
        Self { opcode: opcode.into(), payload: payload.into() }
    }

    /// A message with no payload.
    pub fn empty(opcode: impl Into<u8>) -> Self {
        Self { opcode: opcode.into(), payload: Vec::new() }
    }
}

/// Decoded studio → player message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    KeybindTriggered(Keybind),
    /// `None` is the empty-string sentinel: no active timeline.
    SendPath(Option<String>),
}

impl InboundMessage {
    /// Decode a raw studio message.
    ///
    /// Unknown opcodes, keybind payloads that are not exactly one byte and
    /// non-UTF-8 paths are protocol errors.
    pub fn decode(opcode: u8, payload: &[u8]) -> Result<Self> {
        match ServerOpCode::try_from(opcode)? {
            ServerOpCode::KeybindTriggered => match payload {
                [code] => Ok(InboundMessage::KeybindTriggered(Keybind::try_from(*code)?)),
                _ => Err(LinkError::protocol(
                    opcode,
                    format!("keybind payload must be 1 byte, got {}", payload.len()),
                )),
            },
            ServerOpCode::SendPath => {
                let path = std::str::from_utf8(payload)
                    .map_err(|e| LinkError::protocol(opcode, format!("path is not UTF-8: {e}")))?;
                if path.is_empty() {
                    Ok(InboundMessage::SendPath(None))
                } else {
                    Ok(InboundMessage::SendPath(Some(path.to_string())))
                }
            }
        }
    }

    /// Encode back into a raw message, as the studio would send it.
    pub fn encode(&self) -> Message {
        match self {
            InboundMessage::KeybindTriggered(keybind) => {
                Message::new(ServerOpCode::KeybindTriggered, vec![*keybind as u8])
            }
            InboundMessage::SendPath(path) => Message::new(
                ServerOpCode::SendPath,
                path.as_deref().unwrap_or_default().as_bytes().to_vec(),
            ),
        }
    }
}
