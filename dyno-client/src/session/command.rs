//! Command sub-protocol.
//!
//! Two independent mechanisms share this module:
//!
//! - **Control messages** travel as JSON [`CommandMessage`]s on the reserved
//!   control channel and are decoded into the closed [`ControlCommand`] set.
//! - **Inline commands** are smuggled into the raw build log: a 3-byte
//!   header, a 1-byte command code and a command-specific payload.
//!   [`InlineCommandParser`] strips them out of the byte stream.

use crate::{DynoError, Result};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire form of a control-channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl CommandMessage {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| DynoError::Protocol(format!("malformed control message: {}", e)))
    }

    fn field(&self, key: &str) -> Result<String> {
        self.data.get(key).cloned().ok_or_else(|| {
            DynoError::Protocol(format!("{} command without {}", self.command, key))
        })
    }
}

/// Every control command this client understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// The remote agent is ready; the session becomes active
    Hello,
    /// Materialize `name` from the content store entry `hash`
    FileDownload { name: String, hash: String },
    /// Delete `name`
    FileDelete { name: String },
    /// Remote acknowledgement of a file operation
    FileSynced { command: String, name: Option<String> },
    /// Fatal remote failure
    Error { message: String },
}

impl TryFrom<CommandMessage> for ControlCommand {
    type Error = DynoError;

    fn try_from(message: CommandMessage) -> Result<Self> {
        match message.command.as_str() {
            "hello" => Ok(ControlCommand::Hello),
            "file.download" => Ok(ControlCommand::FileDownload {
                name: message.field("name")?,
                hash: message.field("hash")?,
            }),
            "file.delete" => Ok(ControlCommand::FileDelete {
                name: message.field("name")?,
            }),
            "error" => Ok(ControlCommand::Error {
                message: message
                    .data
                    .get("message")
                    .cloned()
                    .unwrap_or_else(|| "remote process failed".to_string()),
            }),
            other if other.starts_with("file.") => Ok(ControlCommand::FileSynced {
                name: message.data.get("name").cloned(),
                command: message.command.clone(),
            }),
            other => Err(DynoError::Protocol(format!("unknown command kind: {}", other))),
        }
    }
}

impl From<ControlCommand> for CommandMessage {
    fn from(command: ControlCommand) -> Self {
        match command {
            ControlCommand::Hello => CommandMessage::new("hello"),
            ControlCommand::FileDownload { name, hash } => CommandMessage::new("file.download")
                .with("name", name)
                .with("hash", hash),
            ControlCommand::FileDelete { name } => {
                CommandMessage::new("file.delete").with("name", name)
            }
            ControlCommand::FileSynced { command, name } => {
                let message = CommandMessage::new(command);
                match name {
                    Some(name) => message.with("name", name),
                    None => message,
                }
            }
            ControlCommand::Error { message } => CommandMessage::new("error").with("message", message),
        }
    }
}

/// Header that introduces an inline command in a build log.
pub const INLINE_HEADER: [u8; 3] = [0x00, 0x22, 0x00];

/// Inline command code: process exit, 1-byte status payload.
pub const INLINE_EXIT: u8 = 1;

/// What the log relay should do with a piece of the build log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// Bytes to show the user verbatim
    Output(Bytes),
    /// Remote build exited non-zero; nothing after it is shown
    Exit(u8),
    /// Unrecognised inline command code; the rest of the chunk is dropped
    Unknown(u8),
}

/// Streaming parser that separates inline commands from log output.
///
/// A header split across chunk boundaries is held back until the next
/// chunk arrives, so the parser never leaks marker bytes to the user.
#[derive(Debug, Default)]
pub struct InlineCommandParser {
    pending: BytesMut,
    exited: bool,
}

impl InlineCommandParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a non-zero exit has been seen.
    pub fn exited(&self) -> bool {
        self.exited
    }

    /// Parse one chunk of build log.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<LogEvent> {
        let mut events = Vec::new();
        if self.exited {
            return events;
        }

        self.pending.extend_from_slice(chunk);

        loop {
            let Some(at) = find_header(&self.pending) else {
                // Keep a trailing partial header for the next chunk
                let keep = partial_header_len(&self.pending);
                let emit = self.pending.len() - keep;
                if emit > 0 {
                    events.push(LogEvent::Output(self.pending.split_to(emit).freeze()));
                }
                return events;
            };

            if at > 0 {
                events.push(LogEvent::Output(self.pending.split_to(at).freeze()));
            }

            // pending now starts with the header
            let Some(&code) = self.pending.get(INLINE_HEADER.len()) else {
                return events;
            };

            match code {
                INLINE_EXIT => {
                    let Some(&status) = self.pending.get(INLINE_HEADER.len() + 1) else {
                        return events;
                    };
                    if status != 0 {
                        self.exited = true;
                        self.pending.clear();
                        events.push(LogEvent::Exit(status));
                        return events;
                    }
                    self.pending.advance(INLINE_HEADER.len() + 2);
                }
                other => {
                    // Payload length unknown: drop what is left of this chunk
                    self.pending.clear();
                    events.push(LogEvent::Unknown(other));
                    return events;
                }
            }
        }
    }

    /// End of stream: release anything held back as plain output.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.exited || self.pending.is_empty() {
            return None;
        }
        Some(self.pending.split().freeze())
    }
}

fn find_header(buf: &[u8]) -> Option<usize> {
    buf.windows(INLINE_HEADER.len())
        .position(|window| window == INLINE_HEADER)
}

/// Length of the longest suffix of `buf` that is a proper prefix of the header.
fn partial_header_len(buf: &[u8]) -> usize {
    (1..INLINE_HEADER.len())
        .rev()
        .find(|&n| buf.len() >= n && buf[buf.len() - n..] == INLINE_HEADER[..n])
        .unwrap_or(0)
}
