//! Control-plane wire format.
//!
//! Every message, in either direction, is one JSON object
//! `{command, key?, value?}`. Frames are newline-terminated; a peer that
//! writes a single object without a trailing newline is also understood,
//! as long as the object is complete and under [`MAX_MESSAGE_BYTES`].

use serde::{Deserialize, Serialize};

/// Cap on one frame.
pub const MAX_MESSAGE_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ControlMessage {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            key: None,
            value: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Generic `{command:"response", value}`.
    pub fn response(value: Option<String>) -> Self {
        Self {
            command: "response".to_string(),
            key: None,
            value,
        }
    }

    /// `{command:"response", key:"error", value:<message>}`.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("response").with_key("error").with_value(message)
    }

    /// `{command:"<command>.response", key:"ack", value:"ok"}`.
    pub fn ack(command: &str) -> Self {
        Self::reply(command, "ack", "ok")
    }

    /// `{command:"<command>.response", key, value}`.
    pub fn reply(command: &str, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(format!("{command}.response"))
            .with_key(key)
            .with_value(value)
    }

    pub fn is_error(&self) -> bool {
        self.command == "response" && self.key.as_deref() == Some("error")
    }

    /// Serialized frame including the trailing newline.
    pub fn to_frame(&self) -> Vec<u8> {
        // A struct of strings always serializes.
        let mut bytes = serde_json::to_vec(self).unwrap_or_default();
        bytes.push(b'\n');
        bytes
    }
}

/// One unit cut from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Vec<u8>),
    TooLong,
}

/// Cuts a byte stream into frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Set after an oversized line was reported; its remaining bytes are
    /// dropped up to the next newline.
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes from one read and return every frame they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        let mut data = data;
        if self.discarding {
            match data.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.discarding = false;
                    data = &data[pos + 1..];
                }
                None => return Vec::new(),
            }
        }

        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_MESSAGE_BYTES {
                frames.push(Frame::TooLong);
            } else {
                frames.push(Frame::Message(line.to_vec()));
            }
        }

        if self.buf.trim_ascii().is_empty() {
            return frames;
        }

        // Unterminated tail: hand it over once it is a whole object, or
        // once it can never become one.
        match serde_json::from_slice::<serde_json::Value>(&self.buf) {
            Err(e) if e.is_eof() => {
                if self.buf.len() > MAX_MESSAGE_BYTES {
                    self.buf.clear();
                    self.discarding = true;
                    frames.push(Frame::TooLong);
                }
            }
            _ => frames.push(Frame::Message(std::mem::take(&mut self.buf))),
        }

        frames
    }
}
