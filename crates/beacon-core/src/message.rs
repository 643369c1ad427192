//! Broadcast payloads and outbound frames.
//!
//! A [`Message`] is whatever a producer submitted: opaque bytes with no
//! required structure. Before fan-out it is turned into a [`Frame`] exactly
//! once; the frame is what every subscriber connection receives.

use std::fmt;
use std::str;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

/// Maximum number of characters shown by [`Message::preview`].
const PREVIEW_CHARS: usize = 120;

// ============================================================================
// Message
// ============================================================================

/// An immutable broadcast payload (text or JSON).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    body: Bytes,
}

impl Message {
    /// Creates a message from raw bytes.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self { body: body.into() }
    }

    /// Creates a message from text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            body: Bytes::from(text.into()),
        }
    }

    /// Returns the raw payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Returns a lossy, length-limited rendering for log lines.
    pub fn preview(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        let mut chars = text.chars();
        let mut preview: String = chars.by_ref().take(PREVIEW_CHARS).collect();
        if chars.next().is_some() {
            preview.push('…');
        }
        preview
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

// ============================================================================
// Frame
// ============================================================================

/// Errors building an outbound frame from a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Event streams carry text only
    #[error("message is not valid UTF-8 (invalid byte at offset {offset})")]
    NotUtf8 { offset: usize },

    /// A carriage return would terminate the `data:` field early
    #[error("message contains a carriage return at offset {offset}")]
    CarriageReturn { offset: usize },
}

/// A message validated for the event-stream `data:` field.
///
/// Cloning is cheap; the same frame is handed to every subscriber of one
/// fan-out. Newlines are allowed and become multiple `data:` lines on the
/// wire, which clients join back together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Arc<str>,
}

impl Frame {
    /// Validates a message and builds its frame.
    ///
    /// # Errors
    ///
    /// - `FrameError::NotUtf8` if the payload is not UTF-8
    /// - `FrameError::CarriageReturn` if the payload contains `\r`
    pub fn encode(message: &Message) -> Result<Self, FrameError> {
        let text = str::from_utf8(message.as_bytes()).map_err(|e| FrameError::NotUtf8 {
            offset: e.valid_up_to(),
        })?;
        Self::from_text(text)
    }

    /// Validates text and builds its frame.
    pub fn from_text(text: &str) -> Result<Self, FrameError> {
        if let Some(offset) = text.find('\r') {
            return Err(FrameError::CarriageReturn { offset });
        }
        Ok(Self { data: text.into() })
    }

    /// Returns the frame payload.
    pub fn as_str(&self) -> &str {
        &self.data
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.data)
    }
}
