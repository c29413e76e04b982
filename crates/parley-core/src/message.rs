//! Delivered message records.
//!
//! A [`DeliveredMessage`] is created once a send or receive has fully
//! completed and is never modified afterwards. Sessions append them to their
//! history in delivery order, and the same record is handed to the display
//! collaborator.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::peer::PeerId;
use crate::session_name::SessionName;

/// What a message carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    File,
}

impl ContentKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }
}

/// Whether the local peer sent or received the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

/// Immutable record of a completed send or receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    session: SessionName,
    sender: PeerId,
    direction: Direction,
    kind: ContentKind,
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    size: u64,
    at: DateTime<Local>,
}

impl DeliveredMessage {
    /// A text message.
    pub fn text(
        session: SessionName,
        sender: PeerId,
        direction: Direction,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        let size = text.len() as u64;
        Self {
            session,
            sender,
            direction,
            kind: ContentKind::Text,
            text,
            path: None,
            size,
            at: Local::now(),
        }
    }

    /// An image or file. `name` is the resource name carried on the wire and
    /// `path` is where the bytes were read from (sent) or written to
    /// (received).
    pub fn attachment(
        session: SessionName,
        sender: PeerId,
        direction: Direction,
        kind: ContentKind,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        size: u64,
    ) -> Self {
        Self {
            session,
            sender,
            direction,
            kind,
            text: name.into(),
            path: Some(path.into()),
            size,
            at: Local::now(),
        }
    }

    pub fn session(&self) -> &SessionName {
        &self.session
    }

    pub fn sender(&self) -> PeerId {
        self.sender
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    /// Text content, or the resource name for images and files.
    pub fn text_content(&self) -> &str {
        &self.text
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Payload size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn at(&self) -> DateTime<Local> {
        self.at
    }

    /// One-line human summary, e.g. for a terminal transcript.
    pub fn summary(&self) -> String {
        let when = self.at.format("%Y-%m-%d %H:%M:%S");
        match (self.kind, self.direction) {
            (ContentKind::Text, _) => format!("[{}] {}: {}", when, self.sender, self.text),
            (kind, Direction::Sent) => format!(
                "[{}] {}: {} {} sent ({} bytes)",
                when,
                self.sender,
                kind.label(),
                self.text,
                self.size
            ),
            (kind, Direction::Received) => format!(
                "[{}] {}: {} received, saved to {} ({} bytes)",
                when,
                self.sender,
                kind.label(),
                self.path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| self.text.clone()),
                self.size
            ),
        }
    }
}
