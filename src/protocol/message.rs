//! Message type definitions
//!
//! A single `Message` record travels in both directions. The `kind` tag says
//! what the record means; the optional fields carry whatever that kind needs.

use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::{current_timestamp, generate_message_id};

/// Sender name stamped on messages the server generates itself
pub const SERVER_SENDER: &str = "SERVER";

/// Discriminant for every message on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Login,
    Logout,
    DirectMessage,
    GroupMessage,
    FileTransfer,
    CreateGroup,
    JoinGroup,
    Status,
    Success,
    Error,
}

/// Where an addressed message is going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination<'a> {
    User(&'a str),
    Group(&'a str),
}

/// Wire-level unit of communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_bytes: Option<Vec<u8>>,
    pub ok: bool,
    pub timestamp: u64,
}

impl Message {
    /// Create a bare message of the given kind from `sender`
    pub fn new(kind: MessageKind, sender: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            kind,
            sender: sender.into(),
            recipient: None,
            group_name: None,
            content: None,
            file_name: None,
            file_bytes: None,
            ok: true,
            timestamp: current_timestamp(),
        }
    }

    /// Create a server-originated message
    pub fn from_server(kind: MessageKind) -> Self {
        Self::new(kind, SERVER_SENDER)
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_group(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_file(mut self, file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.file_name = Some(file_name.into());
        self.file_bytes = Some(bytes.into());
        self
    }

    /// Mark a reply as failed
    pub fn failed(mut self) -> Self {
        self.ok = false;
        self
    }

    pub fn login(name: impl Into<String>) -> Self {
        Self::new(MessageKind::Login, name)
    }

    pub fn logout(name: impl Into<String>) -> Self {
        Self::new(MessageKind::Logout, name)
    }

    pub fn direct(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::DirectMessage, sender)
            .with_recipient(recipient)
            .with_content(content)
    }

    pub fn group(
        sender: impl Into<String>,
        group_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::GroupMessage, sender)
            .with_group(group_name)
            .with_content(content)
    }

    pub fn file_to_user(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        file_name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(MessageKind::FileTransfer, sender)
            .with_recipient(recipient)
            .with_file(file_name, bytes)
    }

    pub fn file_to_group(
        sender: impl Into<String>,
        group_name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(MessageKind::FileTransfer, sender)
            .with_group(group_name)
            .with_file(file_name, bytes)
    }

    pub fn create_group(sender: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self::new(MessageKind::CreateGroup, sender).with_group(group_name)
    }

    pub fn join_group(sender: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self::new(MessageKind::JoinGroup, sender).with_group(group_name)
    }

    /// Server acknowledgement
    pub fn success(content: impl Into<String>) -> Self {
        Self::from_server(MessageKind::Success).with_content(content)
    }

    /// Server failure reply, always `ok == false`
    pub fn error(content: impl Into<String>) -> Self {
        Self::from_server(MessageKind::Error)
            .with_content(content)
            .failed()
    }

    /// Resolve the single destination of an addressed message.
    ///
    /// Returns `None` when neither or both of `recipient` and `group_name`
    /// are set.
    pub fn destination(&self) -> Option<Destination<'_>> {
        match (self.recipient.as_deref(), self.group_name.as_deref()) {
            (Some(user), None) => Some(Destination::User(user)),
            (None, Some(group)) => Some(Destination::Group(group)),
            _ => None,
        }
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

impl From<ChatError> for Message {
    fn from(err: ChatError) -> Self {
        Message::error(err.to_string())
    }
}
