//! NanoClaw: a message-driven agent orchestrator.
//!
//! External chat channels deliver messages addressed to registered chats.
//! For each chat, the orchestrator materializes a sandboxed agent process,
//! feeds it the incoming prompt, streams its output back to the originating
//! channel, and manages its lifecycle (idle timeouts, retries, cancellation).

pub mod api;
pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod guard;
pub mod ipc;
pub mod orchestrator;
pub mod parser;
pub mod queue;
pub mod store;
#[cfg(feature = "metrics")]
pub mod telemetry;

pub use error::{Error, Result};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque chat identifier, prefix-tagged by channel scheme
/// (`whatsapp:…`, `signal:…`, `slack:…`, `tg:…`, `discord:…`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Jid(pub Arc<str>);

impl Jid {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    /// The scheme prefix before the first `:` (e.g. `"slack"` for `"slack:C123"`).
    pub fn scheme(&self) -> &str {
        self.0.split_once(':').map(|(scheme, _)| scheme).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Jid {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for Jid {
    fn from(value: String) -> Self {
        Self(Arc::from(value.as_str()))
    }
}

/// Per-group container overrides (timeout, additional mounts).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerOverrides {
    pub timeout_secs: Option<u64>,
    pub additional_mounts: Vec<MountSpec>,
}

/// A single additional bind mount for a group's container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: std::path::PathBuf,
    pub container_path: std::path::PathBuf,
    pub read_only: bool,
}

/// A registered chat, mapping a [`Jid`] to its filesystem/workspace identity
/// and agent-dispatch configuration.
///
/// Invariants: `folder` is globally unique and injective onto `jid`; `folder`
/// must not traverse outside the groups root (enforced by [`guard`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub jid: Jid,
    pub display_name: String,
    /// Filesystem-safe slug; unique across all registered groups.
    pub folder: String,
    /// Optional shared dev-server bundle folder.
    pub server_folder: Option<String>,
    #[serde(with = "regex_serde")]
    pub trigger: Regex,
    pub requires_trigger: bool,
    pub added_at: chrono::DateTime<chrono::Utc>,
    pub backend: Option<String>,
    pub container: Option<ContainerOverrides>,
}

impl RegisteredGroup {
    /// The privileged group whose IPC may target any chat and invoke admin actions.
    pub fn is_main(&self) -> bool {
        self.folder == "main"
    }
}

mod regex_serde {
    use regex::Regex;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Regex, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Regex, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Regex::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// A single message in a chat's append-only history. `(chat_jid, id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_jid: Jid,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Platform-native numeric timestamp, when available.
    pub source_timestamp: Option<i64>,
    pub is_from_me: bool,
    pub is_bot: bool,
}

/// Inbound message from any channel adapter, already bound to a [`Jid`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub chat_jid: Jid,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub source_timestamp: Option<i64>,
    pub is_from_me: bool,
    pub is_bot: bool,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Outbound response routed back through the owning channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundResponse {
    Text(String),
    Reaction {
        target_author: Option<String>,
        target_timestamp: String,
        emoji: String,
    },
    RemoveReaction {
        target_author: Option<String>,
        target_timestamp: String,
        emoji: String,
    },
    Edit {
        target_author: Option<String>,
        target_timestamp: String,
        text: String,
    },
    Delete {
        target_author: Option<String>,
        target_timestamp: String,
    },
    Poll {
        question: String,
        options: Vec<String>,
    },
    Typing(bool),
}
