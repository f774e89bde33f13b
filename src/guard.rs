//! Path-traversal, IPC-authorization, and message-reference guards.
//!
//! The path guard is grounded verbatim on
//! `acp/worker.rs::SpacebotAcpClient::resolve_path` (canonicalize, then
//! `starts_with` the workspace root). The authorization and reference
//! predicates are new small pure functions in the same style as
//! `cron/scheduler.rs::hour_in_active_window` — table-driven, no I/O.

use crate::error::IpcError;
use crate::{Jid, Message, RegisteredGroup};
use std::path::{Path, PathBuf};

/// Resolve `path` against `workspace_root`, rejecting anything that escapes
/// the root after canonicalization. Mirrors the ACP worker's file-tool guard:
/// existing paths are canonicalized directly; paths that don't exist yet are
/// resolved via their (existing) parent directory.
pub fn resolve_path(workspace_root: &Path, path: &Path) -> crate::error::Result<PathBuf> {
    let canonical_root = workspace_root
        .canonicalize()
        .unwrap_or_else(|_| workspace_root.to_path_buf());

    let candidate = if path.exists() {
        path.canonicalize().map_err(|source| {
            crate::error::Error::Other(anyhow::anyhow!(
                "failed to canonicalize path {}: {source}",
                path.display()
            ))
        })?
    } else {
        let parent = path.parent().ok_or_else(|| IpcError::PathTraversal {
            path: path.display().to_string(),
            root: canonical_root.display().to_string(),
        })?;
        let canonical_parent = parent.canonicalize().map_err(|_| IpcError::PathTraversal {
            path: path.display().to_string(),
            root: canonical_root.display().to_string(),
        })?;
        let file_name = path.file_name().ok_or_else(|| IpcError::PathTraversal {
            path: path.display().to_string(),
            root: canonical_root.display().to_string(),
        })?;
        canonical_parent.join(file_name)
    };

    if !candidate.starts_with(&canonical_root) {
        return Err(IpcError::PathTraversal {
            path: candidate.display().to_string(),
            root: canonical_root.display().to_string(),
        }
        .into());
    }

    Ok(candidate)
}

/// Whether a task originating from `source_group` may address `target_jid`.
///
/// Per spec: a non-main group may only address its own chat; main may
/// address any registered chat.
pub fn is_authorized_target(source_group: &RegisteredGroup, target_jid: &Jid) -> bool {
    source_group.is_main() || &source_group.jid == target_jid
}

/// Message-reference validation mode carried on IPC tasks that act on a
/// prior message (react, edit, delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceMode {
    /// The reference must match a specific timestamp exactly.
    Exact,
    /// The reference must resolve to a message the bot itself sent.
    Own,
    /// Any existing message in the chat satisfies the reference.
    Any,
}

/// Validate a resolved message reference against its requested mode.
pub fn validate_reference(mode: ReferenceMode, message: Option<&Message>) -> bool {
    match (mode, message) {
        (_, None) => false,
        (ReferenceMode::Exact, Some(_)) => true,
        (ReferenceMode::Own, Some(message)) => message.is_from_me,
        (ReferenceMode::Any, Some(_)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn group(jid: &str, is_main: bool) -> RegisteredGroup {
        RegisteredGroup {
            jid: Jid::new(jid),
            display_name: "g".to_string(),
            folder: if is_main { "main".to_string() } else { "other".to_string() },
            server_folder: None,
            trigger: Regex::new("@bot").unwrap(),
            requires_trigger: false,
            added_at: chrono::Utc::now(),
            backend: None,
            container: None,
        }
    }

    fn message(is_from_me: bool) -> Message {
        Message {
            id: "1".to_string(),
            chat_jid: Jid::new("slack:C1"),
            sender: "u1".to_string(),
            sender_name: "User".to_string(),
            content: "hi".to_string(),
            timestamp: chrono::Utc::now(),
            source_timestamp: Some(1),
            is_from_me,
            is_bot: false,
        }
    }

    #[test]
    fn main_group_may_address_any_chat() {
        let main = group("slack:main", true);
        assert!(is_authorized_target(&main, &Jid::new("slack:other")));
    }

    #[test]
    fn non_main_group_may_only_address_its_own_chat() {
        let g = group("slack:C1", false);
        assert!(is_authorized_target(&g, &Jid::new("slack:C1")));
        assert!(!is_authorized_target(&g, &Jid::new("slack:C2")));
    }

    #[test]
    fn own_mode_requires_is_from_me() {
        assert!(validate_reference(ReferenceMode::Own, Some(&message(true))));
        assert!(!validate_reference(ReferenceMode::Own, Some(&message(false))));
    }

    #[test]
    fn any_and_exact_accept_any_resolved_message() {
        assert!(validate_reference(ReferenceMode::Any, Some(&message(false))));
        assert!(validate_reference(ReferenceMode::Exact, Some(&message(false))));
    }

    #[test]
    fn unresolved_reference_is_never_valid() {
        assert!(!validate_reference(ReferenceMode::Any, None));
    }

    #[test]
    fn resolve_path_rejects_traversal_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let escape = root.join("../escape.txt");
        let result = resolve_path(root, &escape);
        assert!(result.is_err());
    }

    #[test]
    fn resolve_path_accepts_path_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let inside = root.join("subdir/file.txt");
        let resolved = resolve_path(root, &inside).unwrap();
        assert!(resolved.starts_with(root.canonicalize().unwrap()));
    }
}
