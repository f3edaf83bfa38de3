//! Conversation identity derived from log file paths.
//!
//! Conversation logs live at `<root>/<project-slug>/<stem>.jsonl`. The
//! conversation id is the log's path relative to the watch root with the
//! extension removed (`<project-slug>/<stem>`), so logs that share a stem in
//! different projects stay distinct. The project path is the first directory
//! below the root with percent-encoding decoded.
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use chatpulse_monitor::utils::session_filename::conversation_identity;
//!
//! let root = Path::new("/home/user/.claude/projects");
//! let path = root.join("-home-user-my%20app/6e45a55c-3124-4cc8-ad85-040a5c316009.jsonl");
//! let identity = conversation_identity(root, &path).unwrap();
//! assert_eq!(identity.id, "-home-user-my%20app/6e45a55c-3124-4cc8-ad85-040a5c316009");
//! assert_eq!(identity.project_path, "-home-user-my app");
//! ```

use std::path::{Component, Path};

/// File extension of conversation logs.
pub const CONVERSATION_EXTENSION: &str = "jsonl";

/// Separator between path segments of a conversation id.
pub const ID_SEPARATOR: char = '/';

/// Identity of the conversation stored in one log file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationIdentity {
    pub id: String,
    pub project_path: String,
}

/// Returns `true` if `path` names a conversation log.
#[must_use]
pub fn is_conversation_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == CONVERSATION_EXTENSION)
}

/// Derives the identity of the log at `path` watched from `root`.
///
/// Paths outside `root` fall back to `<parent-dir>/<stem>`. Returns `None`
/// if the path is not a `.jsonl` file or a segment is not valid UTF-8.
#[must_use]
pub fn conversation_identity(root: &Path, path: &Path) -> Option<ConversationIdentity> {
    if !is_conversation_file(path) {
        return None;
    }

    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() {
        return None;
    }

    let relative = path.strip_prefix(root).ok();
    let mut dirs: Vec<&str> = match relative.and_then(Path::parent) {
        Some(parent) => parent
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name.to_str()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?,
        None => path
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_str())
            .into_iter()
            .collect::<Option<Vec<_>>>()?,
    };

    let project_path = dirs.first().map(|d| percent_decode(d)).unwrap_or_default();

    dirs.push(stem);
    let id = dirs.join(&ID_SEPARATOR.to_string());

    Some(ConversationIdentity { id, project_path })
}

/// Decodes `%XX` sequences. Invalid sequences are kept verbatim and
/// decoded bytes that do not form UTF-8 are replaced.
#[must_use]
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(byte) = hex {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const ROOT: &str = "/home/user/.claude/projects";

    fn identity(rel: &str) -> Option<ConversationIdentity> {
        let root = Path::new(ROOT);
        conversation_identity(root, &root.join(rel))
    }

    #[test]
    fn identity_from_claude_projects_layout() {
        let identity = identity("-home-user-myproject/a1b2c3d4-e5f6-7890-abcd-ef1234567890.jsonl").unwrap();

        assert_eq!(identity.id, "-home-user-myproject/a1b2c3d4-e5f6-7890-abcd-ef1234567890");
        assert_eq!(identity.project_path, "-home-user-myproject");
    }

    #[test]
    fn same_stem_in_different_projects_has_distinct_ids() {
        let a = identity("proj-a/session.jsonl").unwrap();
        let b = identity("proj-b/session.jsonl").unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.id, "proj-a/session");
        assert_eq!(b.project_path, "proj-b");
    }

    #[test]
    fn nested_logs_keep_full_relative_id() {
        let identity = identity("proj/abc/subagents/agent-1.jsonl").unwrap();

        assert_eq!(identity.id, "proj/abc/subagents/agent-1");
        assert_eq!(identity.project_path, "proj");
    }

    #[test]
    fn log_directly_under_root_has_no_project() {
        let identity = identity("loose.jsonl").unwrap();

        assert_eq!(identity.id, "loose");
        assert_eq!(identity.project_path, "");
    }

    #[test]
    fn path_outside_root_falls_back_to_parent_dir() {
        let identity =
            conversation_identity(Path::new("/elsewhere"), Path::new("/tmp/proj/abc.jsonl")).unwrap();

        assert_eq!(identity.id, "proj/abc");
        assert_eq!(identity.project_path, "proj");
    }

    #[test]
    fn identity_decodes_project_path() {
        let identity = identity("%2Fsrv%2Fapp/abc.jsonl").unwrap();
        assert_eq!(identity.project_path, "/srv/app");
        assert_eq!(identity.id, "%2Fsrv%2Fapp/abc");
    }

    #[test]
    fn non_jsonl_files_have_no_identity() {
        assert!(identity("proj/abc.json").is_none());
        assert!(identity("proj/abc").is_none());
        assert!(identity("proj/.jsonl").is_none());
    }

    #[test]
    fn is_conversation_file_checks_extension_only() {
        assert!(is_conversation_file(&PathBuf::from("x.jsonl")));
        assert!(!is_conversation_file(&PathBuf::from("x.jsonl.tmp")));
        assert!(!is_conversation_file(&PathBuf::from("x.JSONL")));
    }

    #[test]
    fn percent_decode_handles_multibyte_sequences() {
        assert_eq!(percent_decode("caf%C3%A9"), "café");
    }

    #[test]
    fn percent_decode_keeps_invalid_sequences() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz-ok"), "%zz-ok");
        assert_eq!(percent_decode("%4"), "%4");
    }
}
