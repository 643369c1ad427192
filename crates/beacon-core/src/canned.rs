//! Canned message table.
//!
//! Canned messages are JSON documents stored one per file in an event
//! directory. The table is built once at startup, validated up front, and
//! never mutated afterwards, so it can be shared behind an `Arc` and read
//! from any task without locking.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::IgnoredAny;
use thiserror::Error;
use tracing::{debug, info};

use crate::message::{Frame, Message};

/// File extension stripped from file names when deriving keys.
const JSON_EXTENSION: &str = ".json";

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while loading the canned message table.
///
/// Every variant is a startup fault: the hub refuses to serve with a
/// partially loaded table.
#[derive(Debug, Error)]
pub enum CannedError {
    #[error("Failed to read event directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read event file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid JSON in event file {path}: {source}")]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Event file {path} cannot be sent as a stream event: {reason}")]
    Unencodable { path: PathBuf, reason: String },

    #[error("Duplicate canned message key '{key}' ({path})")]
    DuplicateKey { key: String, path: PathBuf },
}

/// Keys that were requested but are not in the table.
///
/// The display form is what the operator sees: the rejected keys followed
/// by every key that is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKeys {
    pub unknown: Vec<String>,
    pub available: Vec<String>,
}

impl fmt::Display for UnknownKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown keys [{}]. available keys: [{}]",
            self.unknown.join(", "),
            self.available.join(", ")
        )
    }
}

impl std::error::Error for UnknownKeys {}

// ============================================================================
// Canned Messages
// ============================================================================

/// Immutable mapping from key to validated JSON text.
#[derive(Debug, Clone, Default)]
pub struct CannedMessages {
    entries: BTreeMap<String, String>,
}

impl CannedMessages {
    /// Loads every regular file in `dir` as a canned message.
    ///
    /// Keys are the lower-cased file names with a trailing `.json` removed.
    /// Sub-directories and dot-files are skipped.
    ///
    /// # Errors
    ///
    /// Fails on the first unreadable entry, invalid JSON document,
    /// unencodable document or key collision.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, CannedError> {
        let dir = dir.as_ref();
        let read_dir = fs::read_dir(dir).map_err(|source| CannedError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut entries = BTreeMap::new();

        for entry in read_dir {
            let entry = entry.map_err(|source| CannedError::ReadDir {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();

            let file_type = entry.file_type().map_err(|source| CannedError::ReadFile {
                path: path.clone(),
                source,
            })?;
            if file_type.is_dir() {
                debug!(path = %path.display(), "Skipping directory in event dir");
                continue;
            }

            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') {
                debug!(path = %path.display(), "Skipping hidden file in event dir");
                continue;
            }

            let raw = fs::read_to_string(&path).map_err(|source| CannedError::ReadFile {
                path: path.clone(),
                source,
            })?;
            let body = validate_document(&path, &raw)?;

            let key = key_for(&file_name);
            if entries.contains_key(&key) {
                return Err(CannedError::DuplicateKey { key, path });
            }

            debug!(key = %key, bytes = body.len(), "Loaded canned message");
            entries.insert(key, body);
        }

        info!(
            dir = %dir.display(),
            count = entries.len(),
            "Canned message table loaded"
        );

        Ok(Self { entries })
    }

    /// Builds a table from in-memory `(key, json)` pairs.
    ///
    /// Applies the same normalization and validation as [`load`](Self::load);
    /// the key is used as the "path" in error messages.
    pub fn from_entries<I, K, V>(pairs: I) -> Result<Self, CannedError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut entries = BTreeMap::new();
        for (key, raw) in pairs {
            let key = key_for(key.as_ref());
            let body = validate_document(Path::new(&key), raw.as_ref())?;
            if entries.contains_key(&key) {
                return Err(CannedError::DuplicateKey {
                    path: PathBuf::from(&key),
                    key,
                });
            }
            entries.insert(key, body);
        }
        Ok(Self { entries })
    }

    /// Looks up the JSON text for a key.
    ///
    /// The file name the key came from (`alerts.json`) is accepted too.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .or_else(|| self.entries.get(&key_for(key)))
            .map(String::as_str)
    }

    /// Returns all keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Returns the number of canned messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table holds no messages.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves every key to a message, all or nothing.
    ///
    /// Messages are returned in the order the keys were given. If any key
    /// is missing, no messages are returned and the error lists the missing
    /// keys together with every available key.
    pub fn resolve<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<Message>, UnknownKeys> {
        let mut messages = Vec::with_capacity(keys.len());
        let mut unknown = Vec::new();

        for key in keys {
            match self.get(key.as_ref()) {
                Some(body) => messages.push(Message::text(body)),
                None => unknown.push(key.as_ref().to_string()),
            }
        }

        if unknown.is_empty() {
            Ok(messages)
        } else {
            Err(UnknownKeys {
                unknown,
                available: self.keys(),
            })
        }
    }
}

/// Derives the lookup key from a file name.
fn key_for(file_name: &str) -> String {
    let lower = file_name.to_lowercase();
    match lower.strip_suffix(JSON_EXTENSION) {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => lower,
    }
}

/// Normalizes line endings, trims, and validates a canned JSON document.
fn validate_document(path: &Path, raw: &str) -> Result<String, CannedError> {
    let body = raw.replace("\r\n", "\n").trim().to_string();

    serde_json::from_str::<IgnoredAny>(&body).map_err(|source| CannedError::InvalidJson {
        path: path.to_path_buf(),
        source,
    })?;

    Frame::from_text(&body).map_err(|e| CannedError::Unencodable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn test_load_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alerts.json", r#"{"level":"high"}"#);
        write(dir.path(), "status.json", "{\n  \"ok\": true\n}\n");

        let table = CannedMessages::load(dir.path()).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("alerts"), Some(r#"{"level":"high"}"#));
        assert_eq!(table.get("status"), Some("{\n  \"ok\": true\n}"));
        assert_eq!(table.keys(), vec!["alerts", "status"]);
    }

    #[test]
    fn test_load_normalizes_crlf() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "windows.json", "{\r\n  \"a\": 1\r\n}\r\n");

        let table = CannedMessages::load(dir.path()).unwrap();
        assert_eq!(table.get("windows"), Some("{\n  \"a\": 1\n}"));
    }

    #[test]
    fn test_load_skips_directories_and_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        write(dir.path(), ".swap", "not json");
        write(dir.path(), "one.json", "1");

        let table = CannedMessages::load(dir.path()).unwrap();
        assert_eq!(table.keys(), vec!["one"]);
    }

    #[test]
    fn test_load_key_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Ping", r#""pong""#);

        let table = CannedMessages::load(dir.path()).unwrap();
        assert_eq!(table.get("ping"), Some(r#""pong""#));
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "broken.json", "{\"level\":");

        let err = CannedMessages::load(dir.path()).unwrap_err();
        assert!(matches!(err, CannedError::InvalidJson { .. }));
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn test_load_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = CannedMessages::load(dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, CannedError::ReadDir { .. }));
    }

    #[test]
    fn test_load_rejects_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alerts.json", "{}");
        write(dir.path(), "ALERTS", "[]");

        let err = CannedMessages::load(dir.path()).unwrap_err();
        assert!(matches!(err, CannedError::DuplicateKey { ref key, .. } if key == "alerts"));
    }

    #[test]
    fn test_from_entries_validates() {
        let err = CannedMessages::from_entries([("bad", "nope")]).unwrap_err();
        assert!(matches!(err, CannedError::InvalidJson { .. }));
    }

    #[test]
    fn test_resolve_all_keys_in_order() {
        let table =
            CannedMessages::from_entries([("a", r#"{"n":1}"#), ("b", r#"{"n":2}"#)]).unwrap();

        let messages = table.resolve(&["b", "a", "b"]).unwrap();
        let bodies: Vec<_> = messages.iter().map(|m| m.as_bytes().to_vec()).collect();
        assert_eq!(
            bodies,
            vec![
                br#"{"n":2}"#.to_vec(),
                br#"{"n":1}"#.to_vec(),
                br#"{"n":2}"#.to_vec()
            ]
        );
    }

    #[test]
    fn test_resolve_is_all_or_nothing() {
        let table = CannedMessages::from_entries([("alerts", r#"{"level":"high"}"#)]).unwrap();

        let err = table.resolve(&["alerts", "missing-file"]).unwrap_err();
        assert_eq!(err.unknown, vec!["missing-file"]);
        assert_eq!(err.available, vec!["alerts"]);

        let text = err.to_string();
        assert!(text.contains("missing-file"));
        assert!(text.contains("alerts"));
    }

    #[test]
    fn test_file_name_is_accepted_as_key() {
        let table = CannedMessages::from_entries([("alerts.json", r#"{"level":"high"}"#)]).unwrap();

        assert_eq!(table.keys(), vec!["alerts"]);
        assert_eq!(table.get("alerts.json"), Some(r#"{"level":"high"}"#));

        let messages = table.resolve(&["alerts.json", "alerts"]).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(table.resolve(&["status.json"]).is_err());
    }
}
