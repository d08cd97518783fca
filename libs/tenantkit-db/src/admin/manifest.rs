//! Versioned migration sets read from a journal directory.
//!
//! Layout:
//!
//! ```text
//! <dir>/meta/_journal.json
//! <dir>/0000_create_notes.sql
//! <dir>/0001_add_archived.sql
//! ```
//!
//! The journal lists entries as `{"idx": 0, "tag": "0000_create_notes", "when": 1718000000000}`.
//! Entries are applied in `idx` order. A body may hold several statements
//! separated by `--> statement-breakpoint` lines.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Relative location of the journal inside a migrations directory.
pub const JOURNAL_PATH: &str = "meta/_journal.json";

/// Separator between statements inside one migration body.
pub const STATEMENT_BREAKPOINT: &str = "--> statement-breakpoint";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed journal {path}: {source}")]
    Journal {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("journal references '{tag}' but {path} does not exist")]
    MissingFile { tag: String, path: PathBuf },

    #[error("duplicate migration tag '{0}'")]
    DuplicateTag(String),

    #[error("duplicate journal index {0}")]
    DuplicateIndex(u32),

    #[error("invalid migration tag '{0}': only letters, digits, '_', '-' and '.' are allowed")]
    InvalidTag(String),

    #[error("migration '{0}' has an empty body")]
    EmptyBody(String),

    #[error("migration set is empty")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct Journal {
    entries: Vec<JournalEntry>,
}

#[derive(Debug, Deserialize)]
struct JournalEntry {
    idx: u32,
    tag: String,
    #[serde(default = "default_breakpoints")]
    breakpoints: bool,
}

fn default_breakpoints() -> bool {
    true
}

/// One migration: a tag plus the statements it runs.
#[derive(Clone, PartialEq, Eq)]
pub struct MigrationEntry {
    tag: String,
    statements: Vec<String>,
    checksum: String,
}

impl MigrationEntry {
    /// Build an entry from a raw body, splitting on [`STATEMENT_BREAKPOINT`].
    ///
    /// # Errors
    /// Returns `ManifestError::InvalidTag` or `ManifestError::EmptyBody`.
    pub fn new(tag: impl Into<String>, body: &str) -> Result<Self, ManifestError> {
        Self::build(tag.into(), body, true)
    }

    fn build(tag: String, body: &str, split: bool) -> Result<Self, ManifestError> {
        check_tag(&tag)?;
        let statements: Vec<String> = if split {
            body.split(STATEMENT_BREAKPOINT)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        } else {
            Some(body.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .into_iter()
                .collect()
        };
        if statements.is_empty() {
            return Err(ManifestError::EmptyBody(tag));
        }
        let checksum = hex::encode(Sha256::digest(body.as_bytes()));
        Ok(Self {
            tag,
            statements,
            checksum,
        })
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[must_use]
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Hex SHA-256 of the raw body.
    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

impl fmt::Debug for MigrationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationEntry")
            .field("tag", &self.tag)
            .field("statements", &self.statements.len())
            .field("checksum", &self.checksum)
            .finish()
    }
}

/// Ordered, duplicate-free list of migrations.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    entries: Vec<MigrationEntry>,
}

impl MigrationSet {
    /// Build a set from entries already in apply order.
    ///
    /// # Errors
    /// Returns `ManifestError::DuplicateTag` or `ManifestError::Empty`.
    pub fn from_entries(entries: Vec<MigrationEntry>) -> Result<Self, ManifestError> {
        if entries.is_empty() {
            return Err(ManifestError::Empty);
        }
        let mut seen = HashSet::new();
        for e in &entries {
            if !seen.insert(e.tag.as_str()) {
                return Err(ManifestError::DuplicateTag(e.tag.clone()));
            }
        }
        Ok(Self { entries })
    }

    /// Load `<dir>/meta/_journal.json` and every body it references.
    ///
    /// # Errors
    /// Returns a `ManifestError` for unreadable or malformed files, a tag
    /// without a body file, or duplicate tags and indexes.
    pub fn load(dir: &Path) -> Result<Self, ManifestError> {
        let journal_path = dir.join(JOURNAL_PATH);
        let raw = std::fs::read_to_string(&journal_path).map_err(|source| ManifestError::Io {
            path: journal_path.clone(),
            source,
        })?;
        let mut journal: Journal =
            serde_json::from_str(&raw).map_err(|source| ManifestError::Journal {
                path: journal_path.clone(),
                source,
            })?;

        journal.entries.sort_by_key(|e| e.idx);
        if let Some(pair) = journal.entries.windows(2).find(|w| w[0].idx == w[1].idx) {
            return Err(ManifestError::DuplicateIndex(pair[0].idx));
        }

        let mut entries = Vec::with_capacity(journal.entries.len());
        for item in journal.entries {
            check_tag(&item.tag)?;
            let path = dir.join(format!("{}.sql", item.tag));
            let body = match std::fs::read_to_string(&path) {
                Ok(body) => body,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ManifestError::MissingFile {
                        tag: item.tag,
                        path,
                    });
                }
                Err(source) => return Err(ManifestError::Io { path, source }),
            };
            entries.push(MigrationEntry::build(item.tag, &body, item.breakpoints)?);
        }

        let set = Self::from_entries(entries)?;
        tracing::debug!(dir = %dir.display(), entries = set.len(), "loaded migration set");
        Ok(set)
    }

    #[must_use]
    pub fn entries(&self) -> &[MigrationEntry] {
        &self.entries
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(MigrationEntry::tag)
    }

    #[must_use]
    pub fn tag_set(&self) -> BTreeSet<String> {
        self.tags().map(str::to_owned).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Tags double as file names, so path separators and leading dots are out.
fn check_tag(tag: &str) -> Result<(), ManifestError> {
    let ok = !tag.is_empty()
        && !tag.starts_with('.')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(ManifestError::InvalidTag(tag.to_owned()))
    }
}
