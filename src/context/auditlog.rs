//! Audit log index configuration.
//!
//! Each context exposes an audit log index: the file that records one
//! line per audit event written for traffic handled under that context.
//! Child contexts share the parent's index by default; the first time a
//! child sets its own index path it takes ownership of a private copy,
//! leaving the parent's untouched.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::context::ContextId;
use crate::error::{EngineError, EngineResult};

/// Default index file path, relative to the engine's working directory.
pub const DEFAULT_INDEX_PATH: &str = "audit-index.log";

struct IndexState {
    enabled: bool,
    path: PathBuf,
    file: Option<File>,
}

/// An audit log index shared down a context subtree.
pub struct AuditLogIndex {
    owner: ContextId,
    state: Mutex<IndexState>,
}

impl AuditLogIndex {
    /// Creates an index owned by `owner` pointing at `path`.
    #[must_use]
    pub fn new(owner: ContextId, path: impl Into<PathBuf>) -> Self {
        Self {
            owner,
            state: Mutex::new(IndexState {
                enabled: true,
                path: path.into(),
                file: None,
            }),
        }
    }

    /// The context that owns this index.
    #[must_use]
    pub fn owner(&self) -> ContextId {
        self.owner
    }

    /// The configured index file path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.state.lock().expect("auditlog state poisoned").path.clone()
    }

    /// Whether index writing is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().expect("auditlog state poisoned").enabled
    }

    /// Enables or disables index writing. Disabling closes any open
    /// index file.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().expect("auditlog state poisoned");
        state.enabled = enabled;
        if !enabled {
            state.file = None;
        }
    }

    /// Repoints the index at `path`.
    ///
    /// Only the owning context may call this; a non-owner gets a fresh
    /// index of its own instead (see `Context::set_auditlog_index`). If
    /// the path actually changes, any open file handle is closed so the
    /// next write reopens at the new location.
    pub(crate) fn set_path(&self, path: &Path) {
        let mut state = self.state.lock().expect("auditlog state poisoned");
        if state.path == path {
            return;
        }
        if state.file.take().is_some() {
            debug!(
                old = %state.path.display(),
                new = %path.display(),
                "audit index repointed, closed open index file"
            );
        }
        state.path = path.to_path_buf();
    }

    /// Opens the index file if it is not already open.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] if the index is disabled,
    /// or [`EngineError::Alloc`] if the file cannot be opened.
    pub fn open_index_file(&self) -> EngineResult<()> {
        let mut state = self.state.lock().expect("auditlog state poisoned");
        if !state.enabled {
            return Err(EngineError::InvalidState {
                current: "disabled".to_string(),
                expected: "enabled".to_string(),
            });
        }
        if state.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&state.path)
            .map_err(|e| {
                EngineError::Alloc(format!(
                    "cannot open audit index '{}': {e}",
                    state.path.display()
                ))
            })?;
        state.file = Some(file);
        Ok(())
    }

    /// Appends one line to the index file, opening it on first use.
    ///
    /// # Errors
    ///
    /// Propagates [`AuditLogIndex::open_index_file`] failures, plus
    /// [`EngineError::Alloc`] on write failure.
    pub fn write_line(&self, line: &str) -> EngineResult<()> {
        self.open_index_file()?;
        let mut state = self.state.lock().expect("auditlog state poisoned");
        let path = state.path.clone();
        if let Some(file) = state.file.as_mut() {
            writeln!(file, "{line}").map_err(|e| {
                EngineError::Alloc(format!("cannot write audit index '{}': {e}", path.display()))
            })?;
        }
        Ok(())
    }

    /// Closes the index file if open. Writing again reopens it.
    pub fn close_index_file(&self) {
        let mut state = self.state.lock().expect("auditlog state poisoned");
        state.file = None;
    }

    /// Whether the index file is currently open.
    #[must_use]
    pub fn is_index_open(&self) -> bool {
        self.state.lock().expect("auditlog state poisoned").file.is_some()
    }
}

impl std::fmt::Debug for AuditLogIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("auditlog state poisoned");
        f.debug_struct("AuditLogIndex")
            .field("owner", &self.owner)
            .field("path", &state.path)
            .field("enabled", &state.enabled)
            .field("open", &state.file.is_some())
            .finish()
    }
}
