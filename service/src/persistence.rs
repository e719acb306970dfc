//! Disk persistence for project metadata.
//!
//! ## Layout
//!
//! ```text
//! <projects_dir>/
//!   projects.json   { "<id>": ProjectMeta, ... }
//!   <id>/           project root (created by `create_project`)
//! ```
//!
//! Lifecycle state is deliberately absent: every project comes back
//! `Stopped` after a supervisor restart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::project::Project;

/// Metadata file name inside the projects directory.
pub const METADATA_FILE: &str = "projects.json";

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One persisted project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub id: String,
    pub root: PathBuf,
    pub run_command: String,
    pub created_at: DateTime<Utc>,
    /// Pid of the child while it was running; cleared on stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pid: Option<u32>,
}

impl ProjectMeta {
    pub fn from_project(project: &Project, last_pid: Option<u32>) -> Self {
        Self {
            id: project.id.clone(),
            root: project.root.clone(),
            run_command: project.run_command.clone(),
            created_at: project.created_at,
            last_pid,
        }
    }

    pub fn into_project(self) -> Project {
        Project {
            id: self.id,
            root: self.root,
            run_command: self.run_command,
            created_at: self.created_at,
        }
    }
}

/// Persistent store for `projects.json`.
pub struct PersistenceStore {
    base_dir: PathBuf,
}

impl PersistenceStore {
    /// Create a store rooted at `base_dir`, creating the directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.base_dir.join(METADATA_FILE)
    }

    /// Atomically write `data` to `path` via a `.tmp` sibling.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read back every persisted project. A missing file is an empty map.
    pub fn load(&self) -> Result<BTreeMap<String, ProjectMeta>, PersistenceError> {
        let data = match std::fs::read_to_string(self.metadata_path()) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if data.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&data)?)
    }

    /// Replace the persisted set with `projects`.
    pub fn save(&self, projects: &BTreeMap<String, ProjectMeta>) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(projects)?;
        self.atomic_write(&self.metadata_path(), json.as_bytes())
    }
}
