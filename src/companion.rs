//! OBB companion data relocation
//!
//! An OBB directory is named after the package it belongs to and holds
//! payload files that embed the same name (`com.studio.game/main.1.com.studio.game.obb`).
//! After a package rename, both the files and the directory must follow the
//! new identifier. The token that gets replaced is the directory's own name,
//! which is not necessarily the manifest's old package.
//!
//! Relocation is planned first: every target path is computed and checked
//! before anything is renamed. Files are renamed before the directory, and
//! the first failure rolls back every rename already applied.

use crate::error::{SideloadError, SideloadResult};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Root directory plus the payload files directly inside it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompanionDataSet {
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
}

impl CompanionDataSet {
    /// List the regular files directly inside `root`, sorted by name
    pub fn discover(root: impl AsRef<Path>) -> SideloadResult<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(SideloadError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("companion directory not found: {}", root.display()),
            )));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| SideloadError::Io(e.into()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    /// Directory name, used as the token to replace
    pub fn token(&self) -> Option<&str> {
        self.root.file_name().and_then(|name| name.to_str())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// One planned rename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// Every rename needed to move a data set onto a new identifier
#[derive(Debug, Clone)]
pub struct RelocationPlan {
    token: String,
    new_id: String,
    /// File renames inside the original root
    files: Vec<Rename>,
    /// Directory rename, applied last
    root: Rename,
    /// Final file paths in discovery order
    final_files: Vec<PathBuf>,
}

impl RelocationPlan {
    /// Compute all target paths and reject collisions up front
    pub fn new(set: &CompanionDataSet, new_id: &str) -> SideloadResult<Self> {
        let token = set
            .token()
            .ok_or_else(|| {
                SideloadError::Config(format!(
                    "companion directory has no usable name: {}",
                    set.root.display()
                ))
            })?
            .to_string();
        let parent = set.root.parent().unwrap_or_else(|| Path::new(""));
        let new_root = parent.join(new_id);

        let root = Rename {
            from: set.root.clone(),
            to: new_root.clone(),
        };
        if root.from != root.to && root.to.exists() {
            return Err(collision(&root));
        }

        let mut files = Vec::new();
        let mut final_files = Vec::with_capacity(set.files.len());
        for path in &set.files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let new_name = name.replace(&token, new_id);

            if new_name != name {
                let rename = Rename {
                    from: path.clone(),
                    to: set.root.join(&new_name),
                };
                if rename.to.exists() {
                    return Err(collision(&rename));
                }
                files.push(rename);
            }
            final_files.push(new_root.join(&new_name));
        }

        Ok(Self {
            token,
            new_id: new_id.to_string(),
            files,
            root,
            final_files,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// File renames in application order
    pub fn file_renames(&self) -> &[Rename] {
        &self.files
    }

    pub fn root_rename(&self) -> &Rename {
        &self.root
    }

    /// Apply the plan, rolling back on the first failure
    pub fn apply(&self) -> SideloadResult<CompanionDataSet> {
        let mut applied: Vec<&Rename> = Vec::new();

        let steps = self
            .files
            .iter()
            .chain(std::iter::once(&self.root).filter(|r| r.from != r.to));

        for rename in steps {
            tracing::debug!(
                target: "sideload::relocate",
                from = %rename.from.display(),
                to = %rename.to.display(),
                "Renaming"
            );
            if let Err(source) = fs::rename(&rename.from, &rename.to) {
                let rolled_back = rollback(&applied);
                return Err(SideloadError::Relocation {
                    from: rename.from.clone(),
                    to: rename.to.clone(),
                    source,
                    rolled_back,
                });
            }
            applied.push(rename);
        }

        tracing::info!(
            target: "sideload::relocate",
            token = %self.token,
            new_id = %self.new_id,
            files = self.final_files.len(),
            "Relocated companion data"
        );

        Ok(CompanionDataSet {
            root: self.root.to.clone(),
            files: self.final_files.clone(),
        })
    }
}

/// Rename `set` onto `new_id`
pub fn relocate(set: &CompanionDataSet, new_id: &str) -> SideloadResult<CompanionDataSet> {
    RelocationPlan::new(set, new_id)?.apply()
}

fn collision(rename: &Rename) -> SideloadError {
    SideloadError::Relocation {
        from: rename.from.clone(),
        to: rename.to.clone(),
        source: std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "target already exists",
        ),
        rolled_back: true,
    }
}

/// Undo applied renames in reverse order; true if all succeeded
fn rollback(applied: &[&Rename]) -> bool {
    let mut ok = true;
    for rename in applied.iter().rev() {
        if let Err(e) = fs::rename(&rename.to, &rename.from) {
            tracing::warn!(
                target: "sideload::relocate",
                from = %rename.to.display(),
                to = %rename.from.display(),
                "Rollback failed: {}", e
            );
            ok = false;
        }
    }
    ok
}
