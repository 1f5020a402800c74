//! Local staging area on fast scratch storage.
//!
//! The staging root holds four role directories (`input`, `work`, `output`,
//! `cache`). Files placed there live only for the duration of one processing
//! attempt; the worker releases them before moving to the next object.

use crate::config::StagingConfig;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Staging admission refused because free space is below the floor.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Staging volume has {free_gb:.2} GiB free, below the {min_free_gb:.2} GiB floor")]
pub struct CapacityError {
    pub free_gb: f64,
    pub min_free_gb: f64,
}

/// Local file-system failures inside the staging tree.
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Failed to create staging directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to stage {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to query capacity of {path}: {source}")]
    Capacity {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Path has no file name: {0}")]
    NoFileName(PathBuf),
}

/// The fixed directory roles under the staging root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingRole {
    Input,
    Work,
    Output,
    Cache,
}

impl StagingRole {
    pub const ALL: [StagingRole; 4] = [
        StagingRole::Input,
        StagingRole::Work,
        StagingRole::Output,
        StagingRole::Cache,
    ];

    /// Roles emptied after every processing attempt.
    pub const TRANSIENT: [StagingRole; 3] =
        [StagingRole::Input, StagingRole::Work, StagingRole::Output];

    pub fn as_str(&self) -> &'static str {
        match self {
            StagingRole::Input => "input",
            StagingRole::Work => "work",
            StagingRole::Output => "output",
            StagingRole::Cache => "cache",
        }
    }
}

impl fmt::Display for StagingRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (total, used, free) bytes on the staging volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CapacitySnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

impl CapacitySnapshot {
    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / BYTES_PER_GB
    }

    pub fn used_gb(&self) -> f64 {
        self.used_bytes as f64 / BYTES_PER_GB
    }

    pub fn free_gb(&self) -> f64 {
        self.free_bytes as f64 / BYTES_PER_GB
    }
}

/// A file under one staging role, owned by a single processing attempt.
#[derive(Debug, PartialEq, Eq)]
pub struct StagingSlot {
    role: StagingRole,
    path: PathBuf,
}

impl StagingSlot {
    pub fn role(&self) -> StagingRole {
        self.role
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the slot's file. A file that was already consumed is fine.
    pub async fn release(self) -> Result<(), StagingError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StagingError::Io {
                path: self.path,
                source,
            }),
        }
    }
}

/// Manager for the staging directory tree.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    min_free_gb: f64,
}

impl StagingArea {
    /// Create the staging area, creating all role directories if needed.
    pub fn new(config: &StagingConfig) -> Result<Self, StagingError> {
        let area = Self {
            root: config.root.clone(),
            min_free_gb: config.min_free_gb,
        };

        for role in StagingRole::ALL {
            let dir = area.role_dir(role);
            std::fs::create_dir_all(&dir).map_err(|source| StagingError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }

        debug!(root = %area.root.display(), "Staging area ready");
        Ok(area)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn min_free_gb(&self) -> f64 {
        self.min_free_gb
    }

    pub fn role_dir(&self, role: StagingRole) -> PathBuf {
        self.root.join(role.as_str())
    }

    /// Path for `filename` under `role`. Only the final path component of
    /// `filename` is used, so object keys cannot escape the role directory.
    pub fn path_for(&self, role: StagingRole, filename: &str) -> StagingSlot {
        let name = Path::new(filename)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "unnamed".into());

        StagingSlot {
            role,
            path: self.role_dir(role).join(name),
        }
    }

    /// Sample total/used/free bytes of the staging volume.
    pub fn usage(&self) -> Result<CapacitySnapshot, StagingError> {
        let capacity = |source| StagingError::Capacity {
            path: self.root.clone(),
            source,
        };

        let total_bytes = fs2::total_space(&self.root).map_err(capacity)?;
        let free_bytes = fs2::available_space(&self.root).map_err(capacity)?;

        Ok(CapacitySnapshot {
            total_bytes,
            used_bytes: total_bytes.saturating_sub(free_bytes),
            free_bytes,
        })
    }

    /// Whether `snapshot` leaves at least the configured floor free.
    pub fn admits(&self, snapshot: &CapacitySnapshot) -> bool {
        snapshot.free_gb() >= self.min_free_gb
    }

    /// True iff free space is at or above the floor. A volume whose capacity
    /// cannot be read is not admitted.
    pub fn admit(&self) -> bool {
        match self.usage() {
            Ok(snapshot) => self.admits(&snapshot),
            Err(e) => {
                warn!(error = %e, "Could not sample staging capacity");
                false
            }
        }
    }

    /// Capacity check returning the snapshot on success.
    pub fn ensure_capacity(&self) -> Result<CapacitySnapshot, CapacityError> {
        let snapshot = self.usage().map_err(|e| {
            warn!(error = %e, "Could not sample staging capacity");
            CapacityError {
                free_gb: 0.0,
                min_free_gb: self.min_free_gb,
            }
        })?;

        self.check_capacity(&snapshot)?;
        Ok(snapshot)
    }

    /// Compare an already sampled snapshot against the floor.
    pub fn check_capacity(&self, snapshot: &CapacitySnapshot) -> Result<(), CapacityError> {
        if self.admits(snapshot) {
            Ok(())
        } else {
            Err(CapacityError {
                free_gb: snapshot.free_gb(),
                min_free_gb: self.min_free_gb,
            })
        }
    }

    /// Copy `src` into `role`, keeping its file name.
    pub async fn copy_in(&self, src: &Path, role: StagingRole) -> Result<StagingSlot, StagingError> {
        let slot = self.slot_for_source(src, role)?;
        tokio::fs::copy(src, &slot.path)
            .await
            .map_err(|source| StagingError::Io {
                path: src.to_path_buf(),
                source,
            })?;
        Ok(slot)
    }

    /// Move `src` into `role`, keeping its file name.
    pub async fn move_out(&self, src: &Path, role: StagingRole) -> Result<StagingSlot, StagingError> {
        let slot = self.slot_for_source(src, role)?;
        if tokio::fs::rename(src, &slot.path).await.is_err() {
            // Cross-device moves fall back to copy + delete.
            tokio::fs::copy(src, &slot.path)
                .await
                .map_err(|source| StagingError::Io {
                    path: src.to_path_buf(),
                    source,
                })?;
            tokio::fs::remove_file(src)
                .await
                .map_err(|source| StagingError::Io {
                    path: src.to_path_buf(),
                    source,
                })?;
        }
        Ok(slot)
    }

    /// Delete every regular file directly under `role`. Subdirectories are
    /// left alone; a missing directory is not an error.
    pub async fn cleanup(&self, role: StagingRole) -> Result<usize, StagingError> {
        let dir = self.role_dir(role);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(StagingError::Io { path: dir, source }),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StagingError::Io {
                path: dir.clone(),
                source,
            })?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(StagingError::Io {
                        path: entry.path(),
                        source,
                    })
                }
            }
        }

        if removed > 0 {
            debug!(role = %role, removed = removed, "Cleaned staging role");
        }
        Ok(removed)
    }

    /// Clean every transient role (`input`, `work`, `output`).
    pub async fn cleanup_transient(&self) -> Result<usize, StagingError> {
        let mut removed = 0;
        for role in StagingRole::TRANSIENT {
            removed += self.cleanup(role).await?;
        }
        Ok(removed)
    }

    fn slot_for_source(&self, src: &Path, role: StagingRole) -> Result<StagingSlot, StagingError> {
        let name = src
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StagingError::NoFileName(src.to_path_buf()))?;
        Ok(self.path_for(role, name))
    }
}
