//! Point-in-time snapshots
//!
//! A snapshot hard-links every persisted part into
//! `snapshots/<millis>-<uuid>/`, so it shares bytes with the live table but
//! is untouched by later flushes and merges: those only ever create new part
//! directories and unlink old ones. The snapshot carries its own manifest
//! and opens as a regular table.

use crate::part::{DATA_FILE_NAME, INDEX_FILE_NAME, META_FILE_NAME};
use crate::table::{Table, DATA_DIR_NAME, SNAPSHOTS_DIR_NAME};
use crate::{Result, TephraError};
use chrono::Utc;
use std::fs;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

impl Table {
    /// Produce a crash-consistent, read-only copy of every part flushed so
    /// far and return its name.
    ///
    /// Pending rows and in-memory parts are flushed to disk first, so the
    /// snapshot reflects everything ingested before the call.
    pub fn create_snapshot(&self) -> Result<String> {
        self.force_flush()?;

        let name = format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        );
        let snapshot_dir = self.core_path().join(SNAPSHOTS_DIR_NAME).join(&name);
        let data_dir = snapshot_dir.join(DATA_DIR_NAME);
        fs::create_dir_all(&data_dir)?;

        let mut partition_names = Vec::new();
        for partition in self.partitions_snapshot() {
            let partition_dir = data_dir.join(partition.name());
            fs::create_dir_all(&partition_dir)?;
            partition_names.push(partition.name().to_string());

            for part in partition.snapshot_parts() {
                // parts flushed after force_flush returned are newer than the
                // snapshot moment; in-memory ones are exactly those
                let Some(src) = part.path() else { continue };
                let dst = partition_dir.join(
                    src.file_name()
                        .ok_or_else(|| TephraError::Internal("part path without name".into()))?,
                );
                fs::create_dir_all(&dst)?;
                for file in [INDEX_FILE_NAME, DATA_FILE_NAME, META_FILE_NAME] {
                    link_or_copy(&src.join(file), &dst.join(file))?;
                }
            }
        }

        let manifest = serde_json::json!({ "partitions": partition_names });
        let raw = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| TephraError::Internal(format!("serializing snapshot manifest: {e}")))?;
        fs::write(snapshot_dir.join("table.json"), raw)?;

        info!("created snapshot {}", name);
        Ok(name)
    }

    /// Names of all existing snapshots, oldest first
    pub fn list_snapshots(&self) -> Result<Vec<String>> {
        let dir = self.core_path().join(SNAPSHOTS_DIR_NAME);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a snapshot by name
    pub fn delete_snapshot(&self, name: &str) -> Result<()> {
        let dir = self.core_path().join(SNAPSHOTS_DIR_NAME).join(name);
        if !dir.is_dir() {
            return Err(TephraError::SnapshotNotFound(name.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        info!("deleted snapshot {}", name);
        Ok(())
    }

    /// Filesystem path of a named snapshot; it opens as a regular table
    pub fn snapshot_path(&self, name: &str) -> std::path::PathBuf {
        self.core_path().join(SNAPSHOTS_DIR_NAME).join(name)
    }
}

fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if fs::hard_link(src, dst).is_err() {
        // cross-device layouts fall back to a plain copy
        fs::copy(src, dst)?;
    }
    Ok(())
}
