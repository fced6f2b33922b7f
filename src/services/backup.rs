//! `.original` backups beside patched files, and crash recovery.
//!
//! A file `<path>.original` existing next to `<path>` is the only record that
//! `<path>` has been modified and must be restored. Backups are first-write-wins:
//! once one exists it is never overwritten until it is consumed by a restore.

use super::fs_utils::{best_effort, copy_over, remove_path, safe_read_dir, safe_stat};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Reserved suffix marking a preserved pre-patch original.
pub const BACKUP_SUFFIX: &str = ".original";

/// Suffix of a backup still being written; never treated as a backup.
const PARTIAL_SUFFIX: &str = ".partial";

pub fn backup_path(target: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{}{}", target, BACKUP_SUFFIX))
}

/// Snapshot `target` to `<target>.original` unless it is missing or already backed up.
///
/// Returns whether a new backup was written. The copy goes through a temporary
/// file and is renamed into place, so a crash never leaves a truncated backup.
pub fn ensure_backup(target: &Utf8Path) -> Result<bool> {
    let backup = backup_path(target);
    if !target.exists() || backup.exists() {
        return Ok(false);
    }

    let size = safe_stat(target).map(|m| m.len()).unwrap_or(0);
    tracing::info!("Backup -> {} (size {} bytes)", backup, size);

    let partial = Utf8PathBuf::from(format!("{}{}", backup, PARTIAL_SUFFIX));
    best_effort("remove stale partial backup", || remove_path(&partial));
    copy_over(target, &partial)?;
    fs::rename(&partial, &backup)
        .with_context(|| format!("Failed to finalize backup: {}", backup))?;
    Ok(true)
}

/// Put `<target>.original` back over `target` and delete the backup.
///
/// Returns whether a restore happened. Failure to delete the current target is
/// tolerated since it is about to be overwritten anyway.
pub fn restore_if_backup(target: &Utf8Path) -> Result<bool> {
    let backup = backup_path(target);
    if !backup.exists() {
        return Ok(false);
    }

    tracing::info!("Restore from backup: {}", backup);
    best_effort("remove patched target", || remove_path(target));
    copy_over(&backup, target)?;
    best_effort("remove consumed backup", || remove_path(&backup));
    Ok(true)
}

fn backup_target(dir: &Utf8Path, file_name: &str) -> Option<Utf8PathBuf> {
    file_name
        .strip_suffix(BACKUP_SUFFIX)
        .filter(|stem| !stem.is_empty())
        .map(|stem| dir.join(stem))
}

/// Every backed-up target in `install_root` and its immediate subdirectories.
pub fn find_backed_up_targets(install_root: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut targets = Vec::new();
    let root_entries = safe_read_dir(install_root);

    for entry in &root_entries {
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_file {
            if let Some(target) = backup_target(install_root, entry.file_name()) {
                targets.push(target);
            }
        }
    }

    for entry in &root_entries {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        for child in safe_read_dir(entry.path()) {
            if let Some(target) = backup_target(entry.path(), child.file_name()) {
                targets.push(target);
            }
        }
    }

    targets
}

/// Scan the installation (root and one level deep) and restore every backup found.
///
/// Each restore is attempted independently; one failure does not stop the rest.
/// Returns the targets that were restored.
pub fn restore_originals_if_any(install_root: &Utf8Path) -> Vec<Utf8PathBuf> {
    tracing::info!("Restore check in {}", install_root);
    let mut restored = Vec::new();

    for target in find_backed_up_targets(install_root) {
        tracing::debug!("Found backup for {}", target);
        match restore_if_backup(&target) {
            Ok(true) => restored.push(target),
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to restore {}: {:#}", target, e),
        }
    }

    tracing::info!("Restored count: {}", restored.len());
    restored
}
