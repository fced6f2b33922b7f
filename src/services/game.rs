//! Installation checks, edition detection and launching the patched game.
//!
//! This module answers the questions asked about an installation outside of a
//! patch run:
//! - Is a folder a usable installation ([`validate_install`])?
//! - Is it the demo or the full release ([`detect_edition`])?
//! - Which executable starts it ([`locate_executable`])?
//!
//! [`launch_and_restore`] runs the game and always restores the `.original`
//! backups once the process exits, so the installation on disk is only patched
//! while the game is running.
//!
//! A [`SessionMarker`] in the installation root names the process that owns a
//! patch-and-play session. Other invocations check [`session_active`] before
//! restoring backups so they never unpatch a game that is still running.
//!
//! # Examples
//!
//! ```ignore
//! use deltaforge::services::game::{detect_edition, locate_executable};
//! use camino::Utf8Path;
//!
//! let root = Utf8Path::new("C:/Games/DELTARUNE");
//! let edition = detect_edition(root);
//! let exe = locate_executable(root, None)?;
//! ```

use super::backup::restore_originals_if_any;
use super::fs_utils::{best_effort, remove_path};
use crate::models::GameEdition;
use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use tokio::process::Command;

/// Executable expected in the installation root when none is configured.
pub const DEFAULT_EXECUTABLE: &str = "DELTARUNE.exe";

/// Files a folder must contain to be accepted as an installation.
pub const INSTALL_KEY_ITEMS: &[&str] = &["data.win", DEFAULT_EXECUTABLE];

/// Chapter asset whose presence marks the full release.
pub const FULL_EDITION_MARKER: &str = "chapter4_windows/data.win";

/// File the game writes its console to when launched with `-output`.
pub const CONSOLE_FILE: &str = "_console.txt";

/// Marker file holding the pid of the process running a patched session.
pub const SESSION_MARKER: &str = ".deltaforge-session";

/// Owns the session marker of an installation and removes it on drop.
#[derive(Debug)]
pub struct SessionMarker {
    path: Utf8PathBuf,
}

impl SessionMarker {
    /// Write the marker for the current process.
    pub fn create(install_root: &Utf8Path) -> Result<Self> {
        let path = install_root.join(SESSION_MARKER);
        fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("Failed to write session marker: {}", path))?;
        tracing::debug!("Session marker written: {}", path);
        Ok(Self { path })
    }
}

impl Drop for SessionMarker {
    fn drop(&mut self) {
        best_effort("remove session marker", || remove_path(&self.path));
    }
}

/// Whether another live process owns a patched session of `install_root`.
///
/// A marker left by a process that no longer exists is stale and ignored.
pub fn session_active(install_root: &Utf8Path) -> bool {
    let Ok(text) = fs::read_to_string(install_root.join(SESSION_MARKER)) else {
        return false;
    };
    let Ok(pid) = text.trim().parse::<u32>() else {
        tracing::warn!("Ignoring unreadable session marker in {}", install_root);
        return false;
    };
    if pid == std::process::id() {
        return false;
    }

    let system = sysinfo::System::new_all();
    let alive = system.process(sysinfo::Pid::from_u32(pid)).is_some();
    if !alive {
        tracing::info!("Ignoring stale session marker of pid {}", pid);
    }
    alive
}

/// Key items missing from `install_root`; empty means the folder is usable.
pub fn validate_install(install_root: &Utf8Path) -> Vec<&'static str> {
    INSTALL_KEY_ITEMS
        .iter()
        .copied()
        .filter(|item| !install_root.join(item).exists())
        .collect()
}

/// `Full` if the chapter 4 asset exists, otherwise `Demo`.
pub fn detect_edition(install_root: &Utf8Path) -> GameEdition {
    let edition = if install_root.join(FULL_EDITION_MARKER).exists() {
        GameEdition::Full
    } else {
        GameEdition::Demo
    };
    tracing::info!("Detected game edition: {:?}", edition);
    edition
}

/// The configured executable if it exists, else the default one in the root.
pub fn locate_executable(
    install_root: &Utf8Path,
    configured: Option<&Utf8Path>,
) -> Result<Utf8PathBuf> {
    if let Some(exe) = configured {
        if exe.is_file() {
            return Ok(exe.to_path_buf());
        }
        tracing::warn!("Configured game executable not found: {}", exe);
    }

    let fallback = install_root.join(DEFAULT_EXECUTABLE);
    if fallback.is_file() {
        return Ok(fallback);
    }
    bail!("Could not find a game executable to run in {}", install_root)
}

/// What happened while the patched game ran.
#[derive(Debug, Clone, Default)]
pub struct GameSession {
    pub exit_code: Option<i32>,
    /// Targets restored after the game closed.
    pub restored: Vec<Utf8PathBuf>,
    /// Captured console text, when console capture was requested.
    pub console: Option<String>,
}

/// Run `executable` from its own folder, wait for it, then restore originals.
///
/// Restoration happens even when the game fails to start. With
/// `capture_console` the game is asked to write its console to
/// [`CONSOLE_FILE`], which is read back and deleted.
pub async fn launch_and_restore(
    install_root: &Utf8Path,
    executable: &Utf8Path,
    capture_console: bool,
) -> Result<GameSession> {
    let exe_dir = executable
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .map(Utf8Path::to_path_buf)
        .unwrap_or_else(|| Utf8PathBuf::from("."));
    let console_path = exe_dir.join(CONSOLE_FILE);

    let mut cmd = Command::new(executable.as_std_path());
    cmd.current_dir(exe_dir.as_std_path());
    if capture_console {
        best_effort("remove stale console file", || remove_path(&console_path));
        cmd.args(["-output", CONSOLE_FILE]);
    }

    tracing::info!("Launching game: {}", executable);
    let status = match cmd.spawn() {
        Ok(mut child) => child.wait().await,
        Err(e) => Err(e),
    };

    let restored = restore_originals_if_any(install_root);

    let status = status.with_context(|| format!("Failed to run game: {}", executable))?;
    tracing::info!("Game exited with {}", status);

    let console = if capture_console {
        let text = fs::read_to_string(&console_path).ok();
        best_effort("remove console file", || remove_path(&console_path));
        text
    } else {
        None
    };

    Ok(GameSession {
        exit_code: status.code(),
        restored,
        console,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        (temp_dir, root)
    }

    #[test]
    fn test_validate_install_lists_missing() {
        let (_guard, root) = temp_root();
        fs::write(root.join("data.win"), "").unwrap();

        assert_eq!(validate_install(&root), vec![DEFAULT_EXECUTABLE]);

        fs::write(root.join(DEFAULT_EXECUTABLE), "").unwrap();
        assert!(validate_install(&root).is_empty());
    }

    #[test]
    fn test_locate_executable_prefers_existing_configured() {
        let (_guard, root) = temp_root();
        fs::write(root.join(DEFAULT_EXECUTABLE), "").unwrap();
        fs::write(root.join("custom.exe"), "").unwrap();

        let custom = root.join("custom.exe");
        assert_eq!(locate_executable(&root, Some(&custom)).unwrap(), custom);

        let gone = root.join("gone.exe");
        assert_eq!(
            locate_executable(&root, Some(&gone)).unwrap(),
            root.join(DEFAULT_EXECUTABLE)
        );
    }

    #[test]
    fn test_session_marker_lifecycle() {
        let (_guard, root) = temp_root();
        assert!(!session_active(&root));

        let marker = SessionMarker::create(&root).unwrap();
        assert!(root.join(SESSION_MARKER).is_file());
        // The owning process never blocks itself.
        assert!(!session_active(&root));

        drop(marker);
        assert!(!root.join(SESSION_MARKER).exists());
    }

    #[test]
    fn test_garbage_session_marker_is_ignored() {
        let (_guard, root) = temp_root();
        fs::write(root.join(SESSION_MARKER), "not a pid").unwrap();
        assert!(!session_active(&root));
    }

    #[test]
    fn test_locate_executable_none_found() {
        let (_guard, root) = temp_root();
        assert!(locate_executable(&root, None).is_err());
    }
}
