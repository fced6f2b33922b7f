//! Filesystem helpers shared by discovery, backup and import.
//!
//! Directory walks here are worklist-based rather than recursive, and any
//! directory that cannot be read is treated as empty.

use crate::models::{MOD_INFO_FILE, PATCH_MANIFEST_FILE, UNIQUE_ID_FILE};
use anyhow::{Context, Result};
use camino::{Utf8DirEntry, Utf8Path, Utf8PathBuf};
use std::fmt::Display;
use std::fs;

/// Run a cleanup step, logging its failure instead of propagating it.
///
/// Only for cleanup and restore paths; the primary mutation path propagates errors.
pub fn best_effort<T, E, F>(label: &str, op: F) -> Option<T>
where
    E: Display,
    F: FnOnce() -> std::result::Result<T, E>,
{
    match op() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("best-effort {} failed: {}", label, e);
            None
        }
    }
}

pub fn safe_stat(path: &Utf8Path) -> Option<fs::Metadata> {
    fs::metadata(path).ok()
}

/// Entries of `dir`, or nothing if it cannot be read.
pub fn safe_read_dir(dir: &Utf8Path) -> Vec<Utf8DirEntry> {
    match dir.read_dir_utf8() {
        Ok(entries) => entries.filter_map(|entry| entry.ok()).collect(),
        Err(e) => {
            tracing::debug!("Skipping unreadable directory {}: {}", dir, e);
            Vec::new()
        }
    }
}

fn is_dir_entry(entry: &Utf8DirEntry) -> bool {
    entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
}

fn is_file_entry(entry: &Utf8DirEntry) -> bool {
    entry.file_type().map(|t| t.is_file()).unwrap_or(false)
}

/// Delete a file or directory tree if present.
pub fn remove_path(path: &Utf8Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copy a file, or a directory tree, to `dst`, creating `dst`'s parents.
pub fn copy_over(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent))?;
    }

    let meta = fs::metadata(src).with_context(|| format!("Failed to stat: {}", src))?;
    if meta.is_file() {
        fs::copy(src, dst).with_context(|| format!("Failed to copy {} -> {}", src, dst))?;
        return Ok(());
    }

    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from_dir, to_dir)) = pending.pop() {
        fs::create_dir_all(&to_dir)
            .with_context(|| format!("Failed to create directory: {}", to_dir))?;
        let entries = from_dir
            .read_dir_utf8()
            .with_context(|| format!("Failed to read directory: {}", from_dir))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to read entry in {}", from_dir))?;
            let target = to_dir.join(entry.file_name());
            if is_dir_entry(&entry) {
                pending.push((entry.path().to_path_buf(), target));
            } else {
                fs::copy(entry.path(), &target)
                    .with_context(|| format!("Failed to copy {} -> {}", entry.path(), target))?;
            }
        }
    }
    Ok(())
}

/// First file named `name` (case-insensitive) anywhere under `root`, depth-first.
pub fn find_first_by_name(root: &Utf8Path, name: &str) -> Option<Utf8PathBuf> {
    let needle = name.to_lowercase();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in safe_read_dir(&dir) {
            if is_file_entry(&entry) && entry.file_name().to_lowercase() == needle {
                return Some(entry.path().to_path_buf());
            }
            if is_dir_entry(&entry) {
                stack.push(entry.path().to_path_buf());
            }
        }
    }
    None
}

/// Locate the directory that really holds a mod's content.
///
/// Prefers the first directory containing both `modding.xml` and `__deltaID.json`;
/// otherwise the first directory holding any marker file; otherwise `root`.
pub fn find_mod_root(root: &Utf8Path) -> Utf8PathBuf {
    let manifest = PATCH_MANIFEST_FILE.to_lowercase();
    let unique_id = UNIQUE_ID_FILE.to_lowercase();
    let info = MOD_INFO_FILE.to_lowercase();

    let mut stack = vec![root.to_path_buf()];
    let mut fallback: Option<Utf8PathBuf> = None;

    while let Some(dir) = stack.pop() {
        let entries = safe_read_dir(&dir);

        let (mut has_manifest, mut has_id, mut has_info) = (false, false, false);
        for entry in entries.iter().filter(|e| is_file_entry(e)) {
            let lower = entry.file_name().to_lowercase();
            has_manifest |= lower == manifest;
            has_id |= lower == unique_id;
            has_info |= lower == info;
        }

        if has_manifest && has_id {
            return dir;
        }
        if fallback.is_none() && (has_manifest || has_id || has_info) {
            fallback = Some(dir.clone());
        }

        for entry in entries.iter().filter(|e| is_dir_entry(e)) {
            stack.push(entry.path().to_path_buf());
        }
    }

    fallback.unwrap_or_else(|| root.to_path_buf())
}

fn resolve(path: &Utf8Path) -> Utf8PathBuf {
    path.canonicalize_utf8()
        .unwrap_or_else(|_| super::chapters::normalize_lexically(path))
}

fn fold_case(path: &Utf8Path) -> String {
    if cfg!(any(target_os = "windows", target_os = "macos")) {
        path.as_str().to_lowercase()
    } else {
        path.as_str().to_string()
    }
}

/// Whether `child` is `parent` or lies inside it.
pub fn is_subpath(parent: &Utf8Path, child: &Utf8Path) -> bool {
    let parent = fold_case(&resolve(parent));
    let child = fold_case(&resolve(child));
    let parent = parent.trim_end_matches(['/', '\\']);
    child == parent
        || child
            .strip_prefix(parent)
            .is_some_and(|rest| rest.starts_with(['/', '\\']))
}

fn move_entry(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    best_effort("clear flatten destination", || remove_path(to));
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Cross-device moves fall back to copy + delete
    copy_over(from, to)?;
    remove_path(from).with_context(|| format!("Failed to remove moved entry: {}", from))?;
    Ok(())
}

/// Move every entry of `wrapper` into `dest`, then delete `wrapper`.
///
/// Existing entries in `dest` are overwritten. Returns `false` without touching
/// anything when `wrapper` is `dest` itself or is not inside `dest`.
pub fn flatten_into(dest: &Utf8Path, wrapper: &Utf8Path) -> Result<bool> {
    let dest = resolve(dest);
    let mut wrapper = resolve(wrapper);

    if fold_case(&dest) == fold_case(&wrapper) {
        return Ok(false);
    }
    if !is_subpath(&dest, &wrapper) {
        tracing::warn!(
            "flatten refused: {} is not inside {}",
            wrapper,
            dest
        );
        return Ok(false);
    }

    // The top-level folder holding the wrapper may share a name with one of the
    // wrapper's own entries (Mod/Mod/...); move it aside first.
    let mut staging: Option<Utf8PathBuf> = None;
    if let Ok(relative) = wrapper.strip_prefix(&dest) {
        if let Some(top_name) = relative.components().next().map(|c| c.as_str().to_string()) {
            let collides = safe_read_dir(&wrapper)
                .iter()
                .any(|e| e.file_name().eq_ignore_ascii_case(&top_name));
            if collides {
                let top = dest.join(&top_name);
                let parked = dest.join(format!(".{}.flatten", top_name));
                best_effort("clear stale staging folder", || remove_path(&parked));
                fs::rename(&top, &parked)
                    .with_context(|| format!("Failed to stage wrapper folder: {}", top))?;
                let inner = relative.strip_prefix(&top_name).unwrap_or(relative);
                wrapper = parked.join(inner);
                staging = Some(parked);
            }
        }
    }

    let entries = wrapper
        .read_dir_utf8()
        .with_context(|| format!("Failed to read wrapper folder: {}", wrapper))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", wrapper))?;
        let to = dest.join(entry.file_name());
        move_entry(entry.path(), &to)?;
    }

    best_effort("remove wrapper folder", || fs::remove_dir_all(&wrapper));
    if let Some(parked) = staging {
        best_effort("remove staging folder", || fs::remove_dir_all(&parked));
    }

    tracing::debug!("Flattened {} into {}", wrapper, dest);
    Ok(true)
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
    fn test_copy_over_file_creates_parents() {
        let (_guard, root) = temp_root();
        fs::write(root.join("a.txt"), "hello").unwrap();

        copy_over(&root.join("a.txt"), &root.join("x/y/b.txt")).unwrap();

        assert_eq!(fs::read_to_string(root.join("x/y/b.txt")).unwrap(), "hello");
    }

    #[test]
    fn test_copy_over_directory_tree() {
        let (_guard, root) = temp_root();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::write(root.join("src/top.txt"), "1").unwrap();
        fs::write(root.join("src/nested/deep.txt"), "2").unwrap();

        copy_over(&root.join("src"), &root.join("dst")).unwrap();

        assert_eq!(fs::read_to_string(root.join("dst/top.txt")).unwrap(), "1");
        assert_eq!(
            fs::read_to_string(root.join("dst/nested/deep.txt")).unwrap(),
            "2"
        );
    }

    #[test]
    fn test_copy_over_missing_source_fails() {
        let (_guard, root) = temp_root();
        assert!(copy_over(&root.join("missing"), &root.join("out")).is_err());
    }

    #[test]
    fn test_find_first_by_name_case_insensitive() {
        let (_guard, root) = temp_root();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/MODDING.XML"), "<x/>").unwrap();

        let found = find_first_by_name(&root, "modding.xml").unwrap();
        assert_eq!(found, root.join("a/b/MODDING.XML"));
        assert!(find_first_by_name(&root, "other.json").is_none());
    }

    #[test]
    fn test_find_mod_root_prefers_complete_root() {
        let (_guard, root) = temp_root();
        fs::create_dir_all(root.join("wrapper/real")).unwrap();
        fs::write(root.join("wrapper/_deltamodInfo.json"), "{}").unwrap();
        fs::write(root.join("wrapper/real/modding.xml"), "<x/>").unwrap();
        fs::write(root.join("wrapper/real/__deltaID.json"), "{}").unwrap();

        assert_eq!(find_mod_root(&root), root.join("wrapper/real"));
    }

    #[test]
    fn test_find_mod_root_fallback_and_default() {
        let (_guard, root) = temp_root();
        assert_eq!(find_mod_root(&root), root);

        fs::create_dir_all(root.join("inner")).unwrap();
        fs::write(root.join("inner/_deltamodInfo.json"), "{}").unwrap();
        assert_eq!(find_mod_root(&root), root.join("inner"));
    }

    #[test]
    fn test_is_subpath() {
        let (_guard, root) = temp_root();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir_all(root.join("ab")).unwrap();

        assert!(is_subpath(&root, &root.join("a/b")));
        assert!(is_subpath(&root.join("a"), &root.join("a")));
        assert!(!is_subpath(&root.join("a"), &root.join("ab")));
        assert!(!is_subpath(&root.join("a/b"), &root.join("a")));
    }

    #[test]
    fn test_flatten_into_moves_and_overwrites() {
        let (_guard, root) = temp_root();
        let dest = root.join("mod");
        fs::create_dir_all(dest.join("Wrapper/sub")).unwrap();
        fs::write(dest.join("Wrapper/modding.xml"), "new").unwrap();
        fs::write(dest.join("Wrapper/sub/file.txt"), "f").unwrap();
        fs::write(dest.join("modding.xml"), "old").unwrap();

        assert!(flatten_into(&dest, &dest.join("Wrapper")).unwrap());

        assert_eq!(fs::read_to_string(dest.join("modding.xml")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dest.join("sub/file.txt")).unwrap(), "f");
        assert!(!dest.join("Wrapper").exists());
    }

    #[test]
    fn test_flatten_into_wrapper_sharing_name_with_entry() {
        let (_guard, root) = temp_root();
        let dest = root.join("mod");
        fs::create_dir_all(dest.join("Mod/Mod")).unwrap();
        fs::write(dest.join("Mod/Mod/inner.txt"), "i").unwrap();
        fs::write(dest.join("Mod/modding.xml"), "x").unwrap();

        assert!(flatten_into(&dest, &dest.join("Mod")).unwrap());

        assert_eq!(fs::read_to_string(dest.join("modding.xml")).unwrap(), "x");
        assert_eq!(fs::read_to_string(dest.join("Mod/inner.txt")).unwrap(), "i");
    }

    #[test]
    fn test_flatten_into_refuses_outside_wrapper() {
        let (_guard, root) = temp_root();
        fs::create_dir_all(root.join("dest")).unwrap();
        fs::create_dir_all(root.join("elsewhere")).unwrap();
        fs::write(root.join("elsewhere/keep.txt"), "k").unwrap();

        assert!(!flatten_into(&root.join("dest"), &root.join("elsewhere")).unwrap());
        assert!(root.join("elsewhere/keep.txt").exists());
    }

    #[test]
    fn test_best_effort_swallows_error() {
        let result: Option<()> = best_effort("fail", || Err::<(), _>("boom"));
        assert!(result.is_none());
        assert_eq!(best_effort("ok", || Ok::<_, String>(3)), Some(3));
    }
}
