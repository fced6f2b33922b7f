use super::fs_utils::{best_effort, find_mod_root, flatten_into, is_subpath, remove_path};
use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Archive extensions that can be imported into the mod database.
pub const SUPPORTED_ARCHIVES: &[&str] = &["zip", "7z"];

/// First free folder under `mod_database` for `stem`: `stem`, `stem-2`, `stem-3`...
fn unique_folder(mod_database: &Utf8Path, stem: &str) -> Utf8PathBuf {
    let first = mod_database.join(stem);
    if !first.exists() {
        return first;
    }
    (2..)
        .map(|n| mod_database.join(format!("{}-{}", stem, n)))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

fn extract_7z(archive: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    sevenz_rust::decompress_file(archive, dest)
        .with_context(|| format!("Failed to extract 7z archive {}", archive))
}

fn extract_zip(archive: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    let file = fs::File::open(archive).with_context(|| format!("Failed to open {}", archive))?;
    let mut zip = zip::ZipArchive::new(file).with_context(|| format!("Failed to read {}", archive))?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).context("Failed to read zip entry")?;
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!("Skipping zip entry with unsafe path: {}", entry.name());
            continue;
        };

        let out_path = dest.as_std_path().join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).context("Failed to create zip directory")?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).context("Failed to create zip directory")?;
        }

        let mut out_file = fs::File::create(&out_path)
            .with_context(|| format!("Failed to create {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut out_file).context("Failed to extract zip entry")?;
    }

    Ok(())
}

/// Import a mod archive into the mod database and return the new mod folder.
///
/// The archive is extracted into a folder named after it. If the mod's content
/// sits inside a wrapper folder, it is moved up to the mod folder.
pub fn import_mod_archive(archive: &Utf8Path, mod_database: &Utf8Path) -> Result<Utf8PathBuf> {
    let extension = archive
        .extension()
        .map(str::to_lowercase)
        .unwrap_or_default();
    if !SUPPORTED_ARCHIVES.contains(&extension.as_str()) {
        bail!(
            "Unsupported mod archive {} (supported: {})",
            archive,
            SUPPORTED_ARCHIVES.join(", ")
        );
    }
    let stem = archive
        .file_stem()
        .filter(|s| !s.is_empty())
        .with_context(|| format!("Archive has no file name: {}", archive))?;

    fs::create_dir_all(mod_database)
        .with_context(|| format!("Failed to create mod database: {}", mod_database))?;
    let dest = unique_folder(mod_database, stem);
    fs::create_dir_all(&dest).with_context(|| format!("Failed to create {}", dest))?;

    tracing::info!("Importing {} into {}", archive, dest);
    let extracted = match extension.as_str() {
        "7z" => extract_7z(archive, &dest),
        _ => extract_zip(archive, &dest),
    };
    if let Err(e) = extracted {
        best_effort("remove partial import", || remove_path(&dest));
        return Err(e);
    }

    let real_root = find_mod_root(&dest);
    if real_root != dest {
        tracing::info!("Flattening wrapped mod {} into {}", real_root, dest);
        flatten_into(&dest, &real_root)?;
    }

    Ok(dest)
}

/// Delete a mod folder from the mod database.
///
/// `folder` must name a direct child of the database.
pub fn remove_mod(mod_database: &Utf8Path, folder: &str) -> Result<()> {
    let name_is_plain = !folder.is_empty()
        && folder != "."
        && folder != ".."
        && !folder.contains(['/', '\\']);
    if !name_is_plain {
        bail!("Invalid mod folder name: {:?}", folder);
    }

    let target = mod_database.join(folder);
    if !target.is_dir() {
        bail!("Mod folder not found: {}", target);
    }
    if !is_subpath(mod_database, &target) {
        bail!("Refusing to remove {} outside the mod database", target);
    }

    tracing::info!("Removing mod folder {}", target);
    fs::remove_dir_all(&target).with_context(|| format!("Failed to remove {}", target))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        (temp_dir, root)
    }

    fn write_zip(path: &Utf8Path, entries: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_import_flat_archive() {
        let (_guard, root) = temp_root();
        let archive = root.join("Cool Mod.zip");
        write_zip(
            &archive,
            &[("modding.xml", "<mod/>"), ("__deltaID.json", "{}")],
        );

        let dest = import_mod_archive(&archive, &root.join("db")).unwrap();

        assert_eq!(dest, root.join("db/Cool Mod"));
        assert!(dest.join("modding.xml").is_file());
    }

    #[test]
    fn test_import_flattens_wrapper() {
        let (_guard, root) = temp_root();
        let archive = root.join("mod.zip");
        write_zip(
            &archive,
            &[
                ("Mod/modding.xml", "<mod/>"),
                ("Mod/__deltaID.json", "{}"),
                ("Mod/patches/a.xdelta", "x"),
            ],
        );

        let dest = import_mod_archive(&archive, &root.join("db")).unwrap();

        assert!(dest.join("modding.xml").is_file());
        assert!(dest.join("patches/a.xdelta").is_file());
        assert!(!dest.join("Mod").exists());
    }

    #[test]
    fn test_import_picks_unique_folder() {
        let (_guard, root) = temp_root();
        let archive = root.join("mod.zip");
        write_zip(&archive, &[("modding.xml", "<mod/>")]);

        let first = import_mod_archive(&archive, &root.join("db")).unwrap();
        let second = import_mod_archive(&archive, &root.join("db")).unwrap();

        assert_eq!(first, root.join("db/mod"));
        assert_eq!(second, root.join("db/mod-2"));
    }

    #[test]
    fn test_import_rejects_unsupported() {
        let (_guard, root) = temp_root();
        let archive = root.join("mod.rar");
        fs::write(&archive, "x").unwrap();

        assert!(import_mod_archive(&archive, &root.join("db")).is_err());
        assert!(!root.join("db").exists());
    }

    #[test]
    fn test_import_7z_archive() {
        let (_guard, root) = temp_root();
        let source = root.join("src/Seven");
        fs::create_dir_all(source.join("patches")).unwrap();
        fs::write(source.join("modding.xml"), "<mod/>").unwrap();
        fs::write(source.join("patches/a.xdelta"), "x").unwrap();
        let archive = root.join("Seven.7z");
        sevenz_rust::compress_to_path(&source, &archive).unwrap();

        let dest = import_mod_archive(&archive, &root.join("db")).unwrap();

        assert_eq!(dest, root.join("db/Seven"));
        assert_eq!(fs::read_to_string(dest.join("modding.xml")).unwrap(), "<mod/>");
        assert!(dest.join("patches/a.xdelta").is_file());
    }

    #[test]
    fn test_import_corrupt_7z_leaves_nothing() {
        let (_guard, root) = temp_root();
        let archive = root.join("broken.7z");
        fs::write(&archive, "not a 7z").unwrap();

        assert!(import_mod_archive(&archive, &root.join("db")).is_err());
        assert!(!root.join("db/broken").exists());
    }

    #[test]
    fn test_import_corrupt_zip_leaves_nothing() {
        let (_guard, root) = temp_root();
        let archive = root.join("broken.zip");
        fs::write(&archive, "not a zip").unwrap();

        assert!(import_mod_archive(&archive, &root.join("db")).is_err());
        assert!(!root.join("db/broken").exists());
    }

    #[test]
    fn test_remove_mod() {
        let (_guard, root) = temp_root();
        let db = root.join("db");
        fs::create_dir_all(db.join("m/sub")).unwrap();
        fs::write(db.join("m/sub/f"), "").unwrap();

        remove_mod(&db, "m").unwrap();
        assert!(!db.join("m").exists());
    }

    #[test]
    fn test_remove_mod_rejects_traversal() {
        let (_guard, root) = temp_root();
        let db = root.join("db");
        fs::create_dir_all(&db).unwrap();
        fs::create_dir_all(root.join("keep")).unwrap();

        assert!(remove_mod(&db, "../keep").is_err());
        assert!(remove_mod(&db, "..").is_err());
        assert!(remove_mod(&db, "").is_err());
        assert!(remove_mod(&db, "missing").is_err());
        assert!(root.join("keep").exists());
    }
}
