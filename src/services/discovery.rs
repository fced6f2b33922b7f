//! Mod database scanning.
//!
//! Every immediate subdirectory of the mod database is one mod. A folder that
//! cannot be read as a mod is reported in [`DiscoveryReport::errors`] and the
//! scan carries on with the next one.

use super::fs_utils::{find_first_by_name, find_mod_root, safe_read_dir};
use crate::models::{
    GameEdition, MOD_INFO_FILE, ModDescriptor, ModError, ModMetadata, UNIQUE_ID_FILE,
    UniqueIdFile,
};
use anyhow::{Context, Result};
use camino::Utf8Path;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_MOD_VERSION: &str = "1.0.0";

/// Result of scanning the mod database.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub mod_list: Vec<ModDescriptor>,
    pub errors: Vec<ModError>,
}

impl DiscoveryReport {
    pub fn find(&self, unique_id: &str) -> Option<&ModDescriptor> {
        self.mod_list.iter().find(|m| m.unique_id == unique_id)
    }

    pub fn find_folder(&self, folder: &str) -> Option<&ModDescriptor> {
        self.mod_list.iter().find(|m| m.folder == folder)
    }

    /// Mods compatible with an installation's edition.
    pub fn for_edition(&self, edition: GameEdition) -> Vec<&ModDescriptor> {
        self.mod_list
            .iter()
            .filter(|m| edition.accepts(m.metadata.demo_mod))
            .collect()
    }
}

fn host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

fn host_suffix() -> String {
    static NON_ID_CHARS: OnceLock<Option<Regex>> = OnceLock::new();
    let host = host_name();
    match NON_ID_CHARS.get_or_init(|| Regex::new(r"[^A-Za-z0-9-]+").ok()) {
        Some(pattern) => pattern.replace_all(&host, "-").into_owned(),
        None => host,
    }
}

/// Generate a new per-machine mod id: `deltamod_<random hex>_<unix millis>_<host>`.
pub fn generate_unique_id() -> String {
    let random: [u8; 8] = rand::random();
    let hex: String = random.iter().map(|b| format!("{:02x}", b)).collect();
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("deltamod_{}_{}_{}", hex, millis, host_suffix())
}

fn read_unique_id(path: &Utf8Path) -> Option<UniqueIdFile> {
    let raw = fs::read_to_string(path).ok()?;
    let parsed: UniqueIdFile = serde_json::from_str(&raw).ok()?;
    if parsed.unique_id.trim().is_empty() {
        None
    } else {
        Some(parsed)
    }
}

/// Read the mod's id, generating and persisting a fresh one if missing or malformed.
fn load_or_create_unique_id(mod_root: &Utf8Path, folder: &str) -> String {
    let existing = find_first_by_name(mod_root, UNIQUE_ID_FILE);
    if let Some(id) = existing.as_deref().and_then(read_unique_id) {
        return id.unique_id;
    }

    let fresh = UniqueIdFile {
        unique_id: generate_unique_id(),
        valid_for: host_name(),
    };
    tracing::info!("Generating unique id for mod: {}", folder);

    let id_path = existing.unwrap_or_else(|| mod_root.join(UNIQUE_ID_FILE));
    let persisted = serde_json::to_string_pretty(&fresh)
        .context("Failed to serialize unique id")
        .and_then(|json| {
            fs::write(&id_path, json)
                .with_context(|| format!("Failed to write unique id: {}", id_path))
        });
    if let Err(e) = persisted {
        tracing::warn!("Keeping unique id in memory only for {}: {:#}", folder, e);
    }

    fresh.unique_id
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn non_empty_str<'a>(meta: &'a Value, key: &str) -> Option<&'a str> {
    meta.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Parse `_deltamodInfo.json` into metadata and dependencies.
///
/// `name` and `description` must be strings and `demoMod` must be present.
fn parse_mod_info(raw: &str, folder: &str) -> Result<(ModMetadata, Vec<Value>), String> {
    let info: Value =
        serde_json::from_str(raw).map_err(|e| format!("{} is not valid JSON: {}", MOD_INFO_FILE, e))?;
    let meta = info
        .get("metadata")
        .filter(|m| m.is_object())
        .ok_or_else(|| format!("Missing metadata object in {}", MOD_INFO_FILE))?;

    let has_string = |key: &str| meta.get(key).is_some_and(Value::is_string);
    if !has_string("name") || !has_string("description") || meta.get("demoMod").is_none() {
        return Err(format!(
            "Missing required fields in {} for mod: {}",
            MOD_INFO_FILE, folder
        ));
    }

    let metadata = ModMetadata {
        name: non_empty_str(meta, "name").unwrap_or(folder).to_string(),
        version: non_empty_str(meta, "version")
            .unwrap_or(DEFAULT_MOD_VERSION)
            .to_string(),
        author: non_empty_str(meta, "author")
            .map(str::to_string)
            .unwrap_or_else(host_name),
        description: non_empty_str(meta, "description").unwrap_or("").to_string(),
        demo_mod: meta.get("demoMod").is_some_and(truthy),
    };

    let dependencies = info
        .get("dependencies")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    Ok((metadata, dependencies))
}

fn read_mod(mod_dir: &Utf8Path, folder: &str) -> Result<ModDescriptor, String> {
    let root = find_mod_root(mod_dir);
    let info_path = find_first_by_name(&root, MOD_INFO_FILE)
        .ok_or_else(|| format!("{} not found", MOD_INFO_FILE))?;
    let raw = fs::read_to_string(&info_path)
        .map_err(|e| format!("Failed to read {}: {}", info_path, e))?;

    let unique_id = load_or_create_unique_id(&root, folder);
    let (metadata, dependencies) = parse_mod_info(&raw, folder)?;
    Ok(ModDescriptor {
        folder: folder.to_string(),
        unique_id,
        root,
        metadata,
        dependencies,
    })
}

/// Scan `mod_database` for mods, in folder-name order.
///
/// A missing database yields an empty report. Duplicate ids are made unique in
/// memory only, as `<id>#<folder>`; the id file on disk is left alone.
pub fn discover_mods(mod_database: &Utf8Path) -> DiscoveryReport {
    let mut folders: Vec<String> = safe_read_dir(mod_database)
        .into_iter()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string())
        .collect();
    folders.sort();

    let mut report = DiscoveryReport::default();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for folder in folders {
        let mod_dir = mod_database.join(&folder);
        match read_mod(&mod_dir, &folder) {
            Ok(mut descriptor) => {
                if seen_ids.contains(&descriptor.unique_id) {
                    tracing::warn!(
                        "Duplicate mod id {} in folder {}",
                        descriptor.unique_id,
                        folder
                    );
                    descriptor.unique_id = format!("{}#{}", descriptor.unique_id, folder);
                }
                seen_ids.insert(descriptor.unique_id.clone());

                tracing::debug!("Discovered mod {} ({})", descriptor.unique_id, folder);
                report.mod_list.push(descriptor);
            }
            Err(reason) => {
                tracing::warn!("Error reading mod info for {}: {}", folder, reason);
                report.errors.push(ModError { folder, reason });
            }
        }
    }

    tracing::info!(
        "Mod database scan: {} mod(s), {} error(s)",
        report.mod_list.len(),
        report.errors.len()
    );
    report
}
