use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Declarative patch-action document shipped by every mod.
pub const PATCH_MANIFEST_FILE: &str = "modding.xml";

/// Per-machine unique id document (`{uniqueId, validFor}`).
pub const UNIQUE_ID_FILE: &str = "__deltaID.json";

/// Mod metadata document (`{metadata: {...}, dependencies: []}`).
pub const MOD_INFO_FILE: &str = "_deltamodInfo.json";

/// On-disk shape of `__deltaID.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueIdFile {
    #[serde(rename = "uniqueId")]
    pub unique_id: String,

    #[serde(rename = "validFor", default)]
    pub valid_for: String,
}

/// Human-facing metadata read from `_deltamodInfo.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModMetadata {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub demo_mod: bool,
}

/// A mod found in the mod database.
///
/// `folder` is the stable key into the database; `unique_id` is the persisted id,
/// possibly suffixed with `#<folder>` when two folders share an id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModDescriptor {
    pub folder: String,
    pub unique_id: String,
    /// Directory holding the mod's content after unwrapping any archive folder.
    pub root: Utf8PathBuf,
    pub metadata: ModMetadata,
    pub dependencies: Vec<serde_json::Value>,
}

impl ModDescriptor {
    /// Name used in logs and conflict reports.
    pub fn display_name(&self) -> &str {
        if self.metadata.name.is_empty() {
            &self.unique_id
        } else {
            &self.metadata.name
        }
    }
}

/// A mod folder that could not be turned into a [`ModDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModError {
    pub folder: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_serializes_root_as_string() {
        let descriptor = ModDescriptor {
            folder: "a".to_string(),
            unique_id: "id-a".to_string(),
            root: Utf8PathBuf::from("/mods/a"),
            metadata: ModMetadata {
                name: String::new(),
                version: "1.0.0".to_string(),
                author: "me".to_string(),
                description: String::new(),
                demo_mod: false,
            },
            dependencies: Vec::new(),
        };

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["root"], "/mods/a");
        assert_eq!(descriptor.display_name(), "id-a");
    }
}
