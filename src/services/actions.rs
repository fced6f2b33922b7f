//! Patch manifest (`modding.xml`) parsing and action extraction.
//!
//! A manifest is read into a flat, document-ordered list of [`ManifestElement`]s.
//! Classification then works only on that typed list; attribute spellings are
//! resolved through the ordered alias tables below, first non-empty match wins.

use super::chapters::{PRIMARY_ASSET, join_declared, resolve_target};
use super::fs_utils::{find_first_by_name, safe_stat};
use crate::models::{Action, ModDescriptor, OverrideAction, PATCH_MANIFEST_FILE, XdeltaAction};
use crate::state::StateManager;
use anyhow::{Context, Result, bail};
use camino::Utf8Path;
use indexmap::{IndexMap, IndexSet};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::fs;

/// Attributes naming an xdelta patch file, in precedence order.
pub const PATCH_SOURCE_ATTRS: &[&str] = &["patch", "file", "path", "src"];

/// Attributes naming an override's source file, in precedence order.
pub const OVERRIDE_SOURCE_ATTRS: &[&str] = &["from", "patch", "file", "path", "src"];

/// Attributes naming the file an action applies to, in precedence order.
pub const TARGET_ATTRS: &[&str] = &["to", "dest", "target"];

/// One element of a patch manifest. Names and attribute keys are lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManifestElement {
    pub name: String,
    pub attributes: IndexMap<String, String>,
}

impl ManifestElement {
    /// Value of the first alias present with a non-empty value.
    pub fn pick_attr(&self, aliases: &[&str]) -> Option<&str> {
        aliases.iter().find_map(|key| {
            self.attributes
                .get(*key)
                .map(String::as_str)
                .filter(|v| !v.trim().is_empty())
        })
    }

    fn kind(&self) -> String {
        self.attributes
            .get("type")
            .map(|t| t.to_lowercase())
            .unwrap_or_default()
    }

    /// `<xdelta>`, or any element typed `xdelta` (`<patch type="xdelta">`, `<delta type="xdelta">`).
    pub fn is_xdelta(&self) -> bool {
        self.name == "xdelta" || self.kind() == "xdelta"
    }

    /// `<file>`/`<override>`, or any element typed `override` or `file`.
    pub fn is_override(&self) -> bool {
        let kind = self.kind();
        matches!(self.name.as_str(), "file" | "override") || kind == "override" || kind == "file"
    }
}

fn element_from(start: &BytesStart<'_>) -> ManifestElement {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).to_lowercase();
    let mut attributes = IndexMap::new();
    for attr in start.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_lowercase();
        if let Ok(value) = attr.unescape_value() {
            attributes.entry(key).or_insert_with(|| value.into_owned());
        }
    }
    ManifestElement { name, attributes }
}

/// Parse manifest text into its elements in document order.
pub fn parse_manifest(xml: &str) -> Result<Vec<ManifestElement>> {
    let mut reader = Reader::from_str(xml.trim_start_matches('\u{feff}'));
    reader.trim_text(true);

    let mut elements = Vec::new();
    let mut depth: usize = 0;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                elements.push(element_from(&e));
            }
            Ok(Event::Empty(e)) => elements.push(element_from(&e)),
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => bail!(
                "Malformed manifest at byte {}: {}",
                reader.buffer_position(),
                e
            ),
        }
    }

    if depth != 0 {
        bail!("Malformed manifest: {} unclosed element(s)", depth);
    }
    Ok(elements)
}

/// Turn one element into an action, or `None` if it is not one.
///
/// An element that looks like an xdelta but has no patch source is still
/// considered as an override.
fn element_action(
    element: &ManifestElement,
    mod_root: &Utf8Path,
    install_root: &Utf8Path,
    mod_name: &str,
) -> Option<Action> {
    if element.is_xdelta() {
        if let Some(source) = element.pick_attr(PATCH_SOURCE_ATTRS) {
            let patch = join_declared(mod_root, source);
            let declared_target = element.pick_attr(TARGET_ATTRS).unwrap_or(PRIMARY_ASSET);
            tracing::debug!(
                "  + xdelta: {} (size {}) -> {}",
                patch,
                safe_stat(&patch).map(|m| m.len() as i64).unwrap_or(-1),
                declared_target
            );
            return Some(Action::Xdelta(XdeltaAction {
                patch,
                declared_target: declared_target.to_string(),
                mod_name: mod_name.to_string(),
            }));
        }
    }

    if element.is_override() {
        let source = element.pick_attr(OVERRIDE_SOURCE_ATTRS)?;
        let target = element.pick_attr(TARGET_ATTRS)?;
        let source = join_declared(mod_root, source);
        let destination = resolve_target(install_root, target);
        tracing::debug!("  + override: {} -> {}", source, destination);
        return Some(Action::Override(OverrideAction {
            source,
            destination,
            mod_name: mod_name.to_string(),
        }));
    }

    None
}

/// Actions declared by one mod's parsed manifest, in document order.
pub fn extract_mod_actions(
    descriptor: &ModDescriptor,
    elements: &[ManifestElement],
    install_root: &Utf8Path,
) -> Vec<Action> {
    let mod_name = descriptor.display_name();
    elements
        .iter()
        .filter_map(|element| element_action(element, &descriptor.root, install_root, mod_name))
        .collect()
}

fn read_manifest(descriptor: &ModDescriptor) -> Result<Vec<ManifestElement>> {
    let path = find_first_by_name(&descriptor.root, PATCH_MANIFEST_FILE)
        .with_context(|| format!("{} not found in {}", PATCH_MANIFEST_FILE, descriptor.root))?;
    let xml = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read manifest: {}", path))?;
    parse_manifest(&xml).with_context(|| format!("Failed to parse manifest: {}", path))
}

/// Collect the actions of every enabled mod.
///
/// Mods are visited in the enabled set's insertion order. An enabled id with no
/// matching mod, or a mod whose manifest cannot be read, is logged and skipped.
pub fn extract_actions(
    install_root: &Utf8Path,
    mods: &[ModDescriptor],
    enabled: &IndexSet<String>,
    state: &StateManager,
) -> Vec<Action> {
    let mut actions = Vec::new();

    for unique_id in enabled {
        let Some(descriptor) = mods.iter().find(|m| &m.unique_id == unique_id) else {
            state.log_line(format!("Enabled mod not found in database: {}", unique_id));
            continue;
        };

        if descriptor.metadata.name.is_empty() {
            state.log_line(format!("Applying mod: {}", unique_id));
        } else {
            state.log_line(format!(
                "Applying mod: {} ({})",
                unique_id, descriptor.metadata.name
            ));
        }

        match read_manifest(descriptor) {
            Ok(elements) => {
                tracing::debug!(
                    "Parsed {} manifest element(s) for {}",
                    elements.len(),
                    descriptor.folder
                );
                actions.extend(extract_mod_actions(descriptor, &elements, install_root));
            }
            Err(e) => state.log_line(format!("Error reading mod {}: {:#}", descriptor.folder, e)),
        }
    }

    actions
}
