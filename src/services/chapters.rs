//! Chapter discovery and mapping of xdelta actions onto chapter slots.
//!
//! The external compiler addresses chapters by position, so the order produced
//! by [`discover_chapters`] must match its own enumeration: the root `data.win`
//! first, then one per immediate subdirectory in locale-aware name order.

use super::fs_utils::safe_read_dir;
use crate::models::XdeltaAction;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use std::cmp::Ordering;
use std::collections::HashMap;

/// The binary asset file every chapter holds.
pub const PRIMARY_ASSET: &str = "data.win";

/// Ordered absolute paths of the chapter asset files in an installation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChapterTargets {
    paths: Vec<Utf8PathBuf>,
}

impl ChapterTargets {
    pub fn new(paths: Vec<Utf8PathBuf>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[Utf8PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Position of `path` after lexical normalization, if it is a chapter.
    pub fn index_of(&self, path: &Utf8Path) -> Option<usize> {
        let needle = normalize_lexically(path);
        self.paths
            .iter()
            .position(|chapter| normalize_lexically(chapter) == needle)
    }
}

/// Discover chapter asset files under `install_root`.
///
/// An unreadable installation yields an empty list.
pub fn discover_chapters(install_root: &Utf8Path) -> ChapterTargets {
    let mut paths = Vec::new();

    let root_asset = install_root.join(PRIMARY_ASSET);
    if root_asset.is_file() {
        paths.push(root_asset);
    }

    let mut subdirs: Vec<Utf8PathBuf> = safe_read_dir(install_root)
        .into_iter()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.into_path())
        .collect();
    subdirs.sort_by(|a, b| {
        collate_names(a.file_name().unwrap_or(""), b.file_name().unwrap_or(""))
    });

    for dir in subdirs {
        let candidate = dir.join(PRIMARY_ASSET);
        if candidate.is_file() {
            paths.push(candidate);
        }
    }

    ChapterTargets::new(paths)
}

fn collation_class(c: char) -> u8 {
    if c.is_whitespace() {
        0
    } else if c.is_numeric() {
        2
    } else if c.is_alphabetic() {
        3
    } else {
        1
    }
}

fn primary_key(c: char) -> (u8, char) {
    (collation_class(c), c.to_lowercase().next().unwrap_or(c))
}

/// Compare directory names the way a default culture collation does.
///
/// Punctuation sorts before digits and digits before letters; case only breaks
/// ties (lowercase first), then the raw code points decide. With this order
/// `chapter1_windows` comes before `chapter10_windows`.
pub fn collate_names(a: &str, b: &str) -> Ordering {
    a.chars()
        .map(primary_key)
        .cmp(b.chars().map(primary_key))
        .then_with(|| {
            a.chars()
                .map(char::is_uppercase)
                .cmp(b.chars().map(char::is_uppercase))
        })
        .then_with(|| a.cmp(b))
}

/// Lexically normalize a path: drop `.` components and fold `..` into its parent.
pub fn normalize_lexically(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_str()),
        }
    }
    out
}

/// Resolve a manifest target to an absolute path inside the installation.
///
/// Empty or `.` means the root asset file; a leading `./` or `.\` is stripped;
/// absolute targets pass through; both `/` and `\` separate components.
pub fn resolve_target(install_root: &Utf8Path, declared: &str) -> Utf8PathBuf {
    let declared = declared.trim();
    let declared = if declared.is_empty() || declared == "." {
        PRIMARY_ASSET
    } else {
        declared
    };
    join_declared(install_root, declared)
}

/// Join a path written in a manifest onto `base`, accepting either separator.
pub fn join_declared(base: &Utf8Path, declared: &str) -> Utf8PathBuf {
    let cleaned = declared
        .strip_prefix("./")
        .or_else(|| declared.strip_prefix(".\\"))
        .unwrap_or(declared);

    let as_path = Utf8Path::new(cleaned);
    if as_path.is_absolute() {
        return normalize_lexically(as_path);
    }

    let mut resolved = base.to_path_buf();
    for part in cleaned.split(['/', '\\']).filter(|p| !p.is_empty()) {
        resolved.push(part);
    }
    normalize_lexically(&resolved)
}

/// xdelta patches grouped per chapter slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterPlan {
    pub chapters: ChapterTargets,
    /// `patches[i]` are the patch files for chapter `i`, in action order.
    pub patches: Vec<Vec<Utf8PathBuf>>,
    /// Actions whose target is not a discovered chapter.
    pub dropped: Vec<XdeltaAction>,
}

impl ChapterPlan {
    /// Assign each xdelta action to the chapter its target resolves to.
    pub fn build(
        install_root: &Utf8Path,
        chapters: ChapterTargets,
        xdeltas: &[XdeltaAction],
    ) -> Self {
        let index: HashMap<Utf8PathBuf, usize> = chapters
            .paths()
            .iter()
            .enumerate()
            .map(|(i, path)| (normalize_lexically(path), i))
            .collect();

        let mut patches = vec![Vec::new(); chapters.len()];
        let mut dropped = Vec::new();

        for action in xdeltas {
            let target = resolve_target(install_root, &action.declared_target);
            match index.get(&target) {
                Some(&slot) => patches[slot].push(action.patch.clone()),
                None => {
                    tracing::warn!("xdelta target not in discovered chapters (skip): {}", target);
                    dropped.push(action.clone());
                }
            }
        }

        Self {
            chapters,
            patches,
            dropped,
        }
    }

    pub fn total_patches(&self) -> usize {
        self.patches.iter().map(Vec::len).sum()
    }

    /// Compiler batching width: the most patches applied to any one chapter, at least 1.
    pub fn mod_amount(&self) -> usize {
        mod_amount(&self.patches.iter().map(Vec::len).collect::<Vec<_>>())
    }
}

/// Maximum of per-chapter patch counts, never below 1.
pub fn mod_amount(counts: &[usize]) -> usize {
    counts.iter().copied().max().unwrap_or(0).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        (temp_dir, root)
    }

    #[test]
    fn test_collate_names_punctuation_before_digits() {
        assert_eq!(
            collate_names("chapter1_windows", "chapter10_windows"),
            Ordering::Less
        );
        assert_eq!(collate_names("Chapter2", "chapter3"), Ordering::Less);
        assert_eq!(collate_names("chapter2", "Chapter2"), Ordering::Less);
        assert_eq!(collate_names("a", "a"), Ordering::Equal);
        assert_eq!(collate_names("ch9", "cha"), Ordering::Less);
    }

    #[test]
    fn test_discover_orders_two_digit_chapters_after_one_digit() {
        let (_guard, root) = temp_root();
        for dir in ["chapter10_windows", "chapter2_windows", "chapter1_windows"] {
            fs::create_dir_all(root.join(dir)).unwrap();
            fs::write(root.join(dir).join(PRIMARY_ASSET), "").unwrap();
        }

        let chapters = discover_chapters(&root);

        assert_eq!(
            chapters.paths(),
            &[
                root.join("chapter1_windows/data.win"),
                root.join("chapter10_windows/data.win"),
                root.join("chapter2_windows/data.win"),
            ]
        );
    }

    fn xdelta(patch: &str, target: &str) -> XdeltaAction {
        XdeltaAction {
            patch: Utf8PathBuf::from(patch),
            declared_target: target.to_string(),
            mod_name: "m".to_string(),
        }
    }

    #[test]
    fn test_discover_root_then_sorted_subdirs() {
        let (_guard, root) = temp_root();
        for dir in ["chapter3_windows", "chapter1_windows", "empty", "chapter2_windows"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        fs::write(root.join("data.win"), "").unwrap();
        fs::write(root.join("chapter1_windows/data.win"), "").unwrap();
        fs::write(root.join("chapter2_windows/data.win"), "").unwrap();
        fs::write(root.join("chapter3_windows/data.win"), "").unwrap();

        let chapters = discover_chapters(&root);
        assert_eq!(
            chapters.paths(),
            &[
                root.join("data.win"),
                root.join("chapter1_windows/data.win"),
                root.join("chapter2_windows/data.win"),
                root.join("chapter3_windows/data.win"),
            ]
        );
    }

    #[test]
    fn test_discover_without_root_asset() {
        let (_guard, root) = temp_root();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("b/data.win"), "").unwrap();

        let chapters = discover_chapters(&root);
        assert_eq!(chapters.paths(), &[root.join("b/data.win")]);
    }

    #[test]
    fn test_discover_missing_install() {
        let (_guard, root) = temp_root();
        assert!(discover_chapters(&root.join("nope")).is_empty());
    }

    #[test]
    fn test_resolve_target_variants() {
        let root = Utf8Path::new("/game");
        assert_eq!(resolve_target(root, ""), Utf8PathBuf::from("/game/data.win"));
        assert_eq!(resolve_target(root, "."), Utf8PathBuf::from("/game/data.win"));
        assert_eq!(
            resolve_target(root, "./chapter1/data.win"),
            Utf8PathBuf::from("/game/chapter1/data.win")
        );
        assert_eq!(
            resolve_target(root, ".\\chapter1\\data.win"),
            Utf8PathBuf::from("/game/chapter1/data.win")
        );
        assert_eq!(
            resolve_target(root, "/abs/elsewhere.png"),
            Utf8PathBuf::from("/abs/elsewhere.png")
        );
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Utf8Path::new("/a/./b/../c")),
            Utf8PathBuf::from("/a/c")
        );
    }

    #[test]
    fn test_plan_maps_and_drops() {
        let root = Utf8Path::new("/game");
        let chapters = ChapterTargets::new(vec![
            Utf8PathBuf::from("/game/data.win"),
            Utf8PathBuf::from("/game/chapter1/data.win"),
        ]);
        let actions = vec![
            xdelta("/m/a.xdelta", "data.win"),
            xdelta("/m/b.xdelta", "chapter1/data.win"),
            xdelta("/m/c.xdelta", "./data.win"),
            xdelta("/m/d.xdelta", "chapter9/data.win"),
        ];

        let plan = ChapterPlan::build(root, chapters, &actions);

        assert_eq!(plan.patches[0].len(), 2);
        assert_eq!(plan.patches[1], vec![Utf8PathBuf::from("/m/b.xdelta")]);
        assert_eq!(plan.dropped.len(), 1);
        assert_eq!(plan.total_patches(), 3);
        assert_eq!(plan.mod_amount(), 2);
    }

    #[test]
    fn test_mod_amount() {
        assert_eq!(mod_amount(&[2, 0, 1]), 2);
        assert_eq!(mod_amount(&[0, 0]), 1);
        assert_eq!(mod_amount(&[]), 1);
    }

    #[test]
    fn test_index_of_normalizes() {
        let chapters = ChapterTargets::new(vec![Utf8PathBuf::from("/game/ch1/data.win")]);
        assert_eq!(
            chapters.index_of(Utf8Path::new("/game/./ch1/data.win")),
            Some(0)
        );
        assert_eq!(chapters.index_of(Utf8Path::new("/game/data.win")), None);
    }
}
