//! Services module - the patching engine.
//!
//! Everything here operates on plain paths and explicit parameters; nothing
//! reads global state. Front-ends (the CLI in `main.rs`) load settings, build a
//! [`PatchContext`] and call into these functions.
//!
//! # Components
//!
//! - [`discovery`]: scans the mod database into [`ModDescriptor`](crate::models::ModDescriptor)s,
//!   generating and persisting missing unique ids
//! - [`actions`]: parses each enabled mod's `modding.xml` into xdelta and override actions
//! - [`chapters`]: discovers chapter `data.win` files and maps xdelta targets onto them
//! - [`backup`]: `.original` snapshots, restore, and the crash-recovery scan
//! - [`compiler`]: drives the external patch compiler and post-processor
//! - [`conflicts`]: finds override destinations claimed by several mods
//! - [`patching`]: the run itself, [`start_patch`], with rollback on compiler failure
//! - [`import`]: adds `.zip` and `.7z` mods to the database and removes mods from it
//! - [`game`]: installation checks, edition detection, and launching the game
//!
//! # Run order
//!
//! 1. Restore leftover backups (a previous run may have crashed)
//! 2. Discover mods and extract actions from the enabled ones
//! 3. Discover chapters; no chapters is a hard stop
//! 4. Back up every chapter and override destination
//! 5. Compile and copy results back, rolling back all chapters on failure
//! 6. Refuse to continue on override conflicts
//! 7. Copy overrides
//!
//! # Usage Example
//!
//! ```ignore
//! use deltaforge::services::{PatchContext, start_patch};
//!
//! let ctx = PatchContext::from_settings(&settings, &base_dir);
//! let outcome = start_patch(&ctx, &install_root, &mod_db, &settings.enabled_mods).await;
//! if !outcome.patched {
//!     eprintln!("{}", outcome.log);
//! }
//! ```

pub mod actions;
pub mod backup;
pub mod chapters;
pub mod compiler;
pub mod conflicts;
pub mod discovery;
pub mod fs_utils;
pub mod game;
pub mod import;
pub mod patching;

pub use backup::{BACKUP_SUFFIX, ensure_backup, restore_if_backup, restore_originals_if_any};
pub use chapters::{ChapterPlan, ChapterTargets, discover_chapters};
pub use compiler::{PatchCompiler, ToolError, ToolInvocation};
pub use conflicts::detect_conflicts;
pub use discovery::{DiscoveryReport, discover_mods, generate_unique_id};
pub use game::{GameSession, detect_edition, launch_and_restore, locate_executable};
pub use import::{import_mod_archive, remove_mod};
pub use patching::{PatchContext, PatchError, PatchOutcome, start_patch};
