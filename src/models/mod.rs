//! Data models for the DeltaForge patching engine.
//!
//! This module contains the plain data structures passed between services:
//! - [`RunState`]: Progress and step log of the patch run in flight
//! - [`UserConfig`]: Paths, tool locations and enabled mods loaded from `DeltaForge Config.yaml`
//! - [`ModDescriptor`]: A mod discovered in the mod database
//! - [`Action`]: A normalized xdelta or override action extracted from a mod manifest
//! - [`Conflict`]: Override destinations claimed by more than one mod
//!
//! None of these types are persisted except [`UserConfig`] and [`UniqueIdFile`];
//! everything else is recomputed on every run.

pub mod action;
pub mod app_state;
pub mod config;
pub mod mod_descriptor;

pub use action::{Action, Conflict, OverrideAction, XdeltaAction, partition_actions};
pub use app_state::{MAX_CONCURRENT_PATCH_RUNS, PatchStep, RunState};
pub use config::{ForgeSettings, GameEdition, RunLimits, ToolPaths, UserConfig};
pub use mod_descriptor::{
    MOD_INFO_FILE, ModDescriptor, ModError, ModMetadata, PATCH_MANIFEST_FILE, UNIQUE_ID_FILE,
    UniqueIdFile,
};
