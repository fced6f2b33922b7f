//! The patch run: discovery through override application, with rollback.
//!
//! [`start_patch`] is the single entry point. It never returns `Err`; every
//! failure is reported in [`PatchOutcome::error`] together with the step log.

use super::actions::extract_actions;
use super::backup::{ensure_backup, restore_if_backup, restore_originals_if_any};
use super::chapters::{ChapterPlan, discover_chapters};
use super::compiler::{PatchCompiler, ToolError};
use super::conflicts::{describe_conflicts, detect_conflicts};
use super::discovery::discover_mods;
use super::fs_utils::copy_over;
use crate::metrics::Metrics;
use crate::models::{
    Conflict, ForgeSettings, OverrideAction, PatchStep, RunLimits, ToolPaths, partition_actions,
};
use crate::state::StateManager;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;
use std::sync::Arc;
use thiserror::Error;

/// Why a patch run did not complete.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Patch compiler missing at {0}")]
    ToolMissing(Utf8PathBuf),

    #[error("No data.win found under {0}")]
    NoChapters(Utf8PathBuf),

    #[error("Patch compiler error: {0}")]
    Tool(#[from] ToolError),

    #[error(
        "Conflicting file overrides (chapter files are merged by the compiler):\n{}",
        describe_conflicts(.0)
    )]
    Conflicts(Vec<Conflict>),

    #[error("A patch run is already in progress")]
    Busy,

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Everything a patch run needs from the embedding application.
///
/// One context is created per application instance and reused across runs.
#[derive(Clone)]
pub struct PatchContext {
    pub state: Arc<StateManager>,
    pub metrics: Arc<Metrics>,
    pub tools: ToolPaths,
    pub limits: RunLimits,
}

impl PatchContext {
    pub fn new(tools: ToolPaths, limits: RunLimits) -> Self {
        Self {
            state: Arc::new(StateManager::new()),
            metrics: Arc::new(Metrics::new()),
            tools,
            limits,
        }
    }

    /// Build a context from saved settings; `base_dir` anchors the bundled tool layout.
    pub fn from_settings(settings: &ForgeSettings, base_dir: &Utf8Path) -> Self {
        Self::new(settings.tool_paths(base_dir), settings.run_limits())
    }

    fn compiler(&self) -> PatchCompiler {
        PatchCompiler::new(self.tools.clone(), self.limits, Arc::clone(&self.metrics))
    }
}

/// Result of [`start_patch`].
#[derive(Debug)]
pub struct PatchOutcome {
    pub patched: bool,
    /// Step log of the run, newline separated.
    pub log: String,
    pub error: Option<PatchError>,
    /// Chapters that had patches but for which the compiler produced nothing.
    pub missing_chapters: Vec<Utf8PathBuf>,
}

impl PatchOutcome {
    /// The conflict list if the run stopped on override conflicts.
    pub fn conflicts(&self) -> Option<&[Conflict]> {
        match &self.error {
            Some(PatchError::Conflicts(conflicts)) => Some(conflicts),
            _ => None,
        }
    }
}

fn backup_target(ctx: &PatchContext, target: &Utf8Path) -> Result<(), PatchError> {
    if ensure_backup(target)? {
        ctx.metrics.record_backup();
    }
    Ok(())
}

/// Put every chapter back from its backup after a failed compiler run.
fn rollback_chapters(ctx: &PatchContext, chapters: &[Utf8PathBuf]) {
    let mut restored = 0;
    for chapter in chapters {
        match restore_if_backup(chapter) {
            Ok(true) => restored += 1,
            Ok(false) => {}
            Err(e) => tracing::error!("Rollback of {} failed: {:#}", chapter, e),
        }
    }
    ctx.metrics.record_restored(restored);
    ctx.state.record_restored(restored);
}

fn apply_overrides(ctx: &PatchContext, overrides: &[OverrideAction]) {
    for action in overrides {
        if !action.source.exists() {
            ctx.state
                .log_line(format!("Missing file in mod: {}", action.source));
            continue;
        }
        tracing::info!("Copy override: {} -> {}", action.source, action.destination);
        match copy_over(&action.source, &action.destination) {
            Ok(()) => ctx.metrics.record_override(),
            Err(e) => ctx.state.log_line(format!(
                "Error copying {} -> {}: {:#}",
                action.source, action.destination, e
            )),
        }
    }
}

async fn run_patch(
    ctx: &PatchContext,
    install_root: &Utf8Path,
    mod_database: &Utf8Path,
    enabled: &IndexSet<String>,
) -> Result<Vec<Utf8PathBuf>, PatchError> {
    let state = ctx.state.as_ref();
    let compiler = ctx.compiler();

    if let Some(missing) = compiler.missing_tool() {
        return Err(PatchError::ToolMissing(missing));
    }

    state.set_step(PatchStep::Restoring);
    let restored = restore_originals_if_any(install_root);
    if !restored.is_empty() {
        ctx.metrics.record_restored(restored.len());
        state.record_restored(restored.len());
        state.log_line(format!(
            "Restored {} leftover original(s) before patching",
            restored.len()
        ));
    }

    state.set_step(PatchStep::Discovering);
    let report = discover_mods(mod_database);
    for failure in &report.errors {
        state.log_line(format!(
            "Skipping mod {}: {}",
            failure.folder, failure.reason
        ));
    }

    state.set_step(PatchStep::Extracting);
    let actions = extract_actions(install_root, &report.mod_list, enabled, state);
    let (xdeltas, overrides) = partition_actions(actions);
    tracing::info!(
        "Collected: {} xdelta(s), {} override(s)",
        xdeltas.len(),
        overrides.len()
    );

    state.set_step(PatchStep::ResolvingChapters);
    let chapters = discover_chapters(install_root);
    if chapters.is_empty() {
        return Err(PatchError::NoChapters(install_root.to_path_buf()));
    }
    state.set_chapters(chapters.len());
    tracing::info!("Chapters detected: {:?}", chapters.paths());

    let plan = ChapterPlan::build(install_root, chapters, &xdeltas);
    for dropped in &plan.dropped {
        state.log_line(format!(
            "Skipping xdelta from {} with unknown target {}",
            dropped.mod_name, dropped.declared_target
        ));
    }

    state.set_step(PatchStep::BackingUp);
    let compiling = plan.total_patches() > 0;
    if compiling {
        for chapter in plan.chapters.paths() {
            backup_target(ctx, chapter)?;
        }
    }
    for action in &overrides {
        backup_target(ctx, &action.destination)?;
    }

    let mut missing_chapters = Vec::new();
    if compiling {
        state.set_step(PatchStep::Compiling);
        match compiler.compile(install_root, &plan, state).await {
            Ok(report) => {
                state.set_step(PatchStep::CopyingBack);
                missing_chapters = report
                    .missing
                    .iter()
                    .map(|&index| plan.chapters.paths()[index].clone())
                    .collect();
                tracing::info!(
                    "Compiler replaced {} chapter(s), {} missing",
                    report.replaced.len(),
                    report.missing.len()
                );
            }
            Err(e) => {
                tracing::error!("Compiler error, restoring backups: {}", e);
                rollback_chapters(ctx, plan.chapters.paths());
                return Err(PatchError::Tool(e));
            }
        }
    } else {
        state.log_line("No xdelta patches; skipping the compiler (only overrides will be applied).");
    }

    state.set_step(PatchStep::CheckingConflicts);
    let conflicts = detect_conflicts(&overrides);
    if !conflicts.is_empty() {
        return Err(PatchError::Conflicts(conflicts));
    }

    state.set_step(PatchStep::ApplyingOverrides);
    apply_overrides(ctx, &overrides);

    Ok(missing_chapters)
}

/// Apply the enabled mods to an installation.
///
/// Mods are applied in the enabled set's insertion order. Leftover backups are
/// restored first, so every run starts from the unpatched game. If the compiler
/// fails, every chapter is rolled back and no override is applied; if overrides
/// conflict, merged chapters stay but no override is applied.
pub async fn start_patch(
    ctx: &PatchContext,
    install_root: &Utf8Path,
    mod_database: &Utf8Path,
    enabled: &IndexSet<String>,
) -> PatchOutcome {
    if !ctx.state.start_patch(enabled.len()) {
        return PatchOutcome {
            patched: false,
            log: PatchError::Busy.to_string(),
            error: Some(PatchError::Busy),
            missing_chapters: Vec::new(),
        };
    }

    tracing::info!("== start patch ==");
    tracing::info!("install: {}", install_root);
    tracing::info!("mod database: {}", mod_database);
    tracing::info!("enabled mods: {:?}", enabled);

    let result = run_patch(ctx, install_root, mod_database, enabled).await;

    let outcome = match result {
        Ok(missing_chapters) => {
            ctx.state.log_line("Patched via compiler + overrides.");
            PatchOutcome {
                patched: true,
                log: ctx.state.joined_log(),
                error: None,
                missing_chapters,
            }
        }
        Err(e) => {
            ctx.state.log_line(e.to_string());
            tracing::error!("Patching failed: {}", e);
            PatchOutcome {
                patched: false,
                log: ctx.state.joined_log(),
                error: Some(e),
                missing_chapters: Vec::new(),
            }
        }
    };

    ctx.state.finish_patch(outcome.patched);
    ctx.metrics.log_summary();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_error_lists_every_destination() {
        let error = PatchError::Conflicts(vec![Conflict {
            destination: Utf8PathBuf::from("/game/a.png"),
            mods: vec!["A".to_string(), "B".to_string()],
        }]);

        let message = error.to_string();
        assert!(message.contains("/game/a.png: A, B"));
    }

    #[tokio::test]
    async fn test_busy_context_refuses_second_run() {
        let ctx = PatchContext::new(
            ToolPaths {
                compiler: Utf8PathBuf::from("/nonexistent/GM3P.dll"),
                compiler_runtime: None,
                output_dir: Utf8PathBuf::from("/nonexistent/output"),
                post_processor: Utf8PathBuf::from("/nonexistent/cli"),
                post_processor_runtime: None,
                scripts_dir: Utf8PathBuf::from("/nonexistent/Scripts"),
            },
            RunLimits::default(),
        );
        assert!(ctx.state.start_patch(0));

        let outcome = start_patch(
            &ctx,
            Utf8Path::new("/nonexistent/game"),
            Utf8Path::new("/nonexistent/db"),
            &IndexSet::new(),
        )
        .await;

        assert!(!outcome.patched);
        assert!(matches!(outcome.error, Some(PatchError::Busy)));
    }

    #[tokio::test]
    async fn test_missing_tool_fails_before_touching_install() {
        let ctx = PatchContext::new(
            ToolPaths {
                compiler: Utf8PathBuf::from("/nonexistent/GM3P.dll"),
                compiler_runtime: None,
                output_dir: Utf8PathBuf::from("/nonexistent/output"),
                post_processor: Utf8PathBuf::from("/nonexistent/cli"),
                post_processor_runtime: None,
                scripts_dir: Utf8PathBuf::from("/nonexistent/Scripts"),
            },
            RunLimits::default(),
        );

        let outcome = start_patch(
            &ctx,
            Utf8Path::new("/nonexistent/game"),
            Utf8Path::new("/nonexistent/db"),
            &IndexSet::new(),
        )
        .await;

        assert!(!outcome.patched);
        assert!(matches!(outcome.error, Some(PatchError::ToolMissing(_))));
        assert!(outcome.log.contains("Patch compiler missing"));
        assert!(!ctx.state.read(|s| s.is_patching));
    }
}
