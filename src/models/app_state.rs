use std::fmt;

/// Maximum number of patch runs in flight.
///
/// **IMPORTANT:** The external compiler keeps its working state on disk
/// (`Cache/running/chapterNumber.txt`, `modNumbersCache.txt`, `xDeltaCombiner/`),
/// so two concurrent runs would overwrite each other's intermediate artifacts.
/// [`crate::state::StateManager::start_patch`] refuses a second run while one is active.
pub const MAX_CONCURRENT_PATCH_RUNS: usize = 1;

/// Coarse phases of a patch run, in the order they execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStep {
    Restoring,
    Discovering,
    Extracting,
    ResolvingChapters,
    BackingUp,
    Compiling,
    CopyingBack,
    CheckingConflicts,
    ApplyingOverrides,
}

impl fmt::Display for PatchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PatchStep::Restoring => "Restoring originals",
            PatchStep::Discovering => "Discovering mods",
            PatchStep::Extracting => "Reading patch manifests",
            PatchStep::ResolvingChapters => "Resolving chapters",
            PatchStep::BackingUp => "Backing up targets",
            PatchStep::Compiling => "Running patch compiler",
            PatchStep::CopyingBack => "Copying patched chapters",
            PatchStep::CheckingConflicts => "Checking override conflicts",
            PatchStep::ApplyingOverrides => "Applying file overrides",
        };
        f.write_str(label)
    }
}

/// Progress of the patch run currently owned by a [`crate::state::StateManager`].
///
/// # Thread Safety
///
/// `RunState` is wrapped in `Arc<RwLock<RunState>>` by [`crate::state::StateManager`].
/// Mutate it through the manager so that change events are emitted.
#[derive(Clone, Debug, Default)]
pub struct RunState {
    pub is_patching: bool,
    pub current_step: Option<PatchStep>,

    /// Human-readable step log returned to the caller at the end of the run.
    pub log: Vec<String>,

    pub enabled_mods: usize,
    pub chapters: usize,
    pub chapters_produced: Vec<usize>,
    pub chapters_missing: Vec<usize>,

    pub last_run_patched: Option<bool>,
}

impl RunState {
    /// Clear everything belonging to a previous run.
    pub fn reset_run(&mut self) {
        self.is_patching = false;
        self.current_step = None;
        self.log.clear();
        self.enabled_mods = 0;
        self.chapters = 0;
        self.chapters_produced.clear();
        self.chapters_missing.clear();
    }

    /// The accumulated step log as one newline-separated string.
    pub fn joined_log(&self) -> String {
        self.log.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_run_keeps_last_result() {
        let mut state = RunState {
            is_patching: true,
            current_step: Some(PatchStep::Compiling),
            log: vec!["one".to_string()],
            chapters: 3,
            last_run_patched: Some(true),
            ..RunState::default()
        };

        state.reset_run();

        assert!(!state.is_patching);
        assert!(state.current_step.is_none());
        assert!(state.log.is_empty());
        assert_eq!(state.chapters, 0);
        assert_eq!(state.last_run_patched, Some(true));
    }

    #[test]
    fn test_joined_log() {
        let state = RunState {
            log: vec!["a".to_string(), "b".to_string()],
            ..RunState::default()
        };
        assert_eq!(state.joined_log(), "a\nb");
    }

    #[test]
    fn test_step_labels() {
        assert_eq!(PatchStep::Compiling.to_string(), "Running patch compiler");
        assert_eq!(PatchStep::ApplyingOverrides.to_string(), "Applying file overrides");
    }
}
