// State management module
//
// This module provides the StateManager which wraps RunState with thread-safe access
// using Arc<RwLock<T>> and emits change events for progress reporting.

use crate::models::{PatchStep, RunState};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Change events emitted when the run state is modified
///
/// Front-ends subscribe to these instead of polling the state.
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// A patch run has started
    PatchStarted { enabled_mods: usize },

    /// The run moved to a new phase
    StepChanged { step: PatchStep },

    /// A line was appended to the run log
    LogLine { line: String },

    /// Chapters were discovered in the installation
    ChaptersDiscovered { count: usize },

    /// A chapter's compiler output was checked during copy-back
    ChapterProcessed { index: usize, produced: bool },

    /// The patch run has finished
    PatchFinished { patched: bool },

    /// Backups were restored by a scan
    OriginalsRestored { count: usize },
}

/// The parts of [`RunState`] that change events are derived from.
#[derive(Clone, Copy)]
struct Watched {
    is_patching: bool,
    current_step: Option<PatchStep>,
    chapters: usize,
    log_len: usize,
}

impl Watched {
    fn of(state: &RunState) -> Self {
        Self {
            is_patching: state.is_patching,
            current_step: state.current_step,
            chapters: state.chapters,
            log_len: state.log.len(),
        }
    }
}

/// Thread-safe run context with event emission
///
/// One `StateManager` is created per application instance and handed to the
/// patch orchestrator inside a [`crate::services::PatchContext`]. It is the
/// progress sink and the log sink for a run:
/// - [`log_line()`](Self::log_line) appends to the step log returned to the caller
/// - [`set_step()`](Self::set_step) reports phase changes
/// - [`subscribe()`](Self::subscribe) lets a front-end follow along
pub struct StateManager {
    state: Arc<RwLock<RunState>>,

    /// Broadcast channel for emitting state change events
    state_tx: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a new StateManager with a broadcast buffer of 256 events
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(RunState::default())),
            state_tx,
        }
    }

    /// Get a cloned snapshot of the current state
    pub fn snapshot(&self) -> RunState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Execute a function with read access to the state
    ///
    /// # Example
    /// ```ignore
    /// let busy = state_manager.read(|state| state.is_patching);
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&RunState) -> R,
    {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Update the state and emit change events
    ///
    /// Returns the events that were emitted.
    pub fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut RunState),
    {
        let changes = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let before = Watched::of(&state);
            update_fn(&mut state);
            Self::detect_changes(before, &state)
        };

        for change in &changes {
            // No subscribers is fine
            let _ = self.state_tx.send(change.clone());
        }

        changes
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn detect_changes(old: Watched, new: &RunState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if old.is_patching != new.is_patching {
            if new.is_patching {
                changes.push(StateChange::PatchStarted {
                    enabled_mods: new.enabled_mods,
                });
            } else {
                changes.push(StateChange::PatchFinished {
                    patched: new.last_run_patched.unwrap_or(false),
                });
            }
        }

        if old.current_step != new.current_step {
            if let Some(step) = new.current_step {
                changes.push(StateChange::StepChanged { step });
            }
        }

        if old.chapters != new.chapters && new.chapters > 0 {
            changes.push(StateChange::ChaptersDiscovered {
                count: new.chapters,
            });
        }

        if new.log.len() > old.log_len {
            for line in &new.log[old.log_len..] {
                changes.push(StateChange::LogLine { line: line.clone() });
            }
        }

        changes
    }

    /// Begin a patch run.
    ///
    /// Returns `false` without touching the state if a run is already active;
    /// only [`MAX_CONCURRENT_PATCH_RUNS`](crate::models::MAX_CONCURRENT_PATCH_RUNS)
    /// run may be in flight.
    pub fn start_patch(&self, enabled_mods: usize) -> bool {
        let mut started = false;
        // Check and set under one write lock.
        self.update(|state| {
            if state.is_patching {
                return;
            }
            state.reset_run();
            state.enabled_mods = enabled_mods;
            state.is_patching = true;
            started = true;
        });
        if !started {
            tracing::warn!("Refusing to start a patch run while another is active");
        }
        started
    }

    /// Finish the active run and record whether it patched the install.
    pub fn finish_patch(&self, patched: bool) -> Vec<StateChange> {
        self.update(|state| {
            state.last_run_patched = Some(patched);
            state.is_patching = false;
            state.current_step = None;
        })
    }

    pub fn set_step(&self, step: PatchStep) -> Vec<StateChange> {
        tracing::info!("{}", step);
        self.update(|state| state.current_step = Some(step))
    }

    /// Append a line to the run log and mirror it to tracing.
    pub fn log_line(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!("{}", line);
        self.update(|state| state.log.push(line));
    }

    pub fn set_chapters(&self, count: usize) -> Vec<StateChange> {
        self.update(|state| state.chapters = count)
    }

    /// Record whether the compiler produced an artifact for a chapter.
    pub fn record_chapter(&self, index: usize, produced: bool) -> Vec<StateChange> {
        let mut changes = self.update(|state| {
            if produced {
                state.chapters_produced.push(index);
            } else {
                state.chapters_missing.push(index);
            }
        });

        let event = StateChange::ChapterProcessed { index, produced };
        let _ = self.state_tx.send(event.clone());
        changes.push(event);
        changes
    }

    /// Announce the result of a restore scan.
    pub fn record_restored(&self, count: usize) {
        let _ = self
            .state_tx
            .send(StateChange::OriginalsRestored { count });
    }

    /// The step log of the current (or last) run.
    pub fn joined_log(&self) -> String {
        self.read(RunState::joined_log)
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_patch_emits_started() {
        let manager = StateManager::new();
        let mut rx = manager.subscribe();

        assert!(manager.start_patch(2));

        let event = rx.try_recv().unwrap();
        assert_eq!(event, StateChange::PatchStarted { enabled_mods: 2 });
        assert!(manager.read(|s| s.is_patching));
    }

    #[test]
    fn test_second_run_refused() {
        let manager = StateManager::new();
        assert!(manager.start_patch(1));
        assert!(!manager.start_patch(1));

        manager.finish_patch(false);
        assert!(manager.start_patch(1));
    }

    #[test]
    fn test_log_lines_become_events() {
        let manager = StateManager::new();
        let mut rx = manager.subscribe();

        manager.log_line("first");
        manager.log_line("second");

        assert_eq!(
            rx.try_recv().unwrap(),
            StateChange::LogLine {
                line: "first".to_string()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            StateChange::LogLine {
                line: "second".to_string()
            }
        );
        assert_eq!(manager.joined_log(), "first\nsecond");
    }

    #[test]
    fn test_start_clears_previous_log() {
        let manager = StateManager::new();
        manager.start_patch(1);
        manager.log_line("old run");
        manager.finish_patch(true);

        manager.start_patch(1);
        assert!(manager.joined_log().is_empty());
        assert_eq!(manager.read(|s| s.last_run_patched), Some(true));
    }

    #[test]
    fn test_reset_shrinking_log_emits_no_lines() {
        let manager = StateManager::new();
        manager.log_line("old");
        let mut rx = manager.subscribe();

        let changes = manager.update(|state| state.log.clear());

        assert!(changes.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_record_chapter() {
        let manager = StateManager::new();
        manager.record_chapter(0, true);
        manager.record_chapter(1, false);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.chapters_produced, vec![0]);
        assert_eq!(snapshot.chapters_missing, vec![1]);
    }
}
