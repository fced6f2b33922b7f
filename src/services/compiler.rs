use super::chapters::{ChapterPlan, PRIMARY_ASSET};
use super::fs_utils::{best_effort, copy_over, remove_path};
use crate::metrics::Metrics;
use crate::models::{RunLimits, ToolPaths};
use crate::state::StateManager;
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use std::fs;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;

/// Name of the packaged result folder requested from the compiler.
pub const PACK_NAME: &str = "DeltamodPack_Multi";

/// Group label passed to `massPatch`.
pub const GROUP_LABEL: &str = "GM";

/// Chapter count the compiler's merge layout was built around.
///
/// The merge loops here follow the discovered chapter count instead; exceeding
/// this only produces a warning.
pub const ASSUMED_MAX_CHAPTERS: usize = 5;

/// Bookkeeping slots the compiler keeps per chapter beyond one per mod.
pub const EXTRA_MERGE_SLOTS: usize = 2;

/// Merge step that holds the combined result and is never exported.
pub const SKIPPED_MERGE_STEP: usize = 1;

/// Slot holding the finished artifact when only one mod touches each chapter.
pub const SINGLE_MOD_OUTPUT_STEP: usize = 2;

/// Post-processor scripts run on every intermediate artifact before `compare`.
pub const EXPORT_SCRIPTS: &[&str] = &[
    "ExportAllTexturesGrouped.csx",
    "ExportAllCode.csx",
    "ExportAssetOrder.csx",
];

/// Post-processor scripts run on each merged artifact after `compare`.
pub const IMPORT_SCRIPTS: &[&str] = &["ImportGraphics.csx", "ImportGML.csx", "ImportAssetOrder.csx"];

/// Characters of tool output kept in logs.
const LOG_OUTPUT_CHARS: usize = 10_000;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Failure of an external tool invocation.
///
/// Every variant aborts the patch run and triggers a rollback.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with code {code}: {output}")]
    Failed {
        program: String,
        code: i32,
        output: String,
    },

    #[error("{program} wrote more than {limit} bytes to an output stream")]
    OutputTooLarge { program: String, limit: usize },

    #[error("Failed to copy compiler output: {0:#}")]
    CopyBack(anyhow::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ToolError::Io {
            context: context.into(),
            source,
        }
    }
}

/// A fully resolved command line: no shell is involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: Utf8PathBuf,
    pub args: Vec<String>,
    pub working_dir: Utf8PathBuf,
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured output of a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Which chapters received compiler output during copy-back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileReport {
    pub mod_amount: usize,
    pub replaced: Vec<usize>,
    pub missing: Vec<usize>,
}

/// Cut `text` to `max_chars`, marking the cut.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}... [truncated]", &text[..cut]),
        None => text.to_string(),
    }
}

/// Encode per-chapter patch lists for `massPatch`.
///
/// A populated slot is `,,` followed by its comma-separated patch paths; an
/// empty slot is the empty string; slots are joined with `::`.
pub fn build_chapter_argument(patches: &[Vec<Utf8PathBuf>]) -> String {
    patches
        .iter()
        .map(|list| {
            if list.is_empty() {
                String::new()
            } else {
                let joined: Vec<&str> = list.iter().map(|p| p.as_str()).collect();
                format!(",,{}", joined.join(","))
            }
        })
        .collect::<Vec<_>>()
        .join("::")
}

struct Captured {
    bytes: Vec<u8>,
    overflowed: bool,
}

async fn read_capped<R>(reader: Option<R>, limit: usize) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    if let Some(reader) = reader {
        let mut limited = reader.take(limit as u64 + 1);
        limited.read_to_end(&mut bytes).await?;
    }
    let overflowed = bytes.len() > limit;
    bytes.truncate(limit);
    Ok(Captured { bytes, overflowed })
}

enum Collected {
    Exited {
        status: ExitStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    Overflow,
}

/// Drives the external patch compiler and its post-processor.
///
/// Both tools keep working state under [`ToolPaths::output_dir`], so only one
/// `PatchCompiler` may be running at a time.
pub struct PatchCompiler {
    tools: ToolPaths,
    limits: RunLimits,
    metrics: Arc<Metrics>,
}

impl PatchCompiler {
    pub fn new(tools: ToolPaths, limits: RunLimits, metrics: Arc<Metrics>) -> Self {
        Self {
            tools,
            limits,
            metrics,
        }
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    /// The first required compiler file that does not exist, if any.
    ///
    /// A runtime given as a bare command name is looked up on `PATH` at spawn
    /// time and is not checked here.
    pub fn missing_tool(&self) -> Option<Utf8PathBuf> {
        if !self.tools.compiler.is_file() {
            return Some(self.tools.compiler.clone());
        }
        match &self.tools.compiler_runtime {
            Some(runtime) if runtime.components().count() > 1 && !runtime.is_file() => {
                Some(runtime.clone())
            }
            _ => None,
        }
    }

    fn working_dir(&self) -> Utf8PathBuf {
        self.tools
            .compiler
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("."))
    }

    fn invocation(
        &self,
        runtime: Option<&Utf8PathBuf>,
        tool: &Utf8Path,
        args: Vec<String>,
    ) -> ToolInvocation {
        let (program, args) = match runtime {
            Some(runtime) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(tool.to_string());
                full.extend(args);
                (runtime.clone(), full)
            }
            None => (tool.to_path_buf(), args),
        };
        ToolInvocation {
            program,
            args,
            working_dir: self.working_dir(),
        }
    }

    fn compiler_command(&self, args: Vec<String>) -> ToolInvocation {
        self.invocation(
            self.tools.compiler_runtime.as_ref(),
            &self.tools.compiler,
            args,
        )
    }

    pub fn clear_command(&self) -> ToolInvocation {
        self.compiler_command(vec!["clear".to_string()])
    }

    pub fn mass_patch_command(
        &self,
        install_root: &Utf8Path,
        mod_amount: usize,
        chapter_argument: &str,
    ) -> ToolInvocation {
        self.compiler_command(vec![
            "massPatch".to_string(),
            install_root.to_string(),
            GROUP_LABEL.to_string(),
            mod_amount.to_string(),
            chapter_argument.to_string(),
        ])
    }

    pub fn compare_command(&self, mod_amount: usize) -> ToolInvocation {
        self.compiler_command(vec![
            "compare".to_string(),
            mod_amount.to_string(),
            "false".to_string(),
            "false".to_string(),
        ])
    }

    /// `result <pack> <merged>`; `merged` is true when the compare pass ran.
    pub fn result_command(&self, merged: bool) -> ToolInvocation {
        self.compiler_command(vec![
            "result".to_string(),
            PACK_NAME.to_string(),
            merged.to_string(),
        ])
    }

    /// `load <artifact> --verbose --output <artifact> --scripts <s>...`
    pub fn post_process_command(&self, artifact: &Utf8Path, scripts: &[&str]) -> ToolInvocation {
        let mut args = vec![
            "load".to_string(),
            artifact.to_string(),
            "--verbose".to_string(),
            "--output".to_string(),
            artifact.to_string(),
        ];
        for script in scripts {
            args.push("--scripts".to_string());
            args.push(self.tools.scripts_dir.join(script).to_string());
        }
        self.invocation(
            self.tools.post_processor_runtime.as_ref(),
            &self.tools.post_processor,
            args,
        )
    }

    pub fn merge_step_dir(&self, chapter: usize, step: usize) -> Utf8PathBuf {
        self.tools
            .output_dir
            .join("xDeltaCombiner")
            .join(chapter.to_string())
            .join(step.to_string())
    }

    pub fn merge_artifact(&self, chapter: usize, step: usize) -> Utf8PathBuf {
        self.merge_step_dir(chapter, step).join(PRIMARY_ASSET)
    }

    pub fn result_dir(&self) -> Utf8PathBuf {
        self.tools.output_dir.join("result").join(PACK_NAME)
    }

    fn running_dir(&self) -> Utf8PathBuf {
        self.tools.output_dir.join("Cache").join("running")
    }

    /// Where the finished artifact for `chapter` is expected after `result`.
    pub fn produced_artifact(&self, chapter: usize, mod_amount: usize) -> Utf8PathBuf {
        if mod_amount > 1 {
            self.result_dir()
                .join(chapter.to_string())
                .join(PRIMARY_ASSET)
        } else {
            self.merge_artifact(chapter, SINGLE_MOD_OUTPUT_STEP)
        }
    }

    /// Write the chapter/step files the compiler reads between invocations.
    pub fn write_running_state(&self, chapter: usize, step: Option<usize>) -> Result<(), ToolError> {
        let dir = self.running_dir();
        fs::create_dir_all(&dir)
            .map_err(|e| ToolError::io(format!("Failed to create {}", dir), e))?;

        let chapter_file = dir.join("chapterNumber.txt");
        fs::write(&chapter_file, chapter.to_string())
            .map_err(|e| ToolError::io(format!("Failed to write {}", chapter_file), e))?;

        if let Some(step) = step {
            let step_file = dir.join("modNumbersCache.txt");
            fs::write(&step_file, step.to_string())
                .map_err(|e| ToolError::io(format!("Failed to write {}", step_file), e))?;
        }
        Ok(())
    }

    /// Run one invocation to completion under the configured limits.
    ///
    /// A non-zero exit, a timeout, or either output stream exceeding
    /// `max_output_bytes` is an error. A timed-out child is killed.
    pub async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        tracing::info!("RUN: {}", invocation);
        let program = invocation.program.to_string();
        let start = Instant::now();

        let mut cmd = Command::new(invocation.program.as_std_path());
        cmd.args(&invocation.args)
            .current_dir(invocation.working_dir.as_std_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.metrics.record_tool_run(start.elapsed(), false);
                return Err(ToolError::Spawn { program, source });
            }
        };

        let limit = self.limits.max_output_bytes;
        let collect = async move {
            let stdout = read_capped(child.stdout.take(), limit);
            let stderr = read_capped(child.stderr.take(), limit);
            tokio::pin!(stdout, stderr);

            let (mut out, mut err) = (None, None);
            while out.is_none() || err.is_none() {
                tokio::select! {
                    captured = &mut stdout, if out.is_none() => {
                        let captured = captured?;
                        if captured.overflowed {
                            return Ok(Collected::Overflow);
                        }
                        out = Some(captured.bytes);
                    }
                    captured = &mut stderr, if err.is_none() => {
                        let captured = captured?;
                        if captured.overflowed {
                            return Ok(Collected::Overflow);
                        }
                        err = Some(captured.bytes);
                    }
                }
            }

            let status = child.wait().await?;
            Ok::<_, std::io::Error>(Collected::Exited {
                status,
                stdout: out.unwrap_or_default(),
                stderr: err.unwrap_or_default(),
            })
        };

        let result = match timeout(self.limits.timeout, collect).await {
            Err(_) => {
                tracing::warn!("{} timed out after {:?}", program, self.limits.timeout);
                Err(ToolError::Timeout {
                    program,
                    timeout: self.limits.timeout,
                })
            }
            Ok(Err(e)) => Err(ToolError::io(format!("Failed to wait for {}", program), e)),
            Ok(Ok(Collected::Overflow)) => Err(ToolError::OutputTooLarge { program, limit }),
            Ok(Ok(Collected::Exited {
                status,
                stdout,
                stderr,
            })) => {
                let stdout = String::from_utf8_lossy(&stdout).into_owned();
                let stderr = String::from_utf8_lossy(&stderr).into_owned();
                if !stdout.is_empty() {
                    tracing::debug!("stdout: {}", truncate_output(&stdout, LOG_OUTPUT_CHARS));
                }
                if !stderr.is_empty() {
                    tracing::debug!("stderr: {}", truncate_output(&stderr, LOG_OUTPUT_CHARS));
                }

                if status.success() {
                    Ok(ToolOutput { stdout, stderr })
                } else {
                    let combined = format!("{}{}", stderr, stdout);
                    let output = if combined.trim().is_empty() {
                        status.to_string()
                    } else {
                        truncate_output(combined.trim(), LOG_OUTPUT_CHARS)
                    };
                    Err(ToolError::Failed {
                        program,
                        code: status.code().unwrap_or(-1),
                        output,
                    })
                }
            }
        };

        let elapsed = start.elapsed();
        self.metrics.record_tool_run(elapsed, result.is_ok());
        tracing::info!(
            "Tool finished in {:.2}s ({})",
            elapsed.as_secs_f32(),
            if result.is_ok() { "ok" } else { "failed" }
        );
        result
    }

    /// Export pass over every intermediate slot, one `compare`, then an import
    /// pass over each chapter's merged slot.
    async fn merge_chapters(&self, chapters: usize, mod_amount: usize) -> Result<(), ToolError> {
        if chapters > ASSUMED_MAX_CHAPTERS {
            tracing::warn!(
                "{} chapters discovered; the compiler layout assumes at most {}",
                chapters,
                ASSUMED_MAX_CHAPTERS
            );
        }

        for chapter in 0..chapters {
            for step in 0..mod_amount + EXTRA_MERGE_SLOTS {
                let code_dir = self.merge_step_dir(chapter, step).join("Objects").join("CodeEntries");
                fs::create_dir_all(&code_dir)
                    .map_err(|e| ToolError::io(format!("Failed to create {}", code_dir), e))?;
                self.write_running_state(chapter, Some(step))?;

                if step != SKIPPED_MERGE_STEP {
                    let artifact = self.merge_artifact(chapter, step);
                    self.run(&self.post_process_command(&artifact, EXPORT_SCRIPTS))
                        .await?;
                }
            }
        }

        self.run(&self.compare_command(mod_amount)).await?;

        for chapter in 0..chapters {
            self.write_running_state(chapter, None)?;
            let artifact = self.merge_artifact(chapter, SKIPPED_MERGE_STEP);
            self.run(&self.post_process_command(&artifact, IMPORT_SCRIPTS))
                .await?;
        }
        Ok(())
    }

    /// Replace each patched chapter with the compiler's output.
    ///
    /// Chapters without patches are left alone. A missing artifact is logged
    /// and leaves that chapter untouched.
    fn copy_back(
        &self,
        plan: &ChapterPlan,
        mod_amount: usize,
        state: &StateManager,
    ) -> Result<CompileReport, ToolError> {
        let mut report = CompileReport {
            mod_amount,
            ..CompileReport::default()
        };

        for (index, target) in plan.chapters.paths().iter().enumerate() {
            if plan.patches[index].is_empty() {
                continue;
            }

            let produced = self.produced_artifact(index, mod_amount);
            if produced.is_file() {
                tracing::info!("Produced[{}]: {} (exists)", index, produced);
                best_effort("remove chapter before copy-back", || remove_path(target));
                copy_over(&produced, target).map_err(ToolError::CopyBack)?;
                self.metrics.record_chapter_replaced();
                state.record_chapter(index, true);
                report.replaced.push(index);
            } else {
                state.log_line(format!(
                    "Compiler did not produce chapter {} ({})",
                    index, produced
                ));
                state.record_chapter(index, false);
                report.missing.push(index);
            }
        }
        Ok(report)
    }

    /// Run the whole compiler protocol for `plan` and copy the results back.
    ///
    /// The caller is responsible for backups before and rollback after a failure.
    pub async fn compile(
        &self,
        install_root: &Utf8Path,
        plan: &ChapterPlan,
        state: &StateManager,
    ) -> Result<CompileReport, ToolError> {
        let mod_amount = plan.mod_amount();
        let chapter_argument = build_chapter_argument(&plan.patches);

        tracing::info!(
            "massPatch {} chapters: {} modAmount: {}",
            install_root,
            plan.chapters.len(),
            mod_amount
        );
        for (index, patches) in plan.patches.iter().enumerate() {
            tracing::info!("  chapter[{}] patches: {}", index, patches.len());
        }

        self.run(&self.clear_command()).await?;
        self.run(&self.mass_patch_command(install_root, mod_amount, &chapter_argument))
            .await?;

        let merged = mod_amount > 1;
        if merged {
            self.merge_chapters(plan.chapters.len(), mod_amount).await?;
        }

        let result_dir = self.result_dir();
        best_effort("clear previous result", || remove_path(&result_dir));
        self.run(&self.result_command(merged)).await?;

        let report = self.copy_back(plan, mod_amount, state)?;
        best_effort("remove result folder", || remove_path(&result_dir));
        Ok(report)
    }
}
