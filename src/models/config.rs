use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default wall-clock cap for a single external tool invocation (15 minutes).
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 15 * 60;

/// Default per-stream stdout/stderr allowance for a tool invocation (24 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 24 * 1024 * 1024;

/// User configuration from DeltaForge Config.yaml
///
/// Contains installation paths, tool locations and the enabled mod set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(rename = "DeltaForge_Settings", default)]
    pub settings: ForgeSettings,
}

/// Which release of the game an installation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameEdition {
    Demo,
    Full,
}

impl GameEdition {
    /// Whether a mod flagged `demoMod` is compatible with this edition.
    pub fn accepts(&self, demo_mod: bool) -> bool {
        match self {
            GameEdition::Demo => demo_mod,
            GameEdition::Full => !demo_mod,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeSettings {
    #[serde(rename = "Game Path", default)]
    pub game_path: String,

    #[serde(rename = "Game Edition", default)]
    pub game_edition: Option<GameEdition>,

    #[serde(rename = "Game Executable", default)]
    pub game_executable: String,

    #[serde(rename = "Mod Database", default)]
    pub mod_database: String,

    #[serde(rename = "Enabled Mods", default)]
    pub enabled_mods: IndexSet<String>,

    #[serde(rename = "Compiler Path", default)]
    pub compiler_path: String,

    #[serde(rename = "Compiler Runtime", default = "default_runtime")]
    pub compiler_runtime: String,

    #[serde(rename = "Compiler Output", default)]
    pub compiler_output: String,

    #[serde(rename = "Post Processor Path", default)]
    pub post_processor_path: String,

    #[serde(rename = "Post Processor Runtime", default = "default_runtime")]
    pub post_processor_runtime: String,

    #[serde(rename = "Scripts Dir", default)]
    pub scripts_dir: String,

    #[serde(rename = "Tool Timeout", default = "default_tool_timeout")]
    pub tool_timeout: u64,

    #[serde(rename = "Max Output Bytes", default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(rename = "Debug Mode", default)]
    pub debug_mode: bool,

    #[serde(rename = "Capture Game Console", default)]
    pub capture_game_console: bool,
}

impl Default for ForgeSettings {
    fn default() -> Self {
        Self {
            game_path: String::new(),
            game_edition: None,
            game_executable: String::new(),
            mod_database: String::new(),
            enabled_mods: IndexSet::new(),
            compiler_path: String::new(),
            compiler_runtime: default_runtime(),
            compiler_output: String::new(),
            post_processor_path: String::new(),
            post_processor_runtime: default_runtime(),
            scripts_dir: String::new(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            debug_mode: false,
            capture_game_console: false,
        }
    }
}

fn default_runtime() -> String {
    if cfg!(target_os = "windows") {
        String::new()
    } else {
        "/usr/bin/dotnet".to_string()
    }
}

fn default_tool_timeout() -> u64 {
    DEFAULT_TOOL_TIMEOUT_SECS
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn non_empty(value: &str) -> Option<Utf8PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(Utf8PathBuf::from(trimmed))
    }
}

impl ForgeSettings {
    /// The registered installation root, if one has been imported.
    pub fn game_path(&self) -> Option<Utf8PathBuf> {
        non_empty(&self.game_path)
    }

    pub fn game_executable(&self) -> Option<Utf8PathBuf> {
        non_empty(&self.game_executable)
    }

    /// Mod database directory; defaults to `pkg.db` inside the config directory.
    pub fn mod_database(&self, config_dir: &Utf8Path) -> Utf8PathBuf {
        non_empty(&self.mod_database).unwrap_or_else(|| config_dir.join("pkg.db"))
    }

    /// Add a unique id to the enabled set. Returns false if it was already enabled.
    pub fn enable_mod(&mut self, unique_id: &str) -> bool {
        self.enabled_mods.insert(unique_id.to_string())
    }

    /// Remove a unique id from the enabled set, keeping the order of the rest.
    pub fn disable_mod(&mut self, unique_id: &str) -> bool {
        self.enabled_mods.shift_remove(unique_id)
    }

    /// Resolve tool locations, filling in the bundled layout for unset entries.
    ///
    /// The bundled layout is `gm3p/GM3P.{exe,dll}` with the post-processor in
    /// `gm3p/UTMTCLI/` next to it.
    pub fn tool_paths(&self, base_dir: &Utf8Path) -> ToolPaths {
        let dll = !cfg!(target_os = "windows");
        let compiler = non_empty(&self.compiler_path).unwrap_or_else(|| {
            base_dir
                .join("gm3p")
                .join(if dll { "GM3P.dll" } else { "GM3P.exe" })
        });
        let compiler_dir = compiler
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| base_dir.to_path_buf());

        let output_dir =
            non_empty(&self.compiler_output).unwrap_or_else(|| compiler_dir.join("output"));

        let post_processor = non_empty(&self.post_processor_path).unwrap_or_else(|| {
            compiler_dir.join("UTMTCLI").join(if dll {
                "UndertaleModCli.dll"
            } else {
                "UndertaleModCli.exe"
            })
        });

        let scripts_dir = non_empty(&self.scripts_dir).unwrap_or_else(|| {
            post_processor
                .parent()
                .map(|dir| dir.join("Scripts"))
                .unwrap_or_else(|| Utf8PathBuf::from("Scripts"))
        });

        ToolPaths {
            compiler,
            compiler_runtime: non_empty(&self.compiler_runtime),
            output_dir,
            post_processor,
            post_processor_runtime: non_empty(&self.post_processor_runtime),
            scripts_dir,
        }
    }

    pub fn run_limits(&self) -> RunLimits {
        RunLimits {
            timeout: Duration::from_secs(self.tool_timeout.max(1)),
            max_output_bytes: self.max_output_bytes,
        }
    }
}

/// Locations of the external patch compiler and its post-processing tool.
///
/// When a runtime is set, the tool is launched as `<runtime> <tool> args...`
/// (e.g. `dotnet GM3P.dll`), otherwise the tool itself is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub compiler: Utf8PathBuf,
    pub compiler_runtime: Option<Utf8PathBuf>,
    /// The compiler's working output tree (`xDeltaCombiner/`, `Cache/`, `result/`).
    pub output_dir: Utf8PathBuf,
    pub post_processor: Utf8PathBuf,
    pub post_processor_runtime: Option<Utf8PathBuf>,
    pub scripts_dir: Utf8PathBuf,
}

/// Hard bounds applied to every subprocess invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forge_settings_defaults() {
        let settings = ForgeSettings::default();
        assert_eq!(settings.tool_timeout, 900);
        assert_eq!(settings.max_output_bytes, 24 * 1024 * 1024);
        assert!(settings.enabled_mods.is_empty());
        assert!(settings.game_path().is_none());
    }

    #[test]
    fn test_enable_disable_keeps_order() {
        let mut settings = ForgeSettings::default();
        assert!(settings.enable_mod("b"));
        assert!(settings.enable_mod("a"));
        assert!(settings.enable_mod("c"));
        assert!(!settings.enable_mod("a"));

        assert!(settings.disable_mod("a"));
        let order: Vec<&str> = settings.enabled_mods.iter().map(String::as_str).collect();
        assert_eq!(order, vec!["b", "c"]);
    }

    #[test]
    fn test_tool_paths_bundled_layout() {
        let settings = ForgeSettings {
            compiler_path: "/opt/gm3p/GM3P.dll".to_string(),
            ..ForgeSettings::default()
        };
        let paths = settings.tool_paths(Utf8Path::new("/app"));

        assert_eq!(paths.output_dir, Utf8PathBuf::from("/opt/gm3p/output"));
        assert!(paths.post_processor.starts_with("/opt/gm3p/UTMTCLI"));
        assert_eq!(
            paths.scripts_dir,
            Utf8PathBuf::from("/opt/gm3p/UTMTCLI/Scripts")
        );
    }

    #[test]
    fn test_edition_accepts() {
        assert!(GameEdition::Demo.accepts(true));
        assert!(!GameEdition::Demo.accepts(false));
        assert!(GameEdition::Full.accepts(false));
        assert!(!GameEdition::Full.accepts(true));
    }

    #[test]
    fn test_run_limits_never_zero() {
        let settings = ForgeSettings {
            tool_timeout: 0,
            ..ForgeSettings::default()
        };
        assert_eq!(settings.run_limits().timeout, Duration::from_secs(1));
    }
}
