//! DeltaForge - crash-safe mod patching for GameMaker data.win installations
//!
//! Main entry point for the command-line application.
//!
//! # Overview
//!
//! The binary wires the library together:
//! - Logging infrastructure (daily rolling file + optional console output)
//! - Tokio runtime for subprocess execution
//! - Configuration loading ([`ConfigManager`])
//! - One [`PatchContext`] per process, built from the saved settings
//!
//! # Execution Flow
//!
//! 1. Load `DeltaForge Config.yaml` from the config directory
//! 2. Initialize logging under `<config dir>/logs`
//! 3. Restore any `.original` backups left in the configured installation,
//!    unless another process is playing a patched session of it
//! 4. Run the requested command
//!
//! # Commands
//!
//! - `install <path>`: register an installation and detect its edition
//! - `mods [--all]`: list mods, filtered to the installation's edition
//! - `import <archive>` / `remove <folder>`: manage the mod database
//! - `enable <id>` / `disable <id>`: change the enabled set
//! - `patch`: apply the enabled mods
//! - `run`: patch, play, then restore the originals
//! - `restore`: restore every backed-up file now

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use deltaforge::config::DEFAULT_CONFIG_DIR;
use deltaforge::services::game::{
    SESSION_MARKER, SessionMarker, session_active, validate_install,
};
use deltaforge::services::{
    detect_edition, discover_mods, import_mod_archive, launch_and_restore, locate_executable,
    remove_mod, restore_originals_if_any,
};
use deltaforge::{APP_NAME, ConfigManager, PatchContext, UserConfig, VERSION, start_patch};

#[derive(Parser, Debug)]
#[command(name = "deltaforge", version, about = "Patch a DELTARUNE installation with mods")]
struct Cli {
    /// Directory holding the config file, logs and default mod database
    #[arg(long, global = true, env = "DELTAFORGE_CONFIG_DIR", default_value = DEFAULT_CONFIG_DIR)]
    config_dir: Utf8PathBuf,

    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    /// Also log to the console
    #[arg(long, global = true)]
    console: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a game installation
    Install { path: Utf8PathBuf },
    /// List mods in the mod database
    Mods {
        /// Include mods made for the other edition
        #[arg(long)]
        all: bool,
    },
    /// Import a mod archive into the mod database
    Import { archive: Utf8PathBuf },
    /// Delete a mod folder from the mod database
    Remove { folder: String },
    /// Enable a mod by unique id or folder name
    Enable { id: String },
    /// Disable a mod by unique id or folder name
    Disable { id: String },
    /// Apply the enabled mods to the installation
    Patch,
    /// Patch, launch the game, and restore the originals when it exits
    Run,
    /// Restore every backed-up file in the installation
    Restore,
}

struct App {
    config: ConfigManager,
    user: UserConfig,
}

impl App {
    fn mod_database(&self) -> Utf8PathBuf {
        self.user.settings.mod_database(self.config.config_dir())
    }

    fn install_root(&self) -> Result<Utf8PathBuf> {
        self.user
            .settings
            .game_path()
            .context("No installation registered; run `deltaforge install <path>` first")
    }

    fn save(&self) -> Result<()> {
        self.config.save_user_config(&self.user)
    }

    /// Accept either a unique id or a mod folder name.
    fn resolve_unique_id(&self, id: &str) -> Option<String> {
        let report = discover_mods(&self.mod_database());
        report
            .find(id)
            .or_else(|| report.find_folder(id))
            .map(|m| m.unique_id.clone())
    }
}

/// Where the bundled tool layout is looked up: the executable's directory.
fn base_dir() -> Utf8PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .and_then(|dir| Utf8PathBuf::try_from(dir).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("."))
}

fn cmd_install(app: &mut App, path: &Utf8Path) -> Result<()> {
    let root = path
        .canonicalize_utf8()
        .with_context(|| format!("Installation not found: {}", path))?;
    let missing = validate_install(&root);
    if !missing.is_empty() {
        bail!("{} is not a game installation (missing: {})", root, missing.join(", "));
    }

    let edition = detect_edition(&root);
    let settings = &mut app.user.settings;
    settings.game_path = root.to_string();
    settings.game_edition = Some(edition);
    settings.enabled_mods.clear();
    app.save()?;

    println!("Registered {} ({:?})", root, edition);
    Ok(())
}

fn cmd_mods(app: &App, all: bool) -> Result<()> {
    let report = discover_mods(&app.mod_database());
    let mods = match (all, app.user.settings.game_edition) {
        (false, Some(edition)) => report.for_edition(edition),
        _ => report.mod_list.iter().collect(),
    };

    for m in mods {
        let mark = if app.user.settings.enabled_mods.contains(&m.unique_id) {
            "x"
        } else {
            " "
        };
        println!(
            "[{}] {} {} by {} ({})",
            mark,
            m.display_name(),
            m.metadata.version,
            m.metadata.author,
            m.unique_id
        );
    }
    for failure in &report.errors {
        println!("[!] {}: {}", failure.folder, failure.reason);
    }
    Ok(())
}

fn cmd_remove(app: &mut App, folder: &str) -> Result<()> {
    let db = app.mod_database();
    let unique_id = discover_mods(&db)
        .find_folder(folder)
        .map(|m| m.unique_id.clone());

    remove_mod(&db, folder)?;
    if let Some(id) = unique_id {
        if app.user.settings.disable_mod(&id) {
            app.save()?;
        }
    }
    println!("Removed {}", folder);
    Ok(())
}

fn cmd_toggle(app: &mut App, id: &str, enable: bool) -> Result<()> {
    let unique_id = match app.resolve_unique_id(id) {
        Some(unique_id) => unique_id,
        None if !enable => id.to_string(),
        None => bail!("No mod with id or folder {:?} in {}", id, app.mod_database()),
    };

    let changed = if enable {
        app.user.settings.enable_mod(&unique_id)
    } else {
        app.user.settings.disable_mod(&unique_id)
    };
    if changed {
        app.save()?;
    }
    println!("{} {}", if enable { "Enabled" } else { "Disabled" }, unique_id);
    Ok(())
}

/// Refuse to touch an installation another process is playing.
fn ensure_no_session(root: &Utf8Path) -> Result<()> {
    if session_active(root) {
        bail!(
            "A patched game session is running for {} (remove {} if it is not)",
            root,
            root.join(SESSION_MARKER)
        );
    }
    Ok(())
}

async fn cmd_patch(app: &App, ctx: &PatchContext) -> Result<Utf8PathBuf> {
    let root = app.install_root()?;
    ensure_no_session(&root)?;
    let outcome = start_patch(
        ctx,
        &root,
        &app.mod_database(),
        &app.user.settings.enabled_mods,
    )
    .await;

    println!("{}", outcome.log);
    for chapter in &outcome.missing_chapters {
        println!("No compiler output for {}", chapter);
    }
    match outcome.error {
        Some(e) => Err(e.into()),
        None => Ok(root),
    }
}

async fn cmd_run(app: &App, ctx: &PatchContext) -> Result<()> {
    let install_root = app.install_root()?;
    ensure_no_session(&install_root)?;
    // Held until the originals are back.
    let _session = SessionMarker::create(&install_root)?;

    let root = match cmd_patch(app, ctx).await {
        Ok(root) => root,
        Err(e) => {
            if let Ok(root) = app.install_root() {
                restore_originals_if_any(&root);
            }
            return Err(e);
        }
    };

    let configured = app.user.settings.game_executable();
    let exe = match locate_executable(&root, configured.as_deref()) {
        Ok(exe) => exe,
        Err(e) => {
            restore_originals_if_any(&root);
            return Err(e);
        }
    };

    let session =
        launch_and_restore(&root, &exe, app.user.settings.capture_game_console).await?;
    println!(
        "Game exited ({}); restored {} file(s)",
        session
            .exit_code
            .map_or_else(|| "signal".to_string(), |code| code.to_string()),
        session.restored.len()
    );
    if let Some(console) = session.console {
        println!("{}", console);
    }
    Ok(())
}

fn cmd_restore(app: &App) -> Result<()> {
    let root = app.install_root()?;
    ensure_no_session(&root)?;
    let restored = restore_originals_if_any(&root);
    if restored.is_empty() {
        println!("Nothing to restore");
    }
    for path in restored {
        println!("Restored {}", path);
    }
    Ok(())
}

async fn dispatch(app: &mut App, command: Command) -> Result<()> {
    match command {
        Command::Install { path } => cmd_install(app, &path),
        Command::Mods { all } => cmd_mods(app, all),
        Command::Import { archive } => {
            let dest = import_mod_archive(&archive, &app.mod_database())?;
            println!("Imported into {}", dest);
            Ok(())
        }
        Command::Remove { folder } => cmd_remove(app, &folder),
        Command::Enable { id } => cmd_toggle(app, &id, true),
        Command::Disable { id } => cmd_toggle(app, &id, false),
        Command::Patch => {
            let ctx = PatchContext::from_settings(&app.user.settings, &base_dir());
            cmd_patch(app, &ctx).await.map(|_| ())
        }
        Command::Run => {
            let ctx = PatchContext::from_settings(&app.user.settings, &base_dir());
            cmd_run(app, &ctx).await
        }
        Command::Restore => cmd_restore(app),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigManager::new(&cli.config_dir)?;
    let user = config.load_user_config()?;

    let _guard = deltaforge::logging::setup_logging(
        &config.log_dir(),
        deltaforge::logging::LOG_PREFIX,
        cli.debug || user.settings.debug_mode,
        cli.console,
    )?;
    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let mut app = App { config, user };

    // A crashed run or game session can leave patched files behind.
    if !matches!(cli.command, Command::Restore) {
        if let Some(root) = app.user.settings.game_path() {
            if session_active(&root) {
                tracing::info!(
                    "Game session in progress for {}; skipping startup restore",
                    root
                );
            } else {
                let restored = restore_originals_if_any(&root);
                if !restored.is_empty() {
                    tracing::warn!("Restored {} leftover original(s) at startup", restored.len());
                }
            }
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("deltaforge-worker")
        .build()?;

    let result = runtime.block_on(dispatch(&mut app, cli.command));
    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}
