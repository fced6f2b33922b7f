use camino::Utf8PathBuf;

/// Binary-diff patch that the external compiler merges into a chapter asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XdeltaAction {
    pub patch: Utf8PathBuf,
    /// Target exactly as written in the manifest; resolved against chapters later.
    pub declared_target: String,
    pub mod_name: String,
}

/// Whole-file replacement copied straight into the installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideAction {
    pub source: Utf8PathBuf,
    pub destination: Utf8PathBuf,
    pub mod_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Xdelta(XdeltaAction),
    Override(OverrideAction),
}

impl Action {
    pub fn mod_name(&self) -> &str {
        match self {
            Action::Xdelta(action) => &action.mod_name,
            Action::Override(action) => &action.mod_name,
        }
    }
}

/// Split a flat action list into (xdelta, override) lists, keeping relative order.
pub fn partition_actions(actions: Vec<Action>) -> (Vec<XdeltaAction>, Vec<OverrideAction>) {
    let mut xdeltas = Vec::new();
    let mut overrides = Vec::new();
    for action in actions {
        match action {
            Action::Xdelta(x) => xdeltas.push(x),
            Action::Override(o) => overrides.push(o),
        }
    }
    (xdeltas, overrides)
}

/// Two or more mods writing the same override destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub destination: Utf8PathBuf,
    pub mods: Vec<String>,
}
