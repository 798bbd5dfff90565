use std::path::PathBuf;

/// Commands a Node project session cannot run without.
pub const DEFAULT_REQUIRED_COMMANDS: &[&str] = &["node", "npm"];

#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Base directory for sandbox workspaces (`<base_dir>/workspaces/<id>`).
    pub base_dir: PathBuf,
    /// Commands that must be on `PATH` before a sandbox can boot.
    pub required_commands: Vec<String>,
    /// Keep the workspace directory on teardown instead of deleting it.
    pub keep_workspaces: bool,
}

impl LocalConfig {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            required_commands: DEFAULT_REQUIRED_COMMANDS
                .iter()
                .map(|c| (*c).to_owned())
                .collect(),
            keep_workspaces: false,
        }
    }
}
