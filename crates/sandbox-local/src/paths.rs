use std::path::{Path, PathBuf};

use sandbox::SandboxError;

/// Runtime-level paths derived from the base directory.
pub struct RuntimePaths {
    base_dir: PathBuf,
}

impl RuntimePaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn workspaces(&self) -> PathBuf {
        self.base_dir.join("workspaces")
    }

    /// Workspace directory: `<base_dir>/workspaces/<id>/`.
    pub fn workspace(&self, id: &str) -> PathBuf {
        self.workspaces().join(id)
    }
}

/// Per-sandbox workspace root. Every sandbox path resolves below it.
pub struct SandboxPaths {
    workspace: PathBuf,
}

impl SandboxPaths {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Map a `/`-separated sandbox path to a host path inside the workspace.
    ///
    /// Absolute paths, empty segments and `.`/`..` are rejected so a path can
    /// never escape the workspace.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        if path.is_empty() {
            return Err(SandboxError::fs(path, "empty path"));
        }
        let mut resolved = self.workspace.clone();
        for segment in path.split('/') {
            match segment {
                "" => return Err(SandboxError::fs(path, "empty path segment")),
                "." | ".." => {
                    return Err(SandboxError::fs(path, "relative segments not allowed"));
                }
                _ => resolved.push(segment),
            }
        }
        Ok(resolved)
    }
}
