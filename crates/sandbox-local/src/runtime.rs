use std::sync::Arc;

use async_trait::async_trait;
use sandbox::{SandboxConfig, SandboxError, SandboxInstance, SandboxRuntime};
use tracing::{info, warn};

use crate::config::LocalConfig;
use crate::paths::{RuntimePaths, SandboxPaths};
use crate::sandbox::LocalSandbox;

pub struct LocalRuntime {
    config: LocalConfig,
    paths: RuntimePaths,
}

impl LocalRuntime {
    /// Create a runtime without touching the filesystem.
    /// Prerequisites are checked by `check_environment()`.
    pub fn new(config: LocalConfig) -> Self {
        let paths = RuntimePaths::new(config.base_dir.clone());
        Self { config, paths }
    }
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    fn name(&self) -> &str {
        "local"
    }

    fn check_environment(&self) -> sandbox::Result<()> {
        crate::prerequisites::check_prerequisites(&self.config)
    }

    async fn boot(&self, config: SandboxConfig) -> sandbox::Result<Arc<dyn SandboxInstance>> {
        let id = config.id.to_string();
        let paths = SandboxPaths::new(self.paths.workspace(&id));

        // Clean a stale workspace left by a previous crashed session.
        if paths.workspace().exists()
            && let Err(e) = tokio::fs::remove_dir_all(paths.workspace()).await
        {
            warn!(id = %id, error = %e, "failed to clean stale workspace");
        }

        tokio::fs::create_dir_all(paths.workspace())
            .await
            .map_err(|e| SandboxError::BootFailed(format!("mkdir workspace: {e}")))?;

        info!(id = %id, workspace = %paths.workspace().display(), "sandbox booted");

        Ok(Arc::new(LocalSandbox::new(
            id,
            paths,
            config.env,
            self.config.keep_workspaces,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boot_creates_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new(LocalConfig::new(dir.path().to_path_buf()));

        let config = SandboxConfig::new();
        let expected = dir.path().join("workspaces").join(config.id.to_string());
        let instance = runtime.boot(config).await.unwrap();

        assert!(expected.is_dir());
        instance.write_file("package.json", "{}").await.unwrap();
        assert!(expected.join("package.json").is_file());

        instance.teardown().await.unwrap();
        assert!(!expected.exists());
    }

    #[tokio::test]
    async fn keep_workspaces_survives_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = LocalConfig::new(dir.path().to_path_buf());
        local.keep_workspaces = true;
        let runtime = LocalRuntime::new(local);

        let config = SandboxConfig::new();
        let expected = dir.path().join("workspaces").join(config.id.to_string());
        let instance = runtime.boot(config).await.unwrap();
        instance.teardown().await.unwrap();

        assert!(expected.is_dir());
    }

    #[test]
    fn missing_command_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = LocalConfig::new(dir.path().to_path_buf());
        local.required_commands = vec!["no-such-binary-for-workbench".into()];
        let runtime = LocalRuntime::new(local);

        assert!(matches!(
            runtime.check_environment(),
            Err(SandboxError::EnvironmentUnsupported(_))
        ));
    }
}
