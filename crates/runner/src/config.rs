use std::path::{Path, PathBuf};
use std::sync::Arc;

use project_store::{LocalStore, ProjectStore, SupabaseConfig, SupabaseStore};
use sandbox_local::LocalConfig;
use serde::{Deserialize, Serialize};
use workbench::WorkbenchConfig;

use crate::error::{RunnerError, RunnerResult};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Sandbox workspaces live under `<base_dir>/workspaces`.
    pub base_dir: PathBuf,
    pub store: StoreConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub session: WorkbenchConfig,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Local { root: PathBuf },
    Supabase(SupabaseConfig),
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub required_commands: Vec<String>,
    pub keep_workspaces: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let local = LocalConfig::new(PathBuf::new());
        Self {
            required_commands: local.required_commands,
            keep_workspaces: local.keep_workspaces,
        }
    }
}

/// Load and validate a runner config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: RunnerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

impl RunnerConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.base_dir);
        if let StoreConfig::Local { root } = &mut self.store {
            resolve(root);
        }
    }

    fn validate(&self) -> RunnerResult<()> {
        self.session
            .validate()
            .map_err(|e| RunnerError::Config(format!("session: {e}")))?;
        if let StoreConfig::Supabase(supabase) = &self.store
            && supabase.url.is_empty()
        {
            return Err(RunnerError::Config("store.url is required".into()));
        }
        Ok(())
    }

    pub fn local_config(&self) -> LocalConfig {
        LocalConfig {
            base_dir: self.base_dir.clone(),
            required_commands: self.sandbox.required_commands.clone(),
            keep_workspaces: self.sandbox.keep_workspaces,
        }
    }

    /// Open the configured project store.
    pub fn open_store(&self) -> RunnerResult<Arc<dyn ProjectStore>> {
        match &self.store {
            StoreConfig::Local { root } => Ok(Arc::new(LocalStore::new(root.clone()))),
            StoreConfig::Supabase(supabase) => {
                if supabase.api_key.is_empty() {
                    return Err(RunnerError::Config(
                        "store.api_key is required (set in config or via --supabase-key / SUPABASE_API_KEY)"
                            .into(),
                    ));
                }
                Ok(Arc::new(SupabaseStore::new(supabase.clone())?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let config_path = dir.join("runner.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap();
        config_path
    }

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
base_dir: {base_dir}
store:
  kind: local
  root: {base_dir}/projects
sandbox:
  required_commands: [node, pnpm]
  keep_workspaces: true
session:
  install_timeout_secs: 120
  install_command: [pnpm, install]
  serve_command: [pnpm, dev]
  serve_rules:
    failure:
      - pattern: "EADDRINUSE"
    success:
      - pattern: "Local:"
"#,
            base_dir = dir.path().display(),
        );
        let config = load(&write_config(dir.path(), &yaml).await).await.unwrap();

        assert_eq!(
            config.store,
            StoreConfig::Local {
                root: dir.path().join("projects")
            }
        );
        assert_eq!(config.sandbox.required_commands, ["node", "pnpm"]);
        assert!(config.sandbox.keep_workspaces);
        assert_eq!(config.session.install_timeout(), Duration::from_secs(120));
        assert_eq!(config.session.serve_command, ["pnpm", "dev"]);
        assert_eq!(config.session.serve_rules.success.len(), 1);
        // Unset fields keep their defaults.
        assert_eq!(config.session.serve_timeout(), Duration::from_secs(60));

        let local = config.local_config();
        assert_eq!(local.base_dir, dir.path());
        assert!(local.keep_workspaces);
    }

    #[tokio::test]
    async fn load_defaults_for_sandbox_and_session() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
base_dir: work
store:
  kind: local
  root: projects
"#;
        let config = load(&write_config(dir.path(), yaml).await).await.unwrap();
        assert_eq!(config.sandbox, SandboxConfig::default());
        assert_eq!(config.sandbox.required_commands, ["node", "npm"]);
        assert_eq!(config.session, WorkbenchConfig::default());
    }

    #[tokio::test]
    async fn load_supabase_store() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
base_dir: /tmp/runner
store:
  kind: supabase
  url: https://abc.supabase.co
  api_key: anon
"#;
        let config = load(&write_config(dir.path(), yaml).await).await.unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Supabase(SupabaseConfig::new("https://abc.supabase.co", "anon"))
        );
        assert_eq!(config.open_store().unwrap().name(), "supabase");
    }

    #[tokio::test]
    async fn supabase_store_needs_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
base_dir: /tmp/runner
store:
  kind: supabase
  url: https://abc.supabase.co
  api_key: ""
"#;
        let config = load(&write_config(dir.path(), yaml).await).await.unwrap();
        let err = config.open_store().err().unwrap();
        assert!(err.to_string().contains("api_key"), "got: {err}");
    }

    #[tokio::test]
    async fn load_rejects_invalid_session() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
base_dir: /tmp/runner
store:
  kind: local
  root: /tmp/projects
session:
  serve_timeout_secs: 0
"#;
        let err = load(&write_config(dir.path(), yaml).await)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("session"), "got: {err}");
    }

    #[tokio::test]
    async fn load_rejects_unknown_store_kind() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
base_dir: /tmp/runner
store:
  kind: ftp
"#;
        let err = load(&write_config(dir.path(), yaml).await)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("parse"), "got: {err}");
    }

    #[tokio::test]
    async fn load_fails_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.yaml")).await.unwrap_err();
        assert!(err.to_string().contains("read"), "got: {err}");
    }

    #[tokio::test]
    async fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
base_dir: my-runner
store:
  kind: local
  root: data/projects
"#;
        let config = load(&write_config(dir.path(), yaml).await).await.unwrap();

        assert!(config.base_dir.is_absolute());
        assert_eq!(config.base_dir, dir.path().join("my-runner"));
        assert_eq!(
            config.store,
            StoreConfig::Local {
                root: dir.path().join("data/projects")
            }
        );
        assert_eq!(config.open_store().unwrap().name(), "local");
    }

    #[test]
    fn yaml_round_trip() {
        let config = RunnerConfig {
            base_dir: PathBuf::from("/srv/runner"),
            store: StoreConfig::Local {
                root: PathBuf::from("/srv/projects"),
            },
            sandbox: SandboxConfig::default(),
            session: WorkbenchConfig::default(),
        };
        let yaml = serde_yaml_ng::to_string(&config).unwrap();
        let parsed: RunnerConfig = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
