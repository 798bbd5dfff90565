use std::path::Path;

use sandbox::SandboxError;

use crate::config::LocalConfig;

/// Verify that the host can run sandboxes before anything is booted.
///
/// Checks the base directory and the required commands. Collects all
/// failures and returns them in a single `EnvironmentUnsupported` error.
pub fn check_prerequisites(config: &LocalConfig) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    ensure_base_dir(&config.base_dir, &mut errors);
    check_required_commands(&config.required_commands, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::EnvironmentUnsupported(errors.join("; ")))
    }
}

/// Create the base directory if needed. The operation is idempotent.
fn ensure_base_dir(path: &Path, errors: &mut Vec<String>) {
    if path.exists() && !path.is_dir() {
        errors.push(format!("base dir is not a directory: {}", path.display()));
        return;
    }
    if let Err(e) = std::fs::create_dir_all(path) {
        errors.push(format!("failed to create {}: {e}", path.display()));
    }
}

fn check_required_commands(commands: &[String], errors: &mut Vec<String>) {
    for cmd in commands {
        if which::which(cmd).is_err() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_with_present_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LocalConfig::new(dir.path().join("base"));
        config.required_commands = vec!["sh".into()];

        check_prerequisites(&config).unwrap();
        assert!(dir.path().join("base").is_dir());
    }

    #[test]
    fn collects_all_failures() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"").unwrap();

        let mut config = LocalConfig::new(file);
        config.required_commands = vec!["definitely-not-a-real-command-xyz".into()];

        let err = check_prerequisites(&config).unwrap_err();
        let SandboxError::EnvironmentUnsupported(msg) = err else {
            panic!("unexpected error: {err}");
        };
        assert!(msg.contains("not a directory"), "got: {msg}");
        assert!(msg.contains("definitely-not-a-real-command-xyz"), "got: {msg}");
    }
}
