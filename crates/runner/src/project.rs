//! Reading projects from disk and writing pulled projects back.

use std::io;
use std::path::{Path, PathBuf};

use project_store::{ProjectFiles, validate_file_path};
use tracing::{debug, warn};
use workbench::GeneratedProject;

use crate::error::{RunnerError, RunnerResult};

/// Never mounted: dependencies and build output are recreated in the sandbox.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", ".next"];

/// A project read from disk, named after its file or directory.
#[derive(Debug)]
pub struct LoadedProject {
    pub name: String,
    pub files: ProjectFiles,
}

/// Load a project from a directory, or from a JSON file shaped like the code
/// generator's output (`{"files": {"path": "contents"}}`).
pub async fn load(source: &Path) -> RunnerResult<LoadedProject> {
    let metadata = tokio::fs::metadata(source)
        .await
        .map_err(|e| RunnerError::Project(format!("{}: {e}", source.display())))?;

    let files = if metadata.is_dir() {
        load_dir(source).await?
    } else {
        let json = tokio::fs::read_to_string(source).await?;
        GeneratedProject::from_json(&json)?.files
    };
    if files.is_empty() {
        return Err(RunnerError::Project(format!(
            "{}: no files",
            source.display()
        )));
    }

    let name = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("project")
        .to_owned();
    Ok(LoadedProject { name, files })
}

async fn load_dir(root: &Path) -> RunnerResult<ProjectFiles> {
    let mut files = ProjectFiles::new();
    let mut pending = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                warn!(path = %entry.path().display(), "skipping non-UTF-8 name");
                continue;
            };
            let path = if prefix.is_empty() {
                name.to_owned()
            } else {
                format!("{prefix}/{name}")
            };

            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if SKIPPED_DIRS.contains(&name) {
                    debug!(path = %path, "skipping directory");
                } else {
                    pending.push((entry.path(), path));
                }
            } else if file_type.is_file() {
                match tokio::fs::read_to_string(entry.path()).await {
                    Ok(contents) => {
                        files.insert(path, contents);
                    }
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        warn!(path = %path, "skipping binary file");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Ok(files)
}

/// Write `files` under `dest`, creating directories as needed.
pub async fn write(dest: &Path, files: &ProjectFiles) -> RunnerResult<()> {
    for (path, contents) in files {
        validate_file_path(path)?;
        let target: PathBuf = dest.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, contents).await?;
    }
    Ok(())
}
