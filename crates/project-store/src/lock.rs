use std::fs::File;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::types::validate_project_id;

const LOCKS_DIR: &str = ".locks";

/// Exclusive lock on one stored project, `<root>/.locks/<id>.lock`.
///
/// Writers of the same project (uploads, deletes) take it across processes;
/// readers don't. Released on drop.
pub(crate) struct ProjectLock {
    project_id: String,
    _flock: Flock<File>,
}

impl ProjectLock {
    pub(crate) fn path(root: &Path, project_id: &str) -> PathBuf {
        root.join(LOCKS_DIR).join(format!("{project_id}.lock"))
    }

    /// Wait until the project is free and lock it.
    pub(crate) async fn acquire(root: &Path, project_id: &str) -> StoreResult<Self> {
        validate_project_id(project_id)?;
        let path = Self::path(root, project_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                StoreError::Internal(format!("create lock dir {}: {e}", dir.display()))
            })?;
        }

        let flock = tokio::task::spawn_blocking(move || {
            let file = File::options()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| StoreError::Internal(format!("open lock {}: {e}", path.display())))?;
            Flock::lock(file, FlockArg::LockExclusive)
                .map_err(|(_file, e)| StoreError::Internal(format!("flock {}: {e}", path.display())))
        })
        .await
        .map_err(|e| StoreError::Internal(format!("lock task: {e}")))??;

        debug!(project_id = %project_id, "project locked");
        Ok(Self {
            project_id: project_id.to_owned(),
            _flock: flock,
        })
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        debug!(project_id = %self.project_id, "project unlocked");
    }
}
