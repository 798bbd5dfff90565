use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::lock::ProjectLock;
use crate::store::ProjectStore;
use crate::types::{
    ProjectFiles, ProjectKey, ProjectMetadata, StoredFile, UploadReceipt, validate_file_path,
    validate_project_id,
};

const METADATA_FILE: &str = "project.json";
const FILES_DIR: &str = "files";

/// Stores projects under a local directory:
///
/// ```text
/// <root>/<id>/project.json
/// <root>/<id>/files/<path>
/// <root>/.locks/<id>.lock
/// ```
///
/// An upload is staged next to the project and swapped into place: the old
/// copy is renamed aside, the staged one renamed in, then the old one
/// removed. A reader never sees a half-written project, and a failed swap
/// puts the old copy back.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn staging_dir(&self, id: &str) -> PathBuf {
        self.root.join(format!(".{id}.staging"))
    }

    fn previous_dir(&self, id: &str) -> PathBuf {
        self.root.join(format!(".{id}.previous"))
    }

    async fn read_metadata(&self, id: &str) -> StoreResult<ProjectMetadata> {
        let path = self.project_dir(id).join(METADATA_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Decode(format!("{}: {e}", path.display())))
    }
}

/// Replace `target` with `staging`. An existing `target` is parked at
/// `previous` until the new copy is in place, and restored if the swap fails.
async fn swap_into_place(staging: &Path, target: &Path, previous: &Path) -> StoreResult<()> {
    if tokio::fs::try_exists(previous).await? {
        tokio::fs::remove_dir_all(previous).await?;
    }

    let parked = tokio::fs::try_exists(target).await?;
    if parked {
        tokio::fs::rename(target, previous).await?;
    }

    if let Err(e) = tokio::fs::rename(staging, target).await {
        if parked && let Err(restore) = tokio::fs::rename(previous, target).await {
            warn!(
                dir = %target.display(),
                error = %restore,
                "could not restore previous project"
            );
        }
        return Err(e.into());
    }

    if parked && let Err(e) = tokio::fs::remove_dir_all(previous).await {
        warn!(dir = %previous.display(), error = %e, "could not remove previous project");
    }
    Ok(())
}

#[async_trait]
impl ProjectStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn upload(
        &self,
        project: &ProjectKey,
        files: &ProjectFiles,
    ) -> StoreResult<UploadReceipt> {
        validate_project_id(&project.id)?;
        for path in files.keys() {
            validate_file_path(path)?;
        }

        let _lock = ProjectLock::acquire(&self.root, &project.id).await?;

        let created_at = match self.read_metadata(&project.id).await {
            Ok(previous) => previous.created_at,
            Err(StoreError::NotFound(_)) => Utc::now(),
            Err(e) => {
                warn!(project_id = %project.id, error = %e, "unreadable metadata, replacing");
                Utc::now()
            }
        };

        let staging = self.staging_dir(&project.id);
        if tokio::fs::try_exists(&staging).await? {
            tokio::fs::remove_dir_all(&staging).await?;
        }

        let files_dir = staging.join(FILES_DIR);
        tokio::fs::create_dir_all(&files_dir).await?;
        let mut stored = Vec::with_capacity(files.len());
        for (path, contents) in files {
            let target = files_dir.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, contents).await?;
            stored.push(StoredFile {
                path: format!("{}/{path}", project.id),
                url: format!("{FILES_DIR}/{path}"),
            });
        }
        let stored_paths: Vec<String> = stored.iter().map(|f| f.path.clone()).collect();

        let metadata = ProjectMetadata {
            id: project.id.clone(),
            name: project.name.clone(),
            created_at,
            files: stored,
        };
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| StoreError::Internal(format!("encode metadata: {e}")))?;
        tokio::fs::write(staging.join(METADATA_FILE), json).await?;

        swap_into_place(
            &staging,
            &self.project_dir(&project.id),
            &self.previous_dir(&project.id),
        )
        .await?;

        info!(project_id = %project.id, files = stored_paths.len(), "project stored");
        Ok(UploadReceipt {
            project_id: project.id.clone(),
            stored_paths,
        })
    }

    async fn download(&self, project_id: &str) -> StoreResult<ProjectFiles> {
        validate_project_id(project_id)?;
        let metadata = self.read_metadata(project_id).await?;
        let files_dir = self.project_dir(project_id).join(FILES_DIR);

        let mut files = ProjectFiles::new();
        for file in &metadata.files {
            let relative = metadata.relative_path(&file.path);
            validate_file_path(relative)?;
            let contents = tokio::fs::read_to_string(files_dir.join(relative)).await?;
            files.insert(relative.to_owned(), contents);
        }
        Ok(files)
    }

    async fn list(&self) -> StoreResult<Vec<ProjectMetadata>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut projects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str() else { continue };
            if id.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            match self.read_metadata(id).await {
                Ok(metadata) => projects.push(metadata),
                Err(e) => warn!(dir = %id, error = %e, "skipping unreadable project"),
            }
        }

        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn delete(&self, project_id: &str) -> StoreResult<()> {
        validate_project_id(project_id)?;
        let _lock = ProjectLock::acquire(&self.root, project_id).await?;

        match tokio::fs::remove_dir_all(self.project_dir(project_id)).await {
            Ok(()) => {
                info!(project_id = %project_id, "project deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(project_id.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> ProjectKey {
        ProjectKey {
            id: id.into(),
            name: "site".into(),
        }
    }

    fn sample() -> ProjectFiles {
        ProjectFiles::from([
            ("package.json".to_string(), "{}".to_string()),
            ("app/page.js".to_string(), "export default 1".to_string()),
        ])
    }

    #[tokio::test]
    async fn upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        let receipt = store.upload(&key("site-1"), &sample()).await.unwrap();
        assert_eq!(
            receipt.stored_paths,
            vec!["site-1/app/page.js", "site-1/package.json"]
        );
        assert!(dir.path().join("site-1/files/app/page.js").is_file());
        assert!(dir.path().join("site-1/project.json").is_file());

        assert_eq!(store.download("site-1").await.unwrap(), sample());
    }

    #[tokio::test]
    async fn reupload_replaces_files_and_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        store.upload(&key("site-1"), &sample()).await.unwrap();
        let first = store.list().await.unwrap()[0].created_at;

        let smaller = ProjectFiles::from([("package.json".to_string(), "{\"v\":2}".to_string())]);
        store.upload(&key("site-1"), &smaller).await.unwrap();

        assert_eq!(store.download("site-1").await.unwrap(), smaller);
        assert!(!dir.path().join("site-1/files/app").exists());
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].created_at, first);
    }

    #[tokio::test]
    async fn reupload_leaves_no_parked_copies() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join(".site-1.previous/files")).unwrap();

        store.upload(&key("site-1"), &sample()).await.unwrap();
        store.upload(&key("site-1"), &sample()).await.unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec![".locks", "site-1"]);
        assert_eq!(store.download("site-1").await.unwrap(), sample());
    }

    #[tokio::test]
    async fn failed_swap_restores_previous_copy() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("site-1");
        let previous = dir.path().join(".site-1.previous");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("project.json"), "old").unwrap();

        let missing_staging = dir.path().join(".site-1.staging");
        let result = swap_into_place(&missing_staging, &target, &previous).await;

        assert!(matches!(result, Err(StoreError::Io(_))));
        assert_eq!(
            std::fs::read_to_string(target.join("project.json")).unwrap(),
            "old"
        );
        assert!(!previous.exists());
    }

    #[tokio::test]
    async fn list_skips_hidden_and_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = LocalStore::new(dir.path().join("nope"));
        assert!(missing.list().await.unwrap().is_empty());

        let store = LocalStore::new(dir.path());
        store.upload(&key("a-1"), &sample()).await.unwrap();
        store.upload(&key("b-2"), &sample()).await.unwrap();
        std::fs::create_dir_all(dir.path().join("stray")).unwrap();

        let listed = store.list().await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a-1") && ids.contains(&"b-2"));
        assert!(listed[0].created_at >= listed[1].created_at);
    }

    #[tokio::test]
    async fn delete_and_missing_project() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.upload(&key("site-1"), &sample()).await.unwrap();

        store.delete("site-1").await.unwrap();
        assert!(matches!(
            store.download("site-1").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("site-1").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_bad_ids_and_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(matches!(
            store.upload(&key("../x"), &sample()).await,
            Err(StoreError::InvalidProjectId(_))
        ));
        let bad = ProjectFiles::from([("../../etc/passwd".to_string(), String::new())]);
        assert!(matches!(
            store.upload(&key("site-1"), &bad).await,
            Err(StoreError::InvalidPath(_))
        ));
        assert!(!dir.path().join("site-1").exists());
    }
}
