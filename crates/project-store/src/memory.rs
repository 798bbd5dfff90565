use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::store::ProjectStore;
use crate::types::{
    ProjectFiles, ProjectKey, ProjectMetadata, StoredFile, UploadReceipt, validate_project_id,
};

/// Keeps projects in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    projects: Mutex<BTreeMap<String, (ProjectMetadata, ProjectFiles)>>,
    uploads: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `upload()` calls so far, failed ones included.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Make uploads fail with `StoreError::Api` until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upload(
        &self,
        project: &ProjectKey,
        files: &ProjectFiles,
    ) -> StoreResult<UploadReceipt> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Api("upload rejected".into()));
        }
        validate_project_id(&project.id)?;
        let stored_paths: Vec<String> = files
            .keys()
            .map(|path| format!("{}/{path}", project.id))
            .collect();

        let mut projects = self.projects.lock().await;
        let created_at = projects
            .get(&project.id)
            .map_or_else(Utc::now, |(meta, _)| meta.created_at);
        let metadata = ProjectMetadata {
            id: project.id.clone(),
            name: project.name.clone(),
            created_at,
            files: stored_paths
                .iter()
                .map(|p| StoredFile {
                    path: p.clone(),
                    url: p.clone(),
                })
                .collect(),
        };
        projects.insert(project.id.clone(), (metadata, files.clone()));

        Ok(UploadReceipt {
            project_id: project.id.clone(),
            stored_paths,
        })
    }

    async fn download(&self, project_id: &str) -> StoreResult<ProjectFiles> {
        self.projects
            .lock()
            .await
            .get(project_id)
            .map(|(_, files)| files.clone())
            .ok_or_else(|| StoreError::NotFound(project_id.to_owned()))
    }

    async fn list(&self) -> StoreResult<Vec<ProjectMetadata>> {
        let mut list: Vec<ProjectMetadata> = self
            .projects
            .lock()
            .await
            .values()
            .map(|(meta, _)| meta.clone())
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn delete(&self, project_id: &str) -> StoreResult<()> {
        self.projects
            .lock()
            .await
            .remove(project_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(project_id.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_replaces_previous_version() {
        let store = MemoryStore::new();
        let key = ProjectKey {
            id: "site-1".into(),
            name: "site".into(),
        };

        let first = ProjectFiles::from([("a.txt".to_string(), "1".to_string())]);
        store.upload(&key, &first).await.unwrap();
        let second = ProjectFiles::from([("b.txt".to_string(), "2".to_string())]);
        let receipt = store.upload(&key, &second).await.unwrap();

        assert_eq!(receipt.stored_paths, vec!["site-1/b.txt".to_string()]);
        assert_eq!(store.download("site-1").await.unwrap(), second);
        assert_eq!(store.list().await.unwrap().len(), 1);

        assert_eq!(store.upload_count(), 2);

        store.set_failing(true);
        assert!(matches!(
            store.upload(&key, &first).await,
            Err(StoreError::Api(_))
        ));
        assert_eq!(store.download("site-1").await.unwrap(), second);

        store.delete("site-1").await.unwrap();
        assert!(matches!(
            store.download("site-1").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
