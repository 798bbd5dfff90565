use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{ProjectFiles, ProjectKey, ProjectMetadata, UploadReceipt};

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Human-readable backend name (e.g. "local", "supabase").
    fn name(&self) -> &str;
    /// Store every file of a project, replacing what was stored under the
    /// same project id.
    async fn upload(&self, project: &ProjectKey, files: &ProjectFiles)
    -> StoreResult<UploadReceipt>;
    async fn download(&self, project_id: &str) -> StoreResult<ProjectFiles>;
    /// All stored projects, newest first.
    async fn list(&self) -> StoreResult<Vec<ProjectMetadata>>;
    async fn delete(&self, project_id: &str) -> StoreResult<()>;
}
