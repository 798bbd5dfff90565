use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::http::{HttpClient, send};
use crate::store::ProjectStore;
use crate::types::{
    ProjectFiles, ProjectKey, ProjectMetadata, StoredFile, UploadReceipt, validate_file_path,
    validate_project_id,
};

const STORAGE_OBJECT: &str = "storage/v1/object";
const REST: &str = "rest/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupabaseConfig {
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_table")]
    pub table: String,
}

fn default_bucket() -> String {
    "projects".into()
}

fn default_table() -> String {
    "projects".into()
}

impl SupabaseConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            bucket: default_bucket(),
            table: default_table(),
        }
    }
}

/// Files live as objects `<bucket>/<project id>/<path>`, metadata as one row
/// per project in `<table>`.
pub struct SupabaseStore {
    http: HttpClient,
    bucket: String,
    table: String,
}

#[derive(Deserialize)]
struct CreatedAt {
    created_at: DateTime<Utc>,
}

impl SupabaseStore {
    pub fn new(config: SupabaseConfig) -> StoreResult<Self> {
        Ok(Self {
            http: HttpClient::new(&config.url, config.api_key)?,
            bucket: config.bucket,
            table: config.table,
        })
    }

    async fn fetch_row(&self, project_id: &str) -> StoreResult<Option<ProjectMetadata>> {
        let filter = format!("eq.{project_id}");
        let url = self
            .http
            .url(&[REST, self.table.as_str()], &[("id", filter.as_str()), ("select", "*")])?;
        let resp = send(self.http.request(Method::GET, url), "select project").await?;
        let rows: Vec<ProjectMetadata> = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(format!("project row: {e}")))?;
        Ok(rows.into_iter().next())
    }

    async fn created_at(&self, project_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let filter = format!("eq.{project_id}");
        let url = self.http.url(
            &[REST, self.table.as_str()],
            &[("id", filter.as_str()), ("select", "created_at")],
        )?;
        let resp = send(self.http.request(Method::GET, url), "select created_at").await?;
        let rows: Vec<CreatedAt> = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(format!("created_at row: {e}")))?;
        Ok(rows.into_iter().next().map(|row| row.created_at))
    }

    async fn upload_object(&self, stored_path: &str, contents: &str) -> StoreResult<()> {
        let url = self.http.url(&[STORAGE_OBJECT, self.bucket.as_str(), stored_path], &[])?;
        let req = self
            .http
            .request(Method::POST, url)
            .header("x-upsert", "true")
            .header("cache-control", "max-age=3600")
            .header("content-type", "text/plain;charset=UTF-8")
            .body(contents.to_owned());
        send(req, "upload object").await?;
        debug!(path = %stored_path, "uploaded object");
        Ok(())
    }

    async fn download_object(&self, stored_path: &str) -> StoreResult<String> {
        let url = self.http.url(&[STORAGE_OBJECT, self.bucket.as_str(), stored_path], &[])?;
        let resp = send(self.http.request(Method::GET, url), "download object").await?;
        resp.text()
            .await
            .map_err(|e| StoreError::Decode(format!("object {stored_path}: {e}")))
    }
}

/// Paths stored for a project, `<id>/<path>`, validating each file path.
fn stored_paths(project_id: &str, files: &ProjectFiles) -> StoreResult<Vec<String>> {
    files
        .keys()
        .map(|path| {
            validate_file_path(path)?;
            Ok(format!("{project_id}/{path}"))
        })
        .collect()
}

fn metadata_row(
    project: &ProjectKey,
    created_at: DateTime<Utc>,
    stored: &[String],
) -> ProjectMetadata {
    ProjectMetadata {
        id: project.id.clone(),
        name: project.name.clone(),
        created_at,
        files: stored
            .iter()
            .map(|path| StoredFile {
                path: path.clone(),
                url: path.clone(),
            })
            .collect(),
    }
}

#[async_trait]
impl ProjectStore for SupabaseStore {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn upload(
        &self,
        project: &ProjectKey,
        files: &ProjectFiles,
    ) -> StoreResult<UploadReceipt> {
        validate_project_id(&project.id)?;
        let stored = stored_paths(&project.id, files)?;

        for (path, contents) in stored.iter().zip(files.values()) {
            self.upload_object(path, contents).await?;
        }

        let created_at = self.created_at(&project.id).await?.unwrap_or_else(Utc::now);
        let row = metadata_row(project, created_at, &stored);
        let url = self
            .http
            .url(&[REST, self.table.as_str()], &[("on_conflict", "id")])?;
        let req = self
            .http
            .request(Method::POST, url)
            .header("prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row]);
        send(req, "upsert project").await?;

        info!(project_id = %project.id, files = stored.len(), "project uploaded");
        Ok(UploadReceipt {
            project_id: project.id.clone(),
            stored_paths: stored,
        })
    }

    async fn download(&self, project_id: &str) -> StoreResult<ProjectFiles> {
        validate_project_id(project_id)?;
        let row = self
            .fetch_row(project_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(project_id.to_owned()))?;

        let mut files = ProjectFiles::new();
        for file in &row.files {
            let contents = self.download_object(&file.path).await?;
            files.insert(row.relative_path(&file.path).to_owned(), contents);
        }
        Ok(files)
    }

    async fn list(&self) -> StoreResult<Vec<ProjectMetadata>> {
        let url = self.http.url(
            &[REST, self.table.as_str()],
            &[("select", "*"), ("order", "created_at.desc")],
        )?;
        let resp = send(self.http.request(Method::GET, url), "list projects").await?;
        resp.json()
            .await
            .map_err(|e| StoreError::Decode(format!("project list: {e}")))
    }

    async fn delete(&self, project_id: &str) -> StoreResult<()> {
        validate_project_id(project_id)?;
        let row = self
            .fetch_row(project_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(project_id.to_owned()))?;

        if !row.files.is_empty() {
            let prefixes: Vec<&str> = row.files.iter().map(|f| f.path.as_str()).collect();
            let url = self.http.url(&[STORAGE_OBJECT, self.bucket.as_str()], &[])?;
            let req = self
                .http
                .request(Method::DELETE, url)
                .json(&serde_json::json!({ "prefixes": prefixes }));
            send(req, "remove objects").await?;
        }

        let filter = format!("eq.{project_id}");
        let url = self.http.url(&[REST, self.table.as_str()], &[("id", filter.as_str())])?;
        send(self.http.request(Method::DELETE, url), "delete project").await?;

        info!(project_id = %project_id, "project deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_bucket_and_table() {
        let config: SupabaseConfig =
            serde_json::from_str(r#"{"url":"https://x.supabase.co","api_key":"anon"}"#).unwrap();
        assert_eq!(config, SupabaseConfig::new("https://x.supabase.co", "anon"));
        assert_eq!(config.bucket, "projects");
        assert_eq!(config.table, "projects");
    }

    #[test]
    fn stored_paths_are_prefixed_with_project_id() {
        let files = ProjectFiles::from([
            ("app/page.js".to_string(), "x".to_string()),
            ("package.json".to_string(), "{}".to_string()),
        ]);
        let stored = stored_paths("site-1", &files).unwrap();
        assert_eq!(stored, vec!["site-1/app/page.js", "site-1/package.json"]);
    }

    #[test]
    fn stored_paths_reject_traversal() {
        let files = ProjectFiles::from([("../escape".to_string(), String::new())]);
        assert!(matches!(
            stored_paths("site-1", &files),
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[test]
    fn metadata_row_serializes_like_the_table() {
        let key = ProjectKey {
            id: "site-1".into(),
            name: "site".into(),
        };
        let created = DateTime::parse_from_rfc3339("2026-01-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let row = metadata_row(&key, created, &["site-1/a.js".to_string()]);
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["id"], "site-1");
        assert_eq!(json["files"][0]["path"], "site-1/a.js");
        assert_eq!(json["created_at"], "2026-01-15T10:00:00Z");
    }

    #[test]
    fn invalid_url_fails_construction() {
        assert!(SupabaseStore::new(SupabaseConfig::new("::", "k")).is_err());
    }
}
