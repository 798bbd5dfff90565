use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Flattened project: full `/`-joined path -> file contents.
pub type ProjectFiles = BTreeMap<String, String>;

/// Identity of a stored project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectKey {
    pub id: String,
    pub name: String,
}

impl ProjectKey {
    /// New key for `name`, with id `<slug>-<unix-millis>`.
    pub fn new(name: &str) -> Self {
        Self::at(name, Utc::now())
    }

    pub fn at(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("{}-{}", slug(name), now.timestamp_millis()),
            name: name.to_owned(),
        }
    }
}

/// Keep `[A-Za-z0-9_-]`, map everything else to `-`.
fn slug(name: &str) -> String {
    let slug: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if slug.is_empty() {
        "project".to_owned()
    } else {
        slug
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub project_id: String,
    /// Storage paths, `<project_id>/<file path>`.
    pub stored_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub path: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<StoredFile>,
}

impl ProjectMetadata {
    /// File path relative to the project, for a stored object path.
    pub fn relative_path<'a>(&self, stored: &'a str) -> &'a str {
        stored
            .strip_prefix(self.id.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(stored)
    }
}

/// Project ids become directory names and URL segments.
pub fn validate_project_id(id: &str) -> StoreResult<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidProjectId(id.to_owned()))
    }
}

/// Relative `/`-joined path with no empty, `.` or `..` segments.
pub fn validate_file_path(path: &str) -> StoreResult<()> {
    let valid = !path.is_empty()
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn key_id_is_slug_and_millis() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let key = ProjectKey::at("My App!", now);
        assert_eq!(key.id, "My-App--1700000000123");
        assert_eq!(key.name, "My App!");
        validate_project_id(&key.id).unwrap();
    }

    #[test]
    fn empty_name_gets_placeholder_slug() {
        let now = Utc.timestamp_millis_opt(5).unwrap();
        assert_eq!(ProjectKey::at("  ", now).id, "project-5");
    }

    #[test]
    fn project_id_rules() {
        for ok in ["nextjs-project-1", "a.b_c"] {
            validate_project_id(ok).unwrap();
        }
        for bad in ["", ".", "..", ".hidden", "a/b", "a b"] {
            assert!(validate_project_id(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn file_path_rules() {
        validate_file_path("app/page.js").unwrap();
        for bad in ["", "/abs", "a//b", "../x", "a/."] {
            assert!(validate_file_path(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn metadata_round_trips_json_row() {
        let row = serde_json::json!({
            "id": "site-1",
            "name": "site",
            "created_at": "2026-01-15T10:00:00.000Z",
            "files": [{ "path": "site-1/app/page.js", "url": "site-1/app/page.js" }]
        });
        let meta: ProjectMetadata = serde_json::from_value(row).unwrap();
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.relative_path(&meta.files[0].path), "app/page.js");
    }

    #[test]
    fn metadata_files_default_to_empty() {
        let row = serde_json::json!({
            "id": "x",
            "name": "x",
            "created_at": "2026-01-15T10:00:00Z"
        });
        let meta: ProjectMetadata = serde_json::from_value(row).unwrap();
        assert!(meta.files.is_empty());
    }
}
