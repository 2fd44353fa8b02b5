//! Project lookup and best-effort status mirroring.

use super::types::PreviewInfo;
use crate::error::PreviewError;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Path segments the HTTP layer routes elsewhere.
const RESERVED_IDS: &[&str] = &["status", "health"];
/// Directory (under the store root) that holds mirrored status files.
const MIRROR_DIR: &str = ".preview";

/// A project known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectSummary {
    pub id: String,
    pub path: PathBuf,
}

/// Source of project trees for the preview manager.
///
/// Read-only from the manager's point of view, apart from `mirror_status`,
/// which is advisory and may fail without affecting any session.
pub trait ProjectStore: Send + Sync {
    /// Locate the source directory to run the dev server in.
    fn resolve_source_dir(&self, project_id: &str) -> Result<PathBuf, PreviewError>;

    /// All projects the store knows about.
    fn list_projects(&self) -> Vec<ProjectSummary>;

    /// Record the latest preview state for a project.
    fn mirror_status(&self, _project_id: &str, _info: &PreviewInfo) -> Result<(), PreviewError> {
        Ok(())
    }
}

/// Reject ids that could escape the store root or collide with fixed routes.
pub fn validate_project_id(project_id: &str) -> Result<(), PreviewError> {
    let invalid = project_id.is_empty()
        || project_id.len() > 128
        || project_id.starts_with('.')
        || RESERVED_IDS.contains(&project_id)
        || !project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if invalid {
        return Err(PreviewError::InvalidProjectId(project_id.to_string()));
    }
    Ok(())
}

/// Projects laid out as `<root>/<project_id>/`.
pub struct DirectoryProjectStore {
    root: PathBuf,
}

impl DirectoryProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn mirror_path(&self, project_id: &str) -> PathBuf {
        self.root.join(MIRROR_DIR).join(format!("{project_id}.json"))
    }
}

impl ProjectStore for DirectoryProjectStore {
    fn resolve_source_dir(&self, project_id: &str) -> Result<PathBuf, PreviewError> {
        validate_project_id(project_id)?;
        let dir = self.root.join(project_id);
        if !dir.is_dir() {
            return Err(PreviewError::ProjectNotFound(project_id.to_string()));
        }
        Ok(dir)
    }

    fn list_projects(&self) -> Vec<ProjectSummary> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut projects: Vec<ProjectSummary> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let id = e.file_name().to_str()?.to_string();
                validate_project_id(&id).ok()?;
                Some(ProjectSummary { id, path: e.path() })
            })
            .collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        projects
    }

    fn mirror_status(&self, project_id: &str, info: &PreviewInfo) -> Result<(), PreviewError> {
        validate_project_id(project_id)?;
        let path = self.mirror_path(project_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(info)
            .map_err(|e| PreviewError::Io(std::io::Error::other(e)))?;
        fs::write(path, body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::PreviewSession;
    use tempfile::TempDir;

    #[test]
    fn validates_ids() {
        assert!(validate_project_id("landing-page_01").is_ok());
        assert!(validate_project_id("v1.2").is_ok());
        for bad in ["", "..", "../etc", "a/b", ".hidden", "status", "health", "sp ace"] {
            assert!(
                matches!(validate_project_id(bad), Err(PreviewError::InvalidProjectId(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn resolves_existing_project() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("alpha")).unwrap();
        let store = DirectoryProjectStore::new(tmp.path());

        assert_eq!(store.resolve_source_dir("alpha").unwrap(), tmp.path().join("alpha"));
        assert!(matches!(
            store.resolve_source_dir("missing"),
            Err(PreviewError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn plain_files_are_not_projects() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("notes"), "x").unwrap();
        let store = DirectoryProjectStore::new(tmp.path());
        assert!(matches!(
            store.resolve_source_dir("notes"),
            Err(PreviewError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn lists_projects_sorted_and_skips_mirror_dir() {
        let tmp = TempDir::new().unwrap();
        for name in ["zeta", "alpha", ".preview"] {
            fs::create_dir(tmp.path().join(name)).unwrap();
        }
        let store = DirectoryProjectStore::new(tmp.path());
        let ids: Vec<String> = store.list_projects().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn missing_root_lists_nothing() {
        let store = DirectoryProjectStore::new("/nonexistent/preview-root");
        assert!(store.list_projects().is_empty());
    }

    #[test]
    fn mirrors_status_to_json() {
        let tmp = TempDir::new().unwrap();
        let store = DirectoryProjectStore::new(tmp.path());
        let info = PreviewSession::new("alpha", 3002, "localhost", 8).snapshot();

        store.mirror_status("alpha", &info).unwrap();

        let raw = fs::read_to_string(tmp.path().join(".preview/alpha.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["port"], 3002);
        assert_eq!(value["status"], "starting");
    }
}
