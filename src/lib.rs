//! Dynamic preview manager
//!
//! Runs one development server per project, each on a port leased from a
//! fixed pool, and exposes start/stop/status over a JSON HTTP API.
//!
//! # Architecture
//!
//! - **PreviewManager**: Owns the session table and the port pool. All
//!   lifecycle operations go through it.
//!
//! - **Watcher tasks**: One per session. They capture dev-server output into a
//!   bounded log buffer, run the readiness probe and record unexpected exits.
//!
//! - **ProjectStore**: Resolves a project id to the directory the dev server
//!   runs in, and receives best-effort status mirrors.
//!
//! - **HTTP layer**: axum routes under `/preview/` backed by the shared manager.
//!
//! # Routes
//!
//! ## Per project
//! - `POST /preview/:project_id`: Start or replace a preview
//! - `GET /preview/:project_id`: Current preview state
//! - `DELETE /preview/:project_id`: Stop a preview
//!
//! ## System
//! - `GET /preview/status`: Projects joined with their previews and pool usage
//! - `DELETE /preview/status`: Stop every preview
//! - `GET /preview/health`: Health score, memory and recommendations
//! - `POST /preview/health`: Maintenance (`cleanup`, `restart`, `gc`)

use std::path::PathBuf;

pub mod error;
pub mod server;
pub mod session;

pub use error::PreviewError;
pub use server::{router, AppState};
pub use session::{
    DirectoryProjectStore, ManagerConfig, PreviewInfo, PreviewManager, PreviewStatus, ProjectStore,
};

/// Expand `~/` prefix to the user's home directory.
pub fn expand_path(path: &str) -> PathBuf {
    path.strip_prefix("~/")
        .and_then(|stripped| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(stripped)))
        .unwrap_or_else(|| PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_home_prefix_only() {
        assert_eq!(expand_path("/abs/projects"), PathBuf::from("/abs/projects"));
        assert_eq!(expand_path("rel/~/x"), PathBuf::from("rel/~/x"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_path("~/projects"), PathBuf::from(home).join("projects"));
        }
    }
}
