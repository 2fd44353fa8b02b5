//! Preview session management.
//!
//! Each project gets at most one preview session: a dev-server subprocess
//! bound to a port leased from a fixed pool. The manager owns the session
//! table and the pool; one watcher task per session follows the process
//! output, flips the status to `running` once the readiness probe passes, and
//! records failures when the process dies.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Preview Manager Process                     │
//! │                                                          │
//! │  HTTP Client ──▶  axum router (/preview/...)             │
//! │                  ├─ start / status / stop per project    │
//! │                  └─ overview, health, maintenance        │
//! │                                                          │
//! │                  PreviewManager                          │
//! │                  ├─ sessions: HashMap<String, Session>   │
//! │                  ├─ project_locks (one per project)      │
//! │                  └─ port_allocator: 3002-3011            │
//! └─────────────────────────────────────────────────────────┘
//!                               │ spawn + watch
//!         ┌─────────────────────┼─────────────────────┐
//!         ▼                     ▼                     ▼
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Project "a"  │     │ Project "b"  │     │ Project "N"  │
//! │ Port: 3002   │     │ Port: 3003   │     │ Port: ...    │
//! │ npm run dev  │     │ npm run dev  │     │ npm run dev  │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

mod command;
pub mod health;
mod log_buffer;
mod manager;
mod port_allocator;
mod process;
mod project_store;
mod readiness;
mod types;

pub use command::{DevCommand, DEFAULT_DEV_COMMAND};
pub use health::{HealthAssessment, HealthInputs, HealthLevel, MaintenanceAction, MemorySnapshot};
pub use log_buffer::{LogBuffer, DEFAULT_LOG_CAPACITY};
pub use manager::{
    ActionResult, ManagerConfig, PreviewManager, PreviewOverview, PreviewStats, ProjectPreview,
};
pub use port_allocator::{PortAllocator, PortUsage, DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START};
pub use process::{PreviewProcess, TerminateOutcome};
pub use project_store::{validate_project_id, DirectoryProjectStore, ProjectStore, ProjectSummary};
pub use readiness::{HttpProber, ReadinessProbe, DEFAULT_READY_PATTERN};
pub use types::{PreviewInfo, PreviewSession, PreviewStatus};
