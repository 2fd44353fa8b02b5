//! Preview manager server
//!
//! Serves the `/preview/` HTTP API and supervises one dev server per project.
//!
//! Lifecycle:
//! - `serve` (default): HTTP API until SIGTERM/SIGINT/SIGQUIT, then every
//!   running preview is stopped before exit
//! - `probe`: start one project's preview, wait for it, print the result, stop it

use clap::{Args, Parser, Subcommand, ValueEnum};
use preview_manager::session::{
    DevCommand, ReadinessProbe, DEFAULT_DEV_COMMAND, DEFAULT_LOG_CAPACITY, DEFAULT_PORT_RANGE_END,
    DEFAULT_PORT_RANGE_START, DEFAULT_READY_PATTERN,
};
use preview_manager::{
    expand_path, router, AppState, DirectoryProjectStore, ManagerConfig, PreviewManager,
    PreviewStatus,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Status poll interval for `probe`.
const PROBE_POLL_MS: u64 = 250;

#[derive(Parser)]
#[command(name = "preview-manager", version, about = "Per-project dev-server preview manager")]
struct Cli {
    #[command(flatten)]
    settings: Settings,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Start one preview, wait for it and print its state
    Probe(ProbeArgs),
}

#[derive(Args)]
struct ProbeArgs {
    /// Project id (directory name under --projects-dir)
    #[arg(long)]
    project: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReadinessMode {
    /// Match dev-server output against --ready-pattern
    Log,
    /// Poll http://127.0.0.1:<port><ready-path>
    Http,
}

#[derive(Args)]
struct Settings {
    /// Bind address for the HTTP API
    #[arg(long, env = "PREVIEW_BIND", default_value = "127.0.0.1:8787", global = true)]
    bind: String,
    /// Directory holding one subdirectory per project
    #[arg(long, env = "PREVIEW_PROJECTS_DIR", default_value = "./projects", global = true)]
    projects_dir: String,
    /// First port of the preview pool (inclusive)
    #[arg(long, env = "PREVIEW_PORT_RANGE_START", default_value_t = DEFAULT_PORT_RANGE_START, global = true)]
    port_range_start: u16,
    /// End of the preview pool (exclusive)
    #[arg(long, env = "PREVIEW_PORT_RANGE_END", default_value_t = DEFAULT_PORT_RANGE_END, global = true)]
    port_range_end: u16,
    /// Dev server command; `{port}` is replaced with the assigned port
    #[arg(long, env = "PREVIEW_DEV_COMMAND", default_value = DEFAULT_DEV_COMMAND, global = true)]
    dev_command: String,
    /// How readiness is detected
    #[arg(long, env = "PREVIEW_READINESS", value_enum, default_value = "log", global = true)]
    readiness: ReadinessMode,
    /// Regex matched against output lines in `log` mode
    #[arg(long, env = "PREVIEW_READY_PATTERN", default_value = DEFAULT_READY_PATTERN, global = true)]
    ready_pattern: String,
    /// Path probed in `http` mode
    #[arg(long, env = "PREVIEW_READY_PATH", default_value = "/", global = true)]
    ready_path: String,
    /// Output lines kept per session
    #[arg(long, env = "PREVIEW_LOG_CAPACITY", default_value_t = DEFAULT_LOG_CAPACITY, global = true)]
    log_capacity: usize,
    /// Seconds between SIGTERM and SIGKILL when stopping
    #[arg(long, env = "PREVIEW_STOP_GRACE_SECS", default_value_t = 5, global = true)]
    stop_grace_secs: u64,
    /// Seconds a preview may take to become ready
    #[arg(long, env = "PREVIEW_READY_TIMEOUT_SECS", default_value_t = 120, global = true)]
    ready_timeout_secs: u64,
    /// Soft cap on active previews used for health scoring
    #[arg(long, env = "PREVIEW_MAX_SESSIONS", default_value_t = 8, global = true)]
    max_sessions: usize,
    /// Allowed Origin values (comma-separated)
    #[arg(
        long,
        env = "PREVIEW_ALLOW_ORIGIN",
        value_delimiter = ',',
        default_value = "http://localhost,http://127.0.0.1",
        global = true
    )]
    allow_origin: Vec<String>,
}

impl Settings {
    fn manager_config(&self) -> anyhow::Result<ManagerConfig> {
        if self.port_range_end <= self.port_range_start {
            anyhow::bail!(
                "empty port range {}..{}",
                self.port_range_start,
                self.port_range_end
            );
        }
        let readiness = match self.readiness {
            ReadinessMode::Log => ReadinessProbe::log_pattern(&self.ready_pattern)
                .map_err(|e| anyhow::anyhow!("invalid --ready-pattern: {e}"))?,
            ReadinessMode::Http => ReadinessProbe::http(&self.ready_path),
        };
        Ok(ManagerConfig {
            port_range_start: self.port_range_start,
            port_range_end: self.port_range_end,
            dev_command: DevCommand::parse(&self.dev_command)?,
            readiness,
            log_capacity: self.log_capacity,
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            max_sessions: self.max_sessions,
            ..ManagerConfig::default()
        })
    }

    fn build_manager(&self) -> anyhow::Result<Arc<PreviewManager>> {
        let projects_dir = expand_path(&self.projects_dir);
        if !projects_dir.is_dir() {
            warn!(path = %projects_dir.display(), "Projects directory does not exist yet");
        }
        let store = Arc::new(DirectoryProjectStore::new(projects_dir));
        Ok(Arc::new(PreviewManager::new(self.manager_config()?, store)))
    }

    fn allowed_origins(&self) -> Vec<String> {
        self.allow_origin
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Logs go to stderr; `probe` prints its result on stdout.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("preview_manager=info,tower_http=info")
        }))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(&cli.settings).await,
        Command::Probe(args) => run_probe(&cli.settings, args).await,
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
            _ = sigquit.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

async fn run_server(settings: &Settings) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = settings
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;
    let manager = settings.build_manager()?;
    let config = manager.config();
    info!(
        port_range_start = config.port_range_start,
        port_range_end = config.port_range_end,
        dev_command = %config.dev_command.template(),
        "Starting preview manager"
    );

    let app = router(AppState::new(manager.clone(), settings.allowed_origins()));
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind failed: {e}"))?;
    info!("Preview API listening on http://{bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = wait_for_shutdown_signal().await {
                warn!(error = %e, "Shutdown signal handler failed; stopping now");
            }
            info!("Shutdown signal received");
        })
        .await?;

    let stopped = manager.stop_all().await;
    info!(stopped, "Server stopped");
    Ok(())
}

async fn run_probe(settings: &Settings, args: ProbeArgs) -> anyhow::Result<()> {
    info!(project_id = %args.project, "Starting preview manager (probe mode)");
    let manager = settings.build_manager()?;
    let started = Instant::now();

    let info = manager.start_preview(&args.project).await?;
    info!(port = info.port, pid = ?info.pid, "Dev server spawned");

    // The watcher enforces the ready timeout; the extra second lets it land.
    let deadline = manager.config().ready_timeout + Duration::from_secs(1);
    let mut last = Some(info);
    while started.elapsed() < deadline {
        last = manager.get_status(&args.project);
        match last.as_ref().map(|i| i.status) {
            Some(PreviewStatus::Starting) => {
                tokio::time::sleep(Duration::from_millis(PROBE_POLL_MS)).await;
            }
            _ => break,
        }
    }

    println!("{}", serde_json::to_string_pretty(&last)?);
    manager.stop_preview(&args.project).await;

    match last.map(|i| i.status) {
        Some(PreviewStatus::Running) => {
            info!(elapsed_ms = started.elapsed().as_millis() as u64, "Probe succeeded");
            Ok(())
        }
        other => anyhow::bail!("preview did not become ready (status: {other:?})"),
    }
}
