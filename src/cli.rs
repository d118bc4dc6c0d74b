//! Command-line entry point: flags, logging setup and the server lifecycle.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::adapters::event_hub::EventHub;
use crate::adapters::process_runner::ProcessRunner;
use crate::adapters::sqlite_store::SqliteTaskStore;
use crate::adapters::web::{AppState, build_router};
use crate::domain::error::BusError;
use crate::domain::retry::RetryPolicy;
use crate::domain::settings::{
    BusSettings, DEFAULT_ENTRYPOINT, default_db_path, parse_listen_addr, resolve_interpreter,
    timeout_from_secs,
};
use crate::ports::command_runner::CommandRunner;
use crate::ports::task_store::TaskStore;
use crate::queue::{DEFAULT_QUEUE_CAPACITY, QueueSettings, TaskQueue};

#[derive(Parser, Debug, Clone)]
#[command(name = "apibus", version, about = "HTTP task bus for the research engine")]
pub struct Cli {
    /// Listen address; `:PORT` binds all interfaces
    #[arg(long, env = "APIBUS_ADDR", default_value = ":8000")]
    pub addr: String,

    /// Repository root; defaults to the current directory
    #[arg(long, env = "APIBUS_REPO")]
    pub repo: Option<PathBuf>,

    /// Interpreter; defaults to <repo>/.venv/bin/python, then python3
    #[arg(long, env = "APIBUS_PYTHON")]
    pub python: Option<PathBuf>,

    /// Per-run timeout in seconds, 0 for none
    #[arg(long, env = "APIBUS_TIMEOUT", default_value_t = 0)]
    pub timeout: u64,

    #[arg(long, env = "APIBUS_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// SQLite path; defaults to <repo>/results/api_bus.sqlite3
    #[arg(long, env = "APIBUS_DB")]
    pub db: Option<PathBuf>,

    #[arg(long, env = "APIBUS_MAX_RETRIES", default_value_t = 0)]
    pub max_retries: u32,

    #[arg(long, env = "APIBUS_RETRY_BACKOFF_MS", default_value_t = 1000)]
    pub retry_backoff_ms: u64,

    #[arg(long, env = "APIBUS_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Tracing filter, used when RUST_LOG is unset
    #[arg(long, env = "APIBUS_LOG", default_value = "info")]
    pub log: String,

    #[arg(long, env = "APIBUS_LOG_JSON")]
    pub log_json: bool,
}

impl Cli {
    pub fn into_settings(self) -> Result<BusSettings, BusError> {
        let addr = parse_listen_addr(&self.addr)?;
        let repo = match self.repo.filter(|p| !p.as_os_str().is_empty()) {
            Some(repo) => repo,
            None => std::env::current_dir()?,
        };
        let repo_root = std::path::absolute(&repo)?;
        if self.queue_capacity == 0 {
            return Err(BusError::InvalidSettings {
                name: "queue-capacity".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(BusSettings {
            addr,
            interpreter: resolve_interpreter(&repo_root, self.python),
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
            timeout: timeout_from_secs(self.timeout),
            workers: self.workers.max(1),
            queue_capacity: self.queue_capacity,
            db_path: self
                .db
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| default_db_path(&repo_root)),
            retry: RetryPolicy::fixed(
                self.max_retries,
                Duration::from_millis(self.retry_backoff_ms),
            ),
            repo_root,
        })
    }
}

/// RUST_LOG wins over `--log`; an invalid filter warns and falls back to info.
pub fn init_tracing(filter: &str, json: bool) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match filter.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!("warning: log filter '{filter}' is invalid ({e}); using 'info'");
                EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    let installed = if json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
    if let Err(e) = installed {
        eprintln!("warning: tracing already initialised: {e}");
    }
}

pub fn run(cli: Cli) -> ExitCode {
    init_tracing(&cli.log, cli.log_json);

    let settings = match cli.into_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(&e);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(serve(settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server stopped with an error");
            ExitCode::from(&e)
        }
    }
}

/// Opens storage, starts the queue and serves HTTP until a shutdown signal.
pub async fn serve(settings: BusSettings) -> Result<(), BusError> {
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&settings.db_path)?);
    info!(db = %settings.db_path.display(), "task store ready");

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::from_settings(&settings));
    let hub = Arc::new(EventHub::new());
    let queue = TaskQueue::start(
        QueueSettings::from_settings(&settings),
        Arc::clone(&store),
        runner,
        Arc::clone(&hub),
    )
    .await?;

    let router = build_router(AppState { queue, hub, store });
    let listener = tokio::net::TcpListener::bind(settings.addr).await?;
    info!(
        addr = %settings.addr,
        repo = %settings.repo_root.display(),
        interpreter = %settings.interpreter.display(),
        workers = settings.workers,
        "apibus listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("apibus stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl-C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["apibus"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_resolve_under_repo() {
        let repo = tempfile::tempdir().unwrap();
        let settings = parse(&["--repo", repo.path().to_str().unwrap()])
            .into_settings()
            .unwrap();
        assert_eq!(settings.addr.port(), 8000);
        assert_eq!(settings.workers, 1);
        assert_eq!(settings.timeout, None);
        assert_eq!(settings.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(settings.retry.max_retries, 0);
        assert_eq!(settings.retry.backoff(), Duration::from_millis(1000));
        assert_eq!(settings.db_path, default_db_path(&settings.repo_root));
        assert_eq!(settings.interpreter, PathBuf::from("python3"));
    }

    #[test]
    fn explicit_flags_win() {
        let repo = tempfile::tempdir().unwrap();
        let settings = parse(&[
            "--repo",
            repo.path().to_str().unwrap(),
            "--addr",
            "127.0.0.1:9100",
            "--python",
            "/usr/bin/python3.12",
            "--timeout",
            "30",
            "--workers",
            "0",
            "--db",
            "/tmp/bus.db",
            "--max-retries",
            "2",
            "--retry-backoff-ms",
            "0",
        ])
        .into_settings()
        .unwrap();
        assert_eq!(settings.addr.to_string(), "127.0.0.1:9100");
        assert_eq!(settings.interpreter, PathBuf::from("/usr/bin/python3.12"));
        assert_eq!(settings.timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.workers, 1);
        assert_eq!(settings.db_path, PathBuf::from("/tmp/bus.db"));
        assert_eq!(settings.retry.max_retries, 2);
        assert_eq!(settings.retry.backoff(), Duration::from_secs(1));
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let err = parse(&["--queue-capacity", "0"]).into_settings().unwrap_err();
        assert!(matches!(err, BusError::InvalidSettings { .. }));
    }
}
