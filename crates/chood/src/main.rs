//! chood - workflow orchestrator for agent-driven unit execution.
//!
//! Entry point for the `chood` binary: `run` executes a tasks directory
//! against a repository, `web` hosts the dashboard, `daemon` supervises
//! runs, `normalize` rewrites legacy task metadata.

use chood::bus::EventBus;
use chood::daemon::Daemon;
use chood::discovery;
use chood::job::{self, JobHandle};
use chood::storage::Storage;
use chood::web::{server, socket, sse::SseHub, state};
use choo_core::Config;
use clap::{Parser, Subcommand};
use eyre::WrapErr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Exit code when interrupted by SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

/// Workflow orchestrator driving coding agents over task units.
#[derive(Parser)]
#[command(name = "chood")]
#[command(about = "Workflow orchestrator for agent-driven unit execution")]
#[command(version)]
struct Cli {
    /// Config file (TOML); flags override file values
    #[arg(long, global = true, env = "CHOO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute the tasks directory of a repository
    Run {
        /// Repository root (default: current directory)
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Feature branch name for this run
        #[arg(long)]
        feature_branch: String,

        /// Tasks directory, relative to the repository root
        #[arg(long)]
        tasks_dir: Option<PathBuf>,

        /// Maximum concurrent unit workers
        #[arg(long)]
        parallelism: Option<u32>,

        /// Branch unit branches are created from
        #[arg(long)]
        target_branch: Option<String>,

        /// Agent provider (third in the precedence chain)
        #[arg(long)]
        provider: Option<String>,

        /// Provider forced for every unit
        #[arg(long)]
        force_task_provider: Option<String>,

        /// Run only the named unit
        #[arg(long)]
        single_unit: Option<String>,

        /// Skip push and PR creation
        #[arg(long)]
        no_pr: bool,

        /// Discover and validate without executing
        #[arg(long)]
        dry_run: bool,

        /// Database path (default: .choo/choo.db under the repository)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Host the dashboard: socket ingress plus HTTP/SSE egress
    Web {
        /// HTTP port on 127.0.0.1
        #[arg(long, default_value_t = 7420)]
        port: u16,

        /// Unix socket path (default: $XDG_RUNTIME_DIR/choo/web.sock)
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Supervise runs: resume incomplete work, then wait for jobs
    Daemon {
        /// Database path
        #[arg(long)]
        db: PathBuf,
    },

    /// Rewrite legacy `## Metadata` blocks to canonical front-matter
    Normalize {
        /// Repository root (default: current directory)
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Tasks directory, relative to the repository root
        #[arg(long)]
        tasks_dir: Option<PathBuf>,
    },
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // clap exits with code 2 on invalid arguments.
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(execute(cli));
    std::process::exit(code);
}

async fn execute(cli: Cli) -> i32 {
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return 2;
        }
    };

    match cli.command {
        Command::Run {
            repo,
            feature_branch,
            tasks_dir,
            parallelism,
            target_branch,
            provider,
            force_task_provider,
            single_unit,
            no_pr,
            dry_run,
            db,
        } => {
            let mut config = config;
            if let Some(tasks_dir) = tasks_dir {
                config.tasks_dir = tasks_dir;
            }
            if let Some(parallelism) = parallelism {
                config.parallelism = parallelism;
            }
            if let Some(target_branch) = target_branch {
                config.target_branch = target_branch;
            }
            if let Some(force) = force_task_provider {
                config.force_task_provider = Some(force);
            }
            if let Some(single) = single_unit {
                config.single_unit = Some(single);
            }
            config.no_pr |= no_pr;
            config.dry_run |= dry_run;
            if let Err(e) = config.validate() {
                error!("{}", e);
                return 2;
            }

            let repo = match resolve_repo(repo) {
                Ok(repo) => repo,
                Err(code) => return code,
            };
            let db_path = db.unwrap_or_else(|| repo.join(".choo/choo.db"));

            run_command(repo, feature_branch, config, provider, &db_path).await
        }
        Command::Web { port, socket: socket_override } => {
            web_command(port, socket_override).await
        }
        Command::Daemon { db } => daemon_command(&db, config).await,
        Command::Normalize { repo, tasks_dir } => {
            let repo = match resolve_repo(repo) {
                Ok(repo) => repo,
                Err(code) => return code,
            };
            let tasks_dir = tasks_dir.unwrap_or_else(|| config.tasks_dir.clone());
            match discovery::normalize(&repo, &tasks_dir) {
                Ok(rewritten) => {
                    info!(count = rewritten.len(), "normalize complete");
                    0
                }
                Err(e) => {
                    error!("{}", e);
                    1
                }
            }
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> eyre::Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn resolve_repo(repo: Option<PathBuf>) -> Result<PathBuf, i32> {
    let repo = match repo {
        Some(repo) => repo,
        None => match std::env::current_dir() {
            Ok(cwd) => cwd,
            Err(e) => {
                error!("cannot resolve current directory: {}", e);
                return Err(1);
            }
        },
    };
    if !repo.is_dir() {
        error!("repository path does not exist: {}", repo.display());
        return Err(2);
    }
    Ok(repo)
}

async fn run_command(
    repo: PathBuf,
    feature_branch: String,
    config: Config,
    cli_provider: Option<String>,
    db_path: &std::path::Path,
) -> i32 {
    let storage = match Storage::new(db_path).await {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!("failed to open database: {}", e);
            return 1;
        }
    };
    if let Err(e) = storage.migrate_embedded().await {
        error!("migration failed: {}", e);
        return 1;
    }

    let bus = EventBus::with_defaults();
    // Relay events to the web process when its socket is up; purely optional.
    let sock = socket::socket_path();
    if sock.exists() {
        match bus.forward_to_socket(&sock).await {
            Ok(()) => info!(path = %sock.display(), "relaying events to web socket"),
            Err(e) => info!(error = %e, "web socket not reachable, running without relay"),
        }
    }

    let config = Arc::new(config);
    let run = job::new_run(feature_branch, &repo, &config);
    if let Err(e) = storage.create_run(&run).await {
        error!("{}", e);
        return 1;
    }

    let handle = JobHandle::new(Arc::clone(&storage), bus, Arc::clone(&config))
        .with_cli_provider(cli_provider);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, cancelling run");
            interrupt.cancel();
        }
    });

    match handle.execute(&run, cancel.clone()).await {
        Ok(outcome) if outcome.success => 0,
        Ok(outcome) => {
            if cancel.is_cancelled() {
                EXIT_INTERRUPTED
            } else {
                error!(
                    failed = outcome.failed_units.len(),
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "run failed"
                );
                1
            }
        }
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}

async fn web_command(port: u16, socket_override: Option<PathBuf>) -> i32 {
    let live = state::shared();
    let hub = Arc::new(SseHub::default());
    let cancel = CancellationToken::new();

    let path = socket_override.unwrap_or_else(socket::socket_path);
    let ingress = match socket::SocketIngress::bind(path) {
        Ok(ingress) => ingress,
        Err(e) => {
            error!("failed to bind socket: {}", e);
            return 1;
        }
    };
    let ingress_task = tokio::spawn(ingress.run(
        Arc::clone(&live),
        Arc::clone(&hub),
        cancel.clone(),
    ));

    let app_state = server::AppState { live, hub };
    tokio::select! {
        result = server::start_server(app_state, port) => {
            if let Err(e) = result {
                error!("http server error: {}", e);
                cancel.cancel();
                let _ = ingress_task.await;
                return 1;
            }
            0
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down web");
            cancel.cancel();
            let _ = ingress_task.await;
            EXIT_INTERRUPTED
        }
    }
}

async fn daemon_command(db_path: &std::path::Path, config: Config) -> i32 {
    let storage = match Storage::new(db_path).await {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!("failed to open database: {}", e);
            return 1;
        }
    };
    if let Err(e) = storage.migrate_embedded().await {
        error!("migration failed: {}", e);
        return 1;
    }

    let bus = EventBus::with_defaults();
    let mut daemon = Daemon::new(storage, bus, Arc::new(config));

    match daemon.resume_incomplete().await {
        Ok(resumed) => info!(count = resumed.len(), "resume assessment complete"),
        Err(e) => {
            error!("resume failed: {}", e);
            return 1;
        }
    }

    loop {
        tokio::select! {
            finished = daemon.next_finished() => {
                match finished {
                    Some((run_id, outcome)) => {
                        info!(run_id = %run_id, success = outcome.map(|o| o.success).unwrap_or(false), "job finished");
                    }
                    None => {
                        info!("no active jobs remaining");
                        return 0;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, draining jobs");
                daemon.shutdown().await;
                return EXIT_INTERRUPTED;
            }
        }
    }
}
