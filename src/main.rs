//! # Ticket Flow CLI (`tflow`)
//!
//! ## Usage
//!
//! ```bash
//! tflow --config ./config/tflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tflow init` | Create the SQLite database and run schema migrations |
//! | `tflow backfill <project>` | Index every ticket in a project |
//! | `tflow sync [project]` | Index tickets modified since the last checkpoint |
//! | `tflow detect "<text>"` | Show likely duplicates for a draft |
//! | `tflow sweep` | Evict expired conversations |
//! | `tflow serve` | Start the HTTP event server |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); command results go to
//! stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use ticket_flow::app::App;
use ticket_flow::config;
use ticket_flow::ingest::IngestionError;
use ticket_flow::migrate;
use ticket_flow::orchestrator::check_duplicates;
use ticket_flow::server;
use ticket_flow_core::index::ScopeFilter;
use ticket_flow_core::models::DegradedReason;

/// Ticket Flow: conversational ticket creation with duplicate detection.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/tflow.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "tflow",
    about = "Ticket Flow: chat-driven ticket creation with duplicate detection",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tflow.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Index every ticket in a project.
    ///
    /// Resumes an interrupted backfill from its last completed page.
    Backfill {
        project: String,

        /// Discard the saved position and start from the first page.
        #[arg(long)]
        restart: bool,
    },

    /// Index tickets modified since the last checkpoint.
    Sync {
        /// Only this project; defaults to every project in `[ingestion].projects`.
        project: Option<String>,

        /// Keep running, syncing every `[ingestion].poll_interval_secs`.
        #[arg(long)]
        watch: bool,
    },

    /// Show likely duplicates for a draft description.
    Detect {
        text: String,

        /// Restrict the search to one project.
        #[arg(long)]
        project: Option<String>,
    },

    /// Evict expired conversations.
    Sweep {
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },

    /// Start the HTTP event server on `[server].bind`.
    Serve,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Backfill { project, restart } => {
            let app = App::open(&cfg).await?;
            let stats = app.pipeline.backfill(&project, restart).await?;
            stats.print(&format!("backfill {}", project));
            println!("ok");
        }
        Commands::Sync { project, watch } => {
            let app = App::open(&cfg).await?;
            let projects = app.projects(project);
            if projects.is_empty() {
                anyhow::bail!("No projects to sync; set [ingestion].projects or name one");
            }
            if watch {
                let interval = Duration::from_secs(cfg.ingestion.poll_interval_secs);
                app.pipeline.watch(&projects, interval).await;
            } else {
                let mut failed = 0;
                for (project, result) in app.pipeline.sync_all(&projects).await {
                    match result {
                        Ok(stats) => stats.print(&format!("sync {}", project)),
                        Err(IngestionError::AlreadyRunning(_)) => {
                            println!("sync {}: already running, skipped", project);
                        }
                        Err(e) => {
                            println!("sync {}: failed: {}", project, e);
                            failed += 1;
                        }
                    }
                }
                if failed > 0 {
                    anyhow::bail!("{} project(s) failed to sync", failed);
                }
                println!("ok");
            }
        }
        Commands::Detect { text, project } => {
            let app = App::open(&cfg).await?;
            let orchestrator = &app.orchestrator;
            let set = check_duplicates(
                orchestrator.detector(),
                &text,
                ScopeFilter { project },
                orchestrator.detection_timeout(),
            )
            .await;
            match set.degraded {
                Some(DegradedReason::Timeout) => println!("detection timed out (degraded)"),
                Some(DegradedReason::Unavailable) => println!("detection unavailable (degraded)"),
                None if set.candidates.is_empty() => println!("No similar tickets found."),
                None => {
                    for c in &set.candidates {
                        println!(
                            "{}. [{:.3}] {}  {}",
                            c.rank,
                            c.score,
                            c.ticket_id,
                            c.title.as_deref().unwrap_or("")
                        );
                    }
                }
            }
        }
        Commands::Sweep { limit } => {
            let app = App::open(&cfg).await?;
            let evicted = app.orchestrator.sweep(limit).await?;
            println!("evicted {} expired conversation(s)", evicted);
        }
        Commands::Serve => {
            let app = App::open(&cfg).await?;
            server::run_server(app).await?;
        }
    }

    Ok(())
}
