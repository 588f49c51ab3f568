// session-context/crates/session-context/src/main.rs

#[cfg(feature = "cli")]
mod cli {
    use anyhow::{Context, Result};
    use clap::{Parser, Subcommand};
    use serde::Serialize;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tracing::info;

    use session_context::checkpoint::{BatchCheckpointOperations, CheckpointMaintenance, CheckpointStorage, SessionLocks};
    use session_context::config::{ContextConfig, MaintenanceConfig};
    use session_context::context_engine::{CharRatioEstimator, TokenBudgetEvaluator};
    use session_context::memory::Message;
    use session_context::memory_db::MemoryDatabase;
    use session_context::telemetry;

    #[derive(Parser)]
    #[command(name = "session-context", version, about = "Inspect and maintain session context storage")]
    struct Cli {
        /// SQLite database file
        #[arg(long, default_value = "data/session-context.db")]
        db: PathBuf,

        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand)]
    enum Command {
        /// Table counts and checkpoint totals
        Stats,
        /// List checkpoints, newest first
        List {
            #[arg(long)]
            session: Option<String>,
        },
        /// Trim one session's checkpoints
        Cleanup {
            #[arg(long)]
            session: String,
            #[arg(long)]
            keep: usize,
            #[arg(long)]
            older_than_days: Option<u32>,
        },
        /// One retention pass over every session using MAINTENANCE_* settings
        Maintain,
        /// Evaluate a JSON array of messages against CONTEXT_* settings
        Evaluate {
            #[arg(long)]
            file: PathBuf,
        },
    }

    fn print_json<T: Serialize>(value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn operations(db: &MemoryDatabase) -> BatchCheckpointOperations {
        BatchCheckpointOperations::new(
            Arc::new(db.checkpoints.clone()),
            SessionLocks::new(),
            Arc::new(CharRatioEstimator::default()),
        )
    }

    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        telemetry::init_observability()?;

        let cli = Cli::parse();

        if let Command::Evaluate { file } = &cli.command {
            let config = ContextConfig::from_env()?;
            let raw = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let messages: Vec<Message> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing messages from {}", file.display()))?;
            let evaluator = TokenBudgetEvaluator::with_default_estimator(config)?;
            return print_json(&evaluator.evaluate(&messages));
        }

        let db = MemoryDatabase::new(&cli.db)?;
        match cli.command {
            Command::Stats => {
                let ops = operations(&db);
                let maintenance = CheckpointMaintenance::new(ops, MaintenanceConfig::default())?;
                let stats = serde_json::json!({
                    "database": db.get_stats()?,
                    "checkpoints": maintenance.get_storage_stats().await?,
                    "embeddings": db.embeddings.get_stats()?,
                });
                print_json(&stats)
            }
            Command::List { session } => {
                let checkpoints = match session {
                    Some(session) => db.checkpoints.list_checkpoints(&session).await?,
                    None => db.checkpoints.list_all_checkpoints().await?,
                };
                print_json(&checkpoints)
            }
            Command::Cleanup {
                session,
                keep,
                older_than_days,
            } => {
                let result = operations(&db)
                    .cleanup_old_checkpoints(&session, keep, older_than_days)
                    .await?;
                info!("Deleted {} of {} candidate checkpoints", result.success.len(), result.total);
                print_json(&result)
            }
            Command::Maintain => {
                let config = MaintenanceConfig::from_env()?;
                let maintenance = CheckpointMaintenance::new(operations(&db), config)?;
                print_json(&maintenance.perform_cleanup().await?)
            }
            Command::Evaluate { .. } => Ok(()),
        }
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
