use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use fyp_stage_engine::models::{DefenseOutcome, GateKey};
use fyp_stage_engine::store::PgStore;
use fyp_stage_engine::{import, seed, Engine, EngineConfig, EngineError, Principal, Role};

#[derive(Parser)]
#[command(name = "fyp-engine")]
#[command(about = "Final-year project stage engine", long_about = None)]
struct Cli {
    /// Engine policy file (TOML); falls back to FYP_ENGINE_CONFIG, then defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Acting user id
    #[arg(long, global = true, env = "FYP_AS_USER")]
    as_user: Option<Uuid>,
    /// Acting role
    #[arg(long, global = true, env = "FYP_AS_ROLE")]
    as_role: Option<Role>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo data
    Seed,
    /// Import weekly meeting records from a CSV file
    ImportMeetings {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Manage submission gates
    Gate {
        #[command(subcommand)]
        command: GateCommands,
    },
    /// Compile results for every eligible group
    Compile,
    /// Publish compiled results for one group, or all of them
    Publish {
        #[arg(long)]
        group: Option<Uuid>,
    },
    /// Write a markdown status report for a group
    Status {
        #[arg(long)]
        group: Uuid,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Evaluation panels and defense outcomes
    Defense {
        #[command(subcommand)]
        command: DefenseCommands,
    },
}

#[derive(Subcommand)]
enum GateCommands {
    /// Open a gate until the deadline (RFC 3339)
    Unlock {
        #[arg(long)]
        key: GateKey,
        #[arg(long)]
        deadline: DateTime<Utc>,
        #[arg(long, default_value = "")]
        message: String,
    },
    /// Close a gate immediately
    Lock {
        #[arg(long)]
        key: GateKey,
    },
    /// Show every configured gate
    List,
}

#[derive(Subcommand)]
enum DefenseCommands {
    /// Assign internal evaluators and an optional external one
    Allocate {
        #[arg(long)]
        group: Uuid,
        #[arg(long)]
        defense: Uuid,
        #[arg(long = "internal", required = true)]
        internal: Vec<Uuid>,
        #[arg(long)]
        external: Option<Uuid>,
    },
    /// Record the outcome of a concluded defense
    Record {
        #[arg(long)]
        group: Uuid,
        #[arg(long)]
        defense: Uuid,
        #[arg(long)]
        outcome: DefenseOutcome,
        #[arg(long)]
        remarks: Option<String>,
    },
}

impl Cli {
    fn principal(&self) -> Option<Principal> {
        Some(Principal::new(self.as_user?, self.as_role?))
    }
}

/// Acting identity for commands that go through authorization.
fn acting(principal: &Option<Principal>) -> anyhow::Result<&Principal> {
    principal
        .as_ref()
        .context("--as-user and --as-role are required for this command")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::resolve(cli.config.as_deref()).context("failed to load engine config")?;
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let store = PgStore::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let engine = Engine::new(store, config);
    let principal = cli.principal();

    match cli.command {
        Commands::InitDb => {
            engine.store().init_db().await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let summary = seed::seed(&engine).await?;
            println!(
                "Seed data ready (committee created: {}, group created: {}, gate unlocked: {}).",
                summary.committee_created, summary.group_created, summary.gate_unlocked
            );
        }
        Commands::ImportMeetings { csv } => {
            let summary = import::import_meetings(&engine, acting(&principal)?, &csv).await?;
            println!(
                "Inserted {} meetings from {} ({} already on file).",
                summary.inserted,
                csv.display(),
                summary.skipped_duplicates
            );
        }
        Commands::Gate { command } => match command {
            GateCommands::Unlock {
                key,
                deadline,
                message,
            } => {
                let control = engine
                    .unlock_gate(acting(&principal)?, key, deadline, &message)
                    .await?;
                println!("{} open until {}.", control.gate, deadline);
            }
            GateCommands::Lock { key } => {
                engine.lock_gate(acting(&principal)?, key).await?;
                println!("{key} locked.");
            }
            GateCommands::List => {
                let gates = engine.list_gates().await?;
                if gates.is_empty() {
                    println!("No gates configured.");
                    return Ok(());
                }
                for view in gates {
                    let deadline = view
                        .control
                        .deadline
                        .map(|d| d.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!("- {} {:?} (deadline {})", view.gate, view.state, deadline);
                }
            }
        },
        Commands::Compile => {
            let summary = engine.compile(acting(&principal)?).await?;
            println!(
                "Compiled {} groups ({} members); {} already published, {} not eligible.",
                summary.compiled_groups.len(),
                summary.compiled_members,
                summary.skipped_published.len(),
                summary.not_eligible
            );
        }
        Commands::Publish { group } => match group {
            Some(group_id) => {
                engine.publish(acting(&principal)?, group_id).await?;
                println!("Results published for {group_id}.");
            }
            None => match engine.publish_all(acting(&principal)?).await {
                Ok(published) => println!("Results published for {} groups.", published.len()),
                Err(EngineError::NothingToPublish) => println!("Nothing to publish."),
                Err(err) => return Err(err.into()),
            },
        },
        Commands::Status { group, out } => {
            let report = engine.status_report(acting(&principal)?, group).await?;
            match out {
                Some(out) => {
                    std::fs::write(&out, report)?;
                    println!("Report written to {}.", out.display());
                }
                None => print!("{report}"),
            }
        }
        Commands::Defense { command } => match command {
            DefenseCommands::Allocate {
                group,
                defense,
                internal,
                external,
            } => {
                let allocation = engine
                    .allocate_panel(acting(&principal)?, group, defense, internal, external)
                    .await?;
                if allocation.undersized {
                    println!("Panel allocated (fewer internal evaluators than recommended).");
                } else {
                    println!("Panel allocated.");
                }
            }
            DefenseCommands::Record {
                group,
                defense,
                outcome,
                remarks,
            } => {
                let recorded = engine
                    .record_defense_result(acting(&principal)?, group, defense, outcome, remarks)
                    .await?;
                match recorded.status_change {
                    Some(change) => println!(
                        "{} defense {}; group moved from {} to {}.",
                        recorded.defense.kind, outcome, change.from, change.to
                    ),
                    None => println!("{} defense {}.", recorded.defense.kind, outcome),
                }
            }
        },
    }

    Ok(())
}
