//! switchboard-cli — operate and smoke-test a Switchboard deployment.
//!
//! Thin wrappers over the store and manager: bootstrap the schema, register
//! agents, submit work, long-poll a queue, and return results, all against
//! the database named by `DATABASE_URL`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use switchboard_core::{
    InvocationManager, ManagerConfig, PgInvocationStore, SyncOutcome,
};
use switchboard_notify::{Notifier, NotifierConfig, PgChannelListener};

#[derive(Debug, Parser)]
#[command(name = "switchboard-cli", version, about = "Switchboard invocation queue CLI")]
struct Cli {
    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the invocation tables if they do not exist
    Init,

    /// Bind an agent name to a queue id (upsert)
    RegisterAgent {
        name: String,
        queue_id: i64,
    },

    /// Insert an invocation and return its id immediately
    Submit {
        /// Target agent name
        agent: String,
        /// Submitting actor identity
        #[arg(long, default_value = "switchboard-cli")]
        caller: String,
        /// Metadata document (non-empty JSON object)
        #[arg(long, default_value = r#"{"source":"switchboard-cli"}"#)]
        metadata: String,
        /// Payload document (JSON)
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Insert an invocation and wait for its result
    SubmitSync {
        agent: String,
        #[arg(long, default_value = "switchboard-cli")]
        caller: String,
        #[arg(long, default_value = r#"{"source":"switchboard-cli"}"#)]
        metadata: String,
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Seconds to wait before giving up (clamped to 60)
        #[arg(long)]
        wait: Option<u64>,
    },

    /// Long-poll the next invocation for a queue and claim it
    Next {
        queue_id: i64,
        /// Claimant identity; defaults to a fresh cli-scoped id
        #[arg(long)]
        claimant: Option<String>,
        #[arg(long)]
        wait: Option<u64>,
    },

    /// Complete a running invocation with a result document
    Complete {
        id: String,
        claimant: String,
        #[arg(long, default_value = "{}")]
        result: String,
    },

    /// Discard a running invocation with an error document
    Fail {
        id: String,
        claimant: String,
        #[arg(long, default_value = "{}")]
        errors: String,
    },

    /// Fetch an invocation by id
    Get {
        id: String,
    },
}

fn parse_json(label: &str, raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{label} is not valid JSON: {raw}"))
}

fn print_row(invocation: &switchboard_core::Invocation) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(invocation)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=info,warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&cli.database_url)
        .await
        .context("failed to connect to the database")?;
    let store = PgInvocationStore::new(pool.clone()).await?;

    match cli.command {
        Command::Init => {
            store.init_schema().await?;
            println!("schema ready in '{}'", store.schema());
        }
        Command::RegisterAgent { name, queue_id } => {
            let agent = store.register_agent(&name, queue_id).await?;
            println!("agent '{}' -> queue {}", agent.name, agent.queue_id);
        }
        Command::Submit {
            agent,
            caller,
            metadata,
            payload,
        } => {
            let metadata = parse_json("metadata", &metadata)?;
            let payload = parse_json("payload", &payload)?;
            let manager = manager_for(pool, store);
            let id = manager
                .insert_invocation(&caller, &agent, &metadata, &payload)
                .await?;
            manager.close().await;
            println!("{id}");
        }
        Command::SubmitSync {
            agent,
            caller,
            metadata,
            payload,
            wait,
        } => {
            let metadata = parse_json("metadata", &metadata)?;
            let payload = parse_json("payload", &payload)?;
            let manager = manager_for(pool, store);
            manager.start().await?;
            let outcome = manager
                .execute_invocation_sync(&caller, &agent, &metadata, &payload, wait)
                .await;
            manager.close().await;
            match outcome? {
                SyncOutcome::Finished(invocation) => print_row(&invocation)?,
                SyncOutcome::TimedOut { invocation_id } => {
                    eprintln!("invocation {invocation_id} still pending after the wait window");
                }
            }
        }
        Command::Next {
            queue_id,
            claimant,
            wait,
        } => {
            let claimant = claimant.unwrap_or_else(|| format!("cli-{}", Uuid::new_v4()));
            let manager = manager_for(pool, store);
            manager.start().await?;
            let claimed = manager.get_next_invocation(&claimant, queue_id, wait).await;
            manager.close().await;
            match claimed? {
                Some(invocation) => print_row(&invocation)?,
                None => eprintln!("no invocation available for queue {queue_id}"),
            }
        }
        Command::Complete {
            id,
            claimant,
            result,
        } => {
            let result = parse_json("result", &result)?;
            let manager = manager_for(pool, store);
            match manager
                .return_invocation_response(&id, &claimant, &result)
                .await?
            {
                Some(invocation) => print_row(&invocation)?,
                None => eprintln!("invocation {id} not found for claimant {claimant}"),
            }
            manager.close().await;
        }
        Command::Fail {
            id,
            claimant,
            errors,
        } => {
            let errors = parse_json("errors", &errors)?;
            let manager = manager_for(pool, store);
            match manager
                .return_invocation_error(&id, &claimant, &errors)
                .await?
            {
                Some(invocation) => print_row(&invocation)?,
                None => eprintln!("invocation {id} not found for claimant {claimant}"),
            }
            manager.close().await;
        }
        Command::Get { id } => {
            let manager = manager_for(pool, store);
            match manager.get_invocation(&id).await? {
                Some(invocation) => print_row(&invocation)?,
                None => eprintln!("invocation {id} not found"),
            }
            manager.close().await;
        }
    }

    Ok(())
}

fn manager_for(
    pool: sqlx::PgPool,
    store: PgInvocationStore,
) -> InvocationManager<PgInvocationStore> {
    let listener = PgChannelListener::new(pool);
    let notifier = Notifier::new(Box::new(listener), NotifierConfig::default());
    InvocationManager::new(Arc::new(store), notifier, ManagerConfig::default())
}
