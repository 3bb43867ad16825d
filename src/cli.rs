//! Operator commands for a Postgres-backed queue.
//!
//! Applications embed [`Cli`] in a small binary that registers their job
//! types:
//!
//! ```no_run
//! use clap::Parser;
//! use delayed_job::cli::Cli;
//! # use delayed_job::BackgroundJob;
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct SendEmail;
//! # impl BackgroundJob for SendEmail {
//! #     const JOB_NAME: &'static str = "send_email";
//! #     type Context = ();
//! #     async fn run(&self, _ctx: ()) -> anyhow::Result<()> { Ok(()) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Cli::parse()
//!         .execute((), |runner| runner.register_job_type::<SendEmail>())
//!         .await
//! }
//! ```

use crate::runner::{Configured, RunHandle, Runner};
use crate::storage::{PgStorage, PriorityRange, setup_database};
use crate::store::JobStore;
use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Manage the `delayed_jobs` queue.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Command to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available operator commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Delete every job in the queue
    Clear,
    /// Run workers until interrupted with Ctrl-C
    Work(WorkArgs),
}

/// Options of the `work` command.
#[derive(Debug, Args)]
pub struct WorkArgs {
    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Only run jobs with at least this priority
    #[arg(long, allow_negative_numbers = true)]
    pub min_priority: Option<i32>,

    /// Only run jobs with a priority below this one
    #[arg(long, allow_negative_numbers = true)]
    pub max_priority: Option<i32>,

    /// Number of workers to start
    #[arg(short, long, default_value_t = 1)]
    pub workers: usize,
}

impl Cli {
    /// Run the parsed command.
    ///
    /// `register` adds the application's job types to the runner used by
    /// the `work` command.
    pub async fn execute<Context, F>(self, context: Context, register: F) -> anyhow::Result<()>
    where
        Context: Clone + Send + Sync + 'static,
        F: FnOnce(Runner<PgStorage, Context>) -> Runner<PgStorage, Context, Configured>,
    {
        let quiet = matches!(&self.command, Command::Work(args) if args.quiet);
        init_tracing(if quiet { "warn" } else { "info" });

        let storage = PgStorage::connect(&self.database_url).await?;
        setup_database(storage.pool()).await?;

        match self.command {
            Command::Clear => {
                let removed = JobStore::new(storage).delete_all().await?;
                info!("Deleted {removed} jobs");
            }
            Command::Work(args) => {
                let runner = register(Runner::new(storage, context))
                    .num_workers(args.workers)
                    .priority_range(PriorityRange::new(args.min_priority, args.max_priority));

                supervise(runner.start(), tokio::signal::ctrl_c()).await?;
            }
        }

        Ok(())
    }
}

/// Keep the workers running until `interrupt` resolves.
///
/// Workers of the `work` command only stop on their own after repeated
/// store failures. Once all of them have, this returns an error instead of
/// idling without workers.
async fn supervise<F>(mut handle: RunHandle, interrupt: F) -> anyhow::Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    let failed = tokio::select! {
        result = interrupt => {
            result?;
            None
        }
        failed = handle.join() => Some(failed),
    };

    match failed {
        None => {
            info!("Received Ctrl-C. Waiting for running jobs to finish…");
            handle.shutdown();
            handle.wait_for_shutdown().await;
            Ok(())
        }
        Some(0) => Ok(()),
        Some(failed) => bail!("{failed} workers stopped after store failures"),
    }
}

/// Install a compact `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_directive`. Calling this more
/// than once is a no-op.
pub fn init_tracing(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .try_init();
}
