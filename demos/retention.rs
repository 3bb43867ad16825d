//! Retention example for the delayed_job library.
//!
//! Successful jobs are kept with `completed_at` set and abandoned jobs with
//! `failed_at` set, so the queue doubles as an audit trail.
//!
//! This example uses TestContainers to automatically start a PostgreSQL
//! database, so no manual setup is required. Just run:
//!
//! ```bash
//! cargo run --example retention
//! ```

use anyhow::{Result, bail};
use delayed_job::{BackgroundJob, PgStorage, RetryPolicy, Runner, setup_database};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;

/// Example job that sends an invoice
#[derive(Serialize, Deserialize)]
struct InvoiceJob {
    invoice_id: String,
    amount: f64,
}

impl BackgroundJob for InvoiceJob {
    const JOB_NAME: &'static str = "invoice";
    type Context = ();

    async fn run(&self, _ctx: Self::Context) -> Result<()> {
        println!("Sending invoice {} over {:.2}", self.invoice_id, self.amount);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }

    fn display_name(&self) -> String {
        format!("invoice {}", self.invoice_id)
    }
}

/// Example job that always fails
#[derive(Serialize, Deserialize)]
struct BrokenWebhookJob {
    url: String,
}

impl BackgroundJob for BrokenWebhookJob {
    const JOB_NAME: &'static str = "broken_webhook";
    const PRIORITY: i32 = 10;
    type Context = ();

    async fn run(&self, _ctx: Self::Context) -> Result<()> {
        bail!("{} refused the connection", self.url)
    }
}

/// Set up a PostgreSQL database using TestContainers
async fn start_database() -> Result<(PgStorage, ContainerAsync<Postgres>)> {
    println!("Starting PostgreSQL container...");
    let container = Postgres::default().start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    println!("Connecting to database at {host}:{port}...");
    let storage = PgStorage::connect(&connection_string).await?;

    println!("Running database migrations...");
    setup_database(storage.pool()).await?;

    Ok((storage, container))
}

#[tokio::main]
async fn main() -> Result<()> {
    delayed_job::cli::init_tracing("info");

    let (storage, _container) = start_database().await?;

    let runner = Runner::new(storage, ())
        .register_job_type::<InvoiceJob>()
        .register_job_type::<BrokenWebhookJob>()
        .num_workers(2)
        .poll_interval(Duration::from_millis(100))
        .retry_policy(RetryPolicy::immediate(3))
        .retain_completed_jobs(true)
        .destroy_failed_jobs(false)
        .shutdown_when_queue_empty();

    for (invoice_id, amount) in [("inv_001", 99.99), ("inv_002", 29.99)] {
        let job = InvoiceJob {
            invoice_id: invoice_id.to_string(),
            amount,
        };
        job.enqueue(runner.store()).await?;
    }

    let webhook = BrokenWebhookJob {
        url: "https://example.invalid/hook".to_string(),
    };
    let webhook_id = webhook.enqueue(runner.store()).await?;

    println!("Processing jobs...\n");
    runner.start().wait_for_shutdown().await;

    println!("\nJobs kept in the queue: {}", runner.store().count().await?);
    if let Some(job) = runner.store().find(webhook_id).await? {
        println!(
            "Webhook job: {} attempts, failed at {:?}, last error: {}",
            job.attempts,
            job.failed_at,
            job.last_error.unwrap_or_default()
        );
    }

    println!("\nCleaning up PostgreSQL container...");
    Ok(())
}
