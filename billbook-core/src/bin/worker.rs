use std::sync::Arc;

use billbook_core::clock::SystemClock;
use billbook_core::config::Config;
use billbook_core::db;
use billbook_core::invoices::InvoiceStore;
use billbook_core::worker::JobScheduler;
use dotenv::dotenv;
use tokio::signal;
use tracing::info;

/// Worker binary entry point for the overdue sweep.
///
/// Periodically moves sent invoices whose due date has passed to `overdue`,
/// for every owner. Run it next to the server against the same database.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    billbook_core::init_tracing();

    info!("Starting Billbook overdue worker...");

    let config = Config::from_env()?;
    let store = db::open_store(&config).await?;
    let invoices = InvoiceStore::new(store, Arc::new(SystemClock));

    let scheduler = Arc::new(JobScheduler::new(invoices, config.worker_poll_interval));
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.start().await })
    };

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    scheduler.stop();
    scheduler_handle.await?;

    info!("Billbook overdue worker stopped");
    Ok(())
}
