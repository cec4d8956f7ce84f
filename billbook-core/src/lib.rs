//! Invoice computation, lifecycle and persistence engine.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod customers;
pub mod db;
pub mod error;
pub mod invoices;
pub mod lifecycle;
pub mod models;
pub mod numbering;
pub mod store;
pub mod sync;
pub mod totals;
pub mod worker;

pub use error::{CoreError, Result};

/// Installs the `tracing` subscriber used by the binaries: fmt output
/// filtered by `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}
