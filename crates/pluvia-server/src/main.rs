//! Pluvia Academy HTTP server.
//!
//! Configuration is environment-driven:
//! - `PLUVIA_HTTP_BIND`: listen address (default `127.0.0.1:8080`)
//! - `PLUVIA_DB_PATH`: SQLite file path (default: per-user data dir)
//! - `RUST_LOG`: tracing filter (default `info`)

mod error;
mod routes;

use std::sync::{Arc, Mutex};

use pluvia_core::AcademyDb;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let db = match std::env::var("PLUVIA_DB_PATH") {
        Ok(path) => AcademyDb::open(&path)?,
        Err(_) => AcademyDb::open_default()?,
    };
    let state: routes::SharedDb = Arc::new(Mutex::new(db));

    let bind = std::env::var("PLUVIA_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "pluvia server listening");

    axum::serve(listener, routes::router(state)).await?;
    Ok(())
}
