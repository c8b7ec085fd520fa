//! Webhook server: turns GitHub and GitLab review/CI deliveries into quality
//! events on the outbox issue store.

mod error;
mod routes;
mod signature;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use outbox::io::config::load_profile;
use outbox::io::store::SqliteStore;
use outbox::logging;
use tracing::{info, warn};

use crate::state::{AppState, Secrets};

#[derive(Parser)]
#[command(name = "outbox-webhook")]
#[command(about = "Receive review and CI webhooks as outbox quality events")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "8787")]
    port: u16,

    /// Issue store database
    #[arg(long, default_value = ".outbox/outbox.db")]
    db: PathBuf,

    /// Workflow profile carrying the `[webhook]` secret names
    #[arg(long, default_value = "workflow.toml")]
    workflow: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("outbox_webhook=info");

    let args = Args::parse();

    let profile = load_profile(&args.workflow)?;
    let secrets = Secrets::from_config(&profile.webhook);
    if secrets.github.is_none() {
        warn!("no GitHub secret configured, signatures are not checked");
    }
    if secrets.gitlab.is_none() {
        warn!("no GitLab token configured, tokens are not checked");
    }
    let store = SqliteStore::open(&args.db)?;
    info!(db = %args.db.display(), "starting outbox-webhook");

    let app = routes::router(AppState::new(store, secrets));

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("parse bind address")?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
