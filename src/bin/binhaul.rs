//! binhaul server entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use binhaul::fleet::config::Config;
use binhaul::fleet::context::ServiceContext;
use binhaul::fleet::{recommendations, snap_cache};
use binhaul::web::{auth, server, ws};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> binhaul::fleet::errors::Result<()> {
    let hub = ws::spawn_hub();
    let ctx = Arc::new(ServiceContext::new(config, hub)?);

    auth::seed_admin(&ctx)?;

    snap_cache::spawn_sweeper(Arc::clone(&ctx.snap_cache));
    recommendations::spawn_sweeper(Arc::clone(&ctx));

    server::run(ctx).await
}
