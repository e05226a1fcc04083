/// crmflow server entry point
///
/// Loads configuration from `CRMFLOW_*` environment variables and serves:
/// - Template, instance and approval APIs at /workflows/*
/// - Drip sequence APIs at /drip/*
/// - Trigger intake and manual tick at /internal/*
/// - Health check at /healthz

use crmflow::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
