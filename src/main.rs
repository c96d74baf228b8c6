//! proctor-stream - watch live exam sessions from the proctor side.
//!
//! Usage:
//!   proctor-stream --base-url https://exams.example.org --token key:secret \
//!       --session SUB-0001 --session SUB-0002 [--config proctor.toml] [--port 8090]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use proctor_stream::api::{init_tracing, ProctorDashboard};
use proctor_stream::config::CoordinatorConfig;

#[derive(Parser, Debug)]
#[command(name = "proctor-stream")]
#[command(about = "Live proctoring session coordinator")]
struct Args {
    /// TOML config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Exam server origin
    #[arg(long)]
    base_url: Option<String>,

    /// API token as key:secret
    #[arg(long, env = "PROCTOR_TOKEN")]
    token: Option<String>,

    /// Session (exam submission) id to watch; repeatable
    #[arg(long = "session")]
    sessions: Vec<String>,

    /// Dashboard port on 127.0.0.1 (0 = any free port)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::load(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }
    if args.token.is_some() {
        config.auth_token = args.token;
    }
    if let Some(port) = args.port {
        config.dashboard_port = port;
    }

    let dashboard = ProctorDashboard::start(config, &args.sessions).await?;
    println!("dashboard: {}/sessions", dashboard.base_url());

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    dashboard.shutdown().await;
    Ok(())
}
