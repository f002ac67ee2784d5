#![doc = include_str!("../README.md")]

use std::{fs, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::info;
use tokio::net::TcpListener;

use partfield_portal::config::load_config;
use partfield_portal::server::{api_routes, AppState};

// CLI
#[derive(Parser, Debug)]
#[command(name = "PartField segmentation portal")]
#[command(version = "1.0")]
#[command(about = "Web front end for running the PartField 3D part-segmentation \
                   pipeline: upload a mesh or point cloud, get per-part-count \
                   segmentations back.",
          long_about = None
)]
struct Cli {
    /// Server port
    #[arg(short, long, default_value_t = 7860)]
    port: u16,

    /// Listen on all interfaces instead of loopback
    #[arg(long, action)]
    share: bool,

    /// Directory for job storage
    #[arg(short, long, default_value = "/workspace/jobs")]
    jobs_dir: PathBuf,

    /// Optional toml file overriding pipeline paths and tuning
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();
    let cli = Cli::parse();
    info!("<-> PartField segmentation portal <->");

    let config = load_config(cli.config.as_deref())
        .context("Failed to load the pipeline config")?;
    info!("PartField checkout: `{}`", config.partfield_dir.display());

    fs::create_dir_all(&cli.jobs_dir).with_context(|| {
        format!("Failed to create the jobs dir `{}`", cli.jobs_dir.display())
    })?;
    info!("Jobs dir: `{}`", cli.jobs_dir.display());

    let state = Arc::new(AppState::new(config, cli.jobs_dir));
    let app = api_routes().with_state(state);

    let host = if cli.share { [0, 0, 0, 0] } else { [127, 0, 0, 1] };
    let addr = SocketAddr::from((host, cli.port));
    info!("Listening on `{addr}`");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
