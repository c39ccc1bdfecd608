use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use http::Method;
use log::{info, warn};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use tonic::transport::Server;
use tonic_web::GrpcWebLayer;
use tower_http::cors::{Any, CorsLayer};

use roadwatch::config::EngineConfig;
use roadwatch::engine::Engine;
use roadwatch::io::feeds;
use roadwatch::proto::road_watch_server::RoadWatchServer;
use roadwatch::service::RoadWatchService;
use roadwatch::sweep::PrioritySweep;

#[derive(Parser)]
#[command(name = "roadwatch")]
#[command(about = "Road defect map-matching and maintenance prioritisation", long_about = None)]
struct Cli {
    /// JSON file overriding the default thresholds and weights
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database URL, falls back to DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gRPC server and the periodic priority sweep
    Serve {
        #[arg(short, long, default_value = "[::1]:10000")]
        addr: String,
    },
    /// Load or reload the road network from a JSON file
    LoadNetwork {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Re-match unresolved observations against the new network
        #[arg(long, default_value_t = false)]
        rematch: bool,
    },
    /// Submit a JSON batch of defect observations
    Submit {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Recompute every segment's priority once
    Recompute,
}

async fn connect(url: &str) -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new(url.to_owned());
    options
        .max_connections(20)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    let db = Database::connect(options)
        .await
        .with_context(|| format!("connecting to {}", url))?;
    Migrator::up(&db, None).await.context("running migrations")?;
    Ok(db)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let database_url = match cli.database_url {
        Some(url) => url,
        None => std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?,
    };

    let db = connect(&database_url).await?;
    let sweep_interval = config.sweep.interval_secs;
    let engine = Engine::new(db, config);
    engine.restore_network().await?;

    match cli.command {
        Commands::Serve { addr } => {
            info!("Starting RoadWatch");
            if sweep_interval > 0 {
                tokio::spawn(PrioritySweep::new(engine.clone(), sweep_interval).start());
            } else {
                warn!("Priority sweep disabled");
            }

            let addr: SocketAddr = addr.parse().context("parsing listen address")?;
            let svc = RoadWatchServer::new(RoadWatchService::new(engine));

            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_origin(Any)
                .allow_headers(Any);

            info!("Starting gRPC server at {}", addr);
            Server::builder()
                .accept_http1(true)
                .layer(cors)
                .layer(GrpcWebLayer::new())
                .add_service(svc)
                .serve(addr)
                .await?;
        }
        Commands::LoadNetwork { path, rematch } => {
            let segments = feeds::read_segments(&path)?;
            info!("Read {} segments from {}", segments.len(), path.display());
            engine.load_network(segments).await?;
            if rematch {
                let summary = engine.rematch_unresolved().await?;
                info!(
                    "Re-matched {} observations, {} resolved",
                    summary.examined, summary.resolved
                );
            }
        }
        Commands::Submit { path } => {
            let observations = feeds::read_observations(&path)?;
            info!(
                "Read {} observations from {}",
                observations.len(),
                path.display()
            );
            let outcome = engine.submit_batch(observations).await?;
            for (id, reason) in &outcome.refused {
                warn!("Refused observation {}: {}", id, reason);
            }
        }
        Commands::Recompute => {
            let written = engine.recompute_all().await?;
            info!("Wrote {} priority scores", written);
        }
    }

    Ok(())
}
