//! The Coordinator binary: loads `Config`, builds the application's input
//! source, starts the tarpc RPC server and the axum monitor, and blocks
//! until every reducer index has produced its final merged file.
//!
//! Generalizes the teacher's `src/bin/mrcoordinator.rs` RPC-server bootstrap
//! (same `tarpc::serde_transport::tcp::listen` + `BaseChannel` pattern) to
//! the Config-driven startup of `examples/original_source/src/server.py`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use tarpc::server::{BaseChannel, Channel};
use tarpc::tokio_serde::formats::Json;
use tracing::info;

use pomegranate::mr::blobstore::NullBlobStore;
use pomegranate::mr::config::Config;
use pomegranate::mr::coordinator::{Coordinator, CoordinatorService, ConnectionCoordinator};
use pomegranate::mr::work_queue::{DirectoryInputSource, InputSource, WorkQueue};

#[derive(Parser, Debug)]
#[command(about = "MapReduce coordinator")]
struct Args {
    /// Path to the JSON configuration file (spec.md §6's recognized keys).
    #[arg(long, default_value = "config.json")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Arc::new(Config::load(&args.config)?);

    let input_source = DirectoryInputSource {
        dir: std::path::PathBuf::from(&config.datadir),
        prefix: config.input_prefix.clone(),
    };
    let work_queue = WorkQueue::new(Box::new(input_source).inputs());

    let blob_store = Arc::new(NullBlobStore);
    let coordinator = Coordinator::new(config.clone(), blob_store, work_queue);

    // The log-ring layer needs the Coordinator to exist first so both it and
    // `/status` read from the same ring; this pushes the subscriber's `init`
    // past config load, which logs nothing of its own.
    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("pomegranate=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .with(pomegranate::mr::status::LogRingLayer::new(coordinator.log_ring()))
        .init();

    info!(
        num_mapper = config.num_mapper,
        num_reducer = config.num_reducer,
        "coordinator configuration loaded"
    );

    let server_address: SocketAddr = format!("{}:{}", config.master_host, config.master_port).parse()?;
    let mut listener = tarpc::serde_transport::tcp::listen(server_address, Json::default).await?;

    info!(%server_address, "rpc server listening");

    let rpc_coordinator = coordinator.clone();
    tokio::spawn(async move {
        while let Some(transport) = listener.next().await {
            let Ok(transport) = transport else { continue };
            let channel = BaseChannel::with_defaults(transport);
            let connection = ConnectionCoordinator::new(rpc_coordinator.clone());

            // Each accepted socket gets its own request-handling loop; when
            // it ends (the Master's connection dropped) the nick that
            // registered on it, if any, is recycled immediately rather than
            // waiting for a heartbeat to merely warn about it.
            tokio::spawn(async move {
                channel
                    .execute(connection.clone().serve())
                    .for_each(|fut| async move {
                        tokio::spawn(fut);
                    })
                    .await;
                connection.on_closed().await;
            });
        }
    });

    let heartbeat_coordinator = coordinator.clone();
    tokio::spawn(
        heartbeat_coordinator
            .run_heartbeat(Duration::from_secs(config.ping_interval), config.ping_max),
    );

    let monitor_router = pomegranate::mr::monitor::router(coordinator.clone());
    let monitor_addr: SocketAddr = "0.0.0.0:8080".parse()?;
    tokio::spawn(async move {
        axum::Server::bind(&monitor_addr)
            .serve(monitor_router.into_make_service())
            .await
            .expect("monitor server crashed");
    });
    info!(%monitor_addr, "monitor dashboard listening");

    while !coordinator.is_done().await {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    info!("merge phase complete, every reducer index has produced its final file");
    Ok(())
}
