//! The Worker-host binary: one per machine, connecting to the Coordinator
//! as a single Master and fanning work out to an in-process pool of
//! workers, per spec.md §4.6/§4.7.
//!
//! Generalizes the teacher's `src/bin/mrworker.rs` connect-then-loop
//! bootstrap to the Config-driven startup of
//! `examples/original_source/src/master.py`.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tarpc::client;
use tarpc::tokio_serde::formats::Json;
use tracing::{error, info};

use pomegranate::mr::config::{count_machine_slots, Config};
use pomegranate::mr::coordinator::CoordinatorServiceClient;
use pomegranate::mr::function::{ExternalMapper, ExternalReducer, Mapper, Reducer, WordCountMapper, WordCountReducer};
use pomegranate::mr::master::Master;

#[derive(Parser, Debug)]
#[command(about = "MapReduce master / worker-pool host")]
struct Args {
    /// Path to the JSON configuration file (spec.md §6's recognized keys).
    #[arg(long, default_value = "config.json")]
    config: String,

    /// Nick this host registers under; defaults to the local hostname.
    #[arg(long)]
    nick: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("pomegranate=info".parse()?))
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::load(&args.config)?);

    let nick = args.nick.unwrap_or_else(|| {
        hostname::get().map(|h| h.to_string_lossy().into_owned()).unwrap_or_else(|_| "master".to_string())
    });

    let num_workers = match &config.machine_file {
        Some(path) => count_machine_slots(path)?,
        None => config.num_mapper.max(1),
    };

    let server_address: SocketAddr = format!("{}:{}", config.master_host, config.master_port).parse()?;
    let transport = match tarpc::serde_transport::tcp::connect(server_address, Json::default).await {
        Ok(transport) => transport,
        Err(err) => {
            error!(%server_address, error = %err, "failed to connect to coordinator");
            return Ok(());
        }
    };

    let client = CoordinatorServiceClient::new(client::Config::default(), transport).spawn();

    let master = Master::register(config.clone(), client, nick).await?;

    let mapper: Arc<dyn Mapper> = match &config.map_executable {
        Some(path) => Arc::new(ExternalMapper { executable: path.into() }),
        None => Arc::new(WordCountMapper),
    };
    let reducer: Arc<dyn Reducer> = match &config.reduce_executable {
        Some(path) => Arc::new(ExternalReducer { executable: path.into() }),
        None => Arc::new(WordCountReducer),
    };

    info!(num_workers, "starting worker pool");
    master.run(num_workers, mapper, reducer).await?;

    Ok(())
}
