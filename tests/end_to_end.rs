//! Full-stack integration tests driving a real tarpc Coordinator over a
//! loopback socket against one in-process Master/worker-pool, covering the
//! literal scenarios of spec.md §8.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tarpc::server::{BaseChannel, Channel};
use tarpc::tokio_serde::formats::Json;

use pomegranate::mr::blobstore::NullBlobStore;
use pomegranate::mr::config::Config;
use pomegranate::mr::coordinator::{Coordinator, ConnectionCoordinator, CoordinatorService, CoordinatorServiceClient};
use pomegranate::mr::function::{WordCountMapper, WordCountReducer};
use pomegranate::mr::master::Master;
use pomegranate::mr::message::{RegistrationReply, WorkReply};
use pomegranate::mr::work_queue::WorkQueue;

fn test_config(datadir: &std::path::Path, num_reducer: usize, threshold_nfile: usize) -> Arc<Config> {
    Arc::new(Config {
        machine_file: None,
        num_mapper: 1,
        num_reducer,
        threshold_nfile,
        threshold_size: 0,
        sleep_interval: 0.05,
        master_url: "http://127.0.0.1:0".into(),
        master_host: "127.0.0.1".into(),
        master_port: 0,
        input_module: None,
        map_module: None,
        reduce_module: None,
        map_executable: None,
        reduce_executable: None,
        datadir: datadir.to_string_lossy().into_owned(),
        input_prefix: "input".into(),
        output_prefix: "output".into(),
        dfs_enabled: false,
        dfs_conf: None,
        ping_max: 5,
        ping_interval: 60,
    })
}

/// Mirrors `mrcoordinator`'s accept loop: one `ConnectionCoordinator` per
/// socket, so a dropped connection recycles whatever nick it registered
/// rather than only ever being observable as a heartbeat warning.
async fn spawn_coordinator(
    config: Arc<Config>,
    work_queue: WorkQueue,
) -> anyhow::Result<(Coordinator, SocketAddr)> {
    let coordinator = Coordinator::new(config, Arc::new(NullBlobStore), work_queue);

    let mut listener = tarpc::serde_transport::tcp::listen("127.0.0.1:0", Json::default).await?;
    let addr = listener.local_addr();

    let serving = coordinator.clone();
    tokio::spawn(async move {
        while let Some(transport) = listener.next().await {
            let Ok(transport) = transport else { continue };
            let channel = BaseChannel::with_defaults(transport);
            let connection = ConnectionCoordinator::new(serving.clone());
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

    Ok((coordinator, addr))
}

async fn connect(addr: SocketAddr) -> anyhow::Result<CoordinatorServiceClient> {
    let transport = tarpc::serde_transport::tcp::connect(addr, Json::default).await?;
    Ok(CoordinatorServiceClient::new(tarpc::client::Config::default(), transport).spawn())
}

/// spec.md §8 scenario 1: one master, one worker, one reducer,
/// threshold-nfile=1. Expect a single final file on disk.
#[tokio::test]
async fn single_master_single_reducer_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("a.zip"), "alpha beta alpha").await.unwrap();
    tokio::fs::write(dir.path().join("b.zip"), "beta gamma beta").await.unwrap();

    let work_queue = WorkQueue::new(
        vec![("a.zip".to_string(), 0), ("b.zip".to_string(), 1)].into_iter().map(|(name, id)| {
            (dir.path().join(name).to_string_lossy().into_owned(), id)
        }),
    );

    let config = test_config(dir.path(), 1, 1);
    let (coordinator, addr) = spawn_coordinator(config.clone(), work_queue).await.unwrap();

    let client = connect(addr).await.unwrap();
    let master = Master::register(config.clone(), client, "alice".to_string()).await.unwrap();

    master.run(1, Arc::new(WordCountMapper), Arc::new(WordCountReducer)).await.unwrap();

    assert!(coordinator.is_done().await);

    let output_dir = config.output_path();
    let mut entries = tokio::fs::read_dir(&output_dir).await.unwrap();
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        files.push(entry.file_name().to_string_lossy().into_owned());
    }
    assert_eq!(files.len(), 1, "expected exactly one merged output file, found {files:?}");
    assert!(files[0].starts_with("output-r000000-p"));
}

/// spec.md §8 scenario 4: a nick collision causes a `change-nick` reply,
/// and the Master retries registration under a fresh name rather than
/// overwriting the existing entry.
#[tokio::test]
async fn nick_collision_reregisters_under_a_new_name() {
    let dir = tempfile::tempdir().unwrap();
    let work_queue = WorkQueue::new(std::iter::empty());
    let config = test_config(dir.path(), 1, 1);
    let (_coordinator, addr) = spawn_coordinator(config.clone(), work_queue).await.unwrap();

    let client_a = connect(addr).await.unwrap();
    let reply_a = client_a.clone().register(tarpc::context::current(), "bob".to_string()).await.unwrap();
    assert!(matches!(reply_a, RegistrationReply::Registered { .. }));

    // A raw second registration under the same nick, issued immediately,
    // must be refused rather than silently clobbering "bob"'s record.
    let reply_b = client_a.clone().register(tarpc::context::current(), "bob".to_string()).await.unwrap();
    assert!(matches!(reply_b, RegistrationReply::ChangeNick));

    // Master::register follows that protocol and lands on a distinct nick.
    let client_c = connect(addr).await.unwrap();
    let _master = Master::register(config.clone(), client_c, "bob".to_string()).await.unwrap();
}

/// spec.md §8 scenario 2: a master's socket drops after it has acked the
/// first of two map payloads. The second payload must be recycled onto a
/// freshly registered master via the real tarpc connection-close path (not
/// a direct `on_connection_closed` call), exercising the accept loop's
/// disconnect wiring end to end.
#[tokio::test]
async fn disconnected_master_connection_recycles_its_unacked_map() {
    let dir = tempfile::tempdir().unwrap();
    let work_queue =
        WorkQueue::new(vec![("a.zip".to_string(), 0), ("b.zip".to_string(), 1)].into_iter());
    let config = test_config(dir.path(), 1, 1);
    let (coordinator, addr) = spawn_coordinator(config.clone(), work_queue).await.unwrap();

    let client = connect(addr).await.unwrap();
    let reply = client.clone().register(tarpc::context::current(), "doomed".to_string()).await.unwrap();
    assert!(matches!(reply, RegistrationReply::Registered { .. }));

    // Pull both map payloads onto this one master: ack the first, leave the
    // second in flight so it is still in `pending_maps` when the socket
    // drops.
    let first = client.clone().work_request(tarpc::context::current(), "doomed".to_string()).await.unwrap();
    let first_tag = match first {
        WorkReply::ComputeMap { tag, .. } => tag,
        other => panic!("unexpected reply: {other:?}"),
    };
    let second = client.clone().work_request(tarpc::context::current(), "doomed".to_string()).await.unwrap();
    assert!(matches!(second, WorkReply::ComputeMap { .. }), "expected the second input, got {second:?}");

    client
        .clone()
        .map_ack(
            tarpc::context::current(),
            "doomed".to_string(),
            first_tag,
            vec![],
            Default::default(),
        )
        .await
        .unwrap()
        .unwrap();

    // The second map payload is still unacked; dropping the connection
    // must push it back onto the dead list rather than losing it.
    drop(client);

    let savior = connect(addr).await.unwrap();
    savior.clone().register(tarpc::context::current(), "savior".to_string()).await.unwrap();

    // Give the server's accept loop a moment to observe the closed socket
    // and run the eviction path before the recycled work shows up.
    let mut recovered = None;
    for _ in 0..50 {
        let work = savior.clone().work_request(tarpc::context::current(), "savior".to_string()).await.unwrap();
        if matches!(work, WorkReply::ComputeMap { .. }) {
            recovered = Some(work);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    assert!(
        matches!(recovered, Some(WorkReply::ComputeMap { .. })),
        "expected the orphaned map payload to be recycled to a new master"
    );
    let _ = coordinator;
}
