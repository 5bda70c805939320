//! The Master: a Coordinator client and local dispatcher over a worker
//! pool, per spec.md §4.6. Grounded in `examples/original_source/src/master.py`
//! (`Master.__main_loop`, `__assign_work`, `_check_threshold`, the
//! `units_to_kill` degree-change handling) and in the teacher's
//! `src/bin/mrworker.rs` loop for the request/dispatch shape, generalized
//! from a single worker process to an in-process pool of tokio tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tarpc::context;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::mr::config::Config;
use crate::mr::coordinator::CoordinatorServiceClient;
use crate::mr::function::{FileIdAllocator, Mapper, Reducer};
use crate::mr::message::{
    Bucket, FileId, KeepAliveRequest, Nick, ReducerIndex, RegistrationReply, WorkItem, WorkReply,
    WorkerCommand, WorkerEvent,
};
use crate::mr::status::MasterStatusSnapshot;
use crate::mr::worker::Worker;

/// Counters maintained purely for keep-alive reporting; kept behind its own
/// lock so updating them never competes with the local-reduce/kill-state
/// dispatch decisions (spec.md §5's no-lock-nesting rule).
#[derive(Default)]
struct LocalStats {
    map_ongoing: u64,
    map_finished: u64,
    reduce_ongoing: u64,
    reduce_finished: u64,
    map_file: u64,
    map_file_size: u64,
    reduce_file: u64,
    reduce_file_size: u64,
    bandwidth: u64,
    started: Option<Instant>,
}

impl LocalStats {
    fn snapshot(&self, nproc: u32) -> MasterStatusSnapshot {
        MasterStatusSnapshot {
            nproc,
            map_finished: self.map_finished,
            map_ongoing: self.map_ongoing,
            reduce_finished: self.reduce_finished,
            reduce_ongoing: self.reduce_ongoing,
            map_file: self.map_file,
            map_file_size: self.map_file_size,
            reduce_file: self.reduce_file,
            reduce_file_size: self.reduce_file_size,
            bandwidth: self.bandwidth,
            time: self.started.map(|t| t.elapsed()).unwrap_or_default(),
        }
    }
}

/// Queue/kill-state: how many idle workers should be told to quit the next
/// time they report `Available`, decided by `degree_change` piggy-backed on
/// a keep-alive reply.
struct KillState {
    pending_kill: i32,
}

/// spec.md §4.6's `reducingFiles` mirror and `_check_threshold`: a purely
/// Master-local view of which intermediate files are waiting to be reduced
/// for each reducer index, plus any cross-master merge work handed back by
/// the Coordinator via `ReduceRecovery` and not yet given to a worker.
struct LocalReduceState {
    reducing_files: Vec<Bucket>,
    reduce_in_flight: Vec<bool>,
    merge_pending: VecDeque<(ReducerIndex, Vec<FileId>)>,
}

impl LocalReduceState {
    fn new(num_reducer: usize) -> Self {
        Self {
            reducing_files: vec![Vec::new(); num_reducer],
            reduce_in_flight: vec![false; num_reducer],
            merge_pending: VecDeque::new(),
        }
    }

    /// spec.md §4.6's `_check_threshold`: during normal operation a bucket
    /// must reach `threshold_nfile` entries before it is worth reducing;
    /// once end-of-stream has been seen the threshold relaxes to "more
    /// than one", since no more map output will ever arrive to pad it out.
    fn next_local_reduce(&mut self, threshold_nfile: usize, relaxed: bool) -> Option<(ReducerIndex, Vec<FileId>)> {
        if let Some(pending) = self.merge_pending.pop_front() {
            return Some(pending);
        }

        let threshold = if relaxed { 2 } else { threshold_nfile.max(2) };
        for (reducer_index, (bucket, in_flight)) in
            self.reducing_files.iter_mut().zip(self.reduce_in_flight.iter_mut()).enumerate()
        {
            if !*in_flight && bucket.len() >= threshold {
                *in_flight = true;
                let file_ids = bucket.iter().map(|(id, _)| *id).collect();
                bucket.clear();
                return Some((reducer_index, file_ids));
            }
        }
        None
    }
}

pub struct Master {
    config: Arc<Config>,
    client: CoordinatorServiceClient,
    nick: Nick,
    unique_id: u64,
}

impl Master {
    pub async fn register(
        config: Arc<Config>,
        client: CoordinatorServiceClient,
        preferred_nick: String,
    ) -> anyhow::Result<Self> {
        let mut nick = preferred_nick;
        loop {
            match client.clone().register(context::current(), nick.clone()).await? {
                RegistrationReply::Registered { unique_id } => {
                    info!(nick, unique_id, "registered with coordinator");
                    return Ok(Self { config, client, nick, unique_id });
                }
                RegistrationReply::ChangeNick => {
                    nick = format!("{nick}-{}", rand_suffix());
                    warn!(nick, "nick collision, retrying with a new nick");
                }
            }
        }
    }

    /// Runs the worker pool to completion: every worker has been told
    /// `PlzDie` or killed off by a degree-change, and has exited.
    pub async fn run(
        self,
        num_workers: usize,
        mapper: Arc<dyn Mapper>,
        reducer: Arc<dyn Reducer>,
    ) -> anyhow::Result<()> {
        let output_dir = self.config.output_path();
        tokio::fs::create_dir_all(&output_dir).await.ok();

        let file_ids = Arc::new(FileIdAllocator::new(self.unique_id, 0));
        let (events_tx, mut events_rx) = mpsc::channel::<WorkerEvent>(num_workers * 4);

        let mut command_txs = HashMap::new();
        let mut join_handles = Vec::new();

        for id in 0..num_workers {
            let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerCommand>(1);
            command_txs.insert(id, cmd_tx);

            let worker = Worker::new(id);
            let events_tx = events_tx.clone();
            let mapper = mapper.clone();
            let reducer = reducer.clone();
            let output_dir = output_dir.clone();
            let num_reducer = self.config.num_reducer;
            let file_ids = file_ids.clone();

            join_handles.push(tokio::spawn(async move {
                worker.run(cmd_rx, events_tx, mapper, reducer, output_dir, num_reducer, file_ids).await;
            }));
        }

        let active_workers = Arc::new(Mutex::new(num_workers));
        let kill_state = Arc::new(Mutex::new(KillState { pending_kill: 0 }));
        let stats = Arc::new(Mutex::new(LocalStats { started: Some(Instant::now()), ..Default::default() }));
        let local_reduce = Arc::new(Mutex::new(LocalReduceState::new(self.config.num_reducer)));
        let request_pump = Arc::new(Semaphore::new(num_workers));
        let eos_received = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut ping_ticker = tokio::time::interval(Duration::from_secs(self.config.ping_interval));

        loop {
            if *active_workers.lock().await == 0 {
                break;
            }

            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(
                        event,
                        &command_txs,
                        &active_workers,
                        &kill_state,
                        &stats,
                        &local_reduce,
                        &request_pump,
                        &eos_received,
                    ).await;
                }
                _ = ping_ticker.tick() => {
                    self.send_keep_alive(&stats, &kill_state, num_workers as u32).await;
                }
            }
        }

        for handle in join_handles {
            let _ = handle.await;
        }

        info!(nick = %self.nick, "master finished, all workers exited");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_event(
        &self,
        event: WorkerEvent,
        command_txs: &HashMap<usize, mpsc::Sender<WorkerCommand>>,
        active_workers: &Arc<Mutex<usize>>,
        kill_state: &Arc<Mutex<KillState>>,
        stats: &Arc<Mutex<LocalStats>>,
        local_reduce: &Arc<Mutex<LocalReduceState>>,
        request_pump: &Arc<Semaphore>,
        eos_received: &Arc<std::sync::atomic::AtomicBool>,
    ) {
        match event {
            WorkerEvent::Available(id) => {
                let mut kill = kill_state.lock().await;
                if kill.pending_kill > 0 {
                    kill.pending_kill -= 1;
                    drop(kill);
                    let new_total = {
                        let mut workers = active_workers.lock().await;
                        *workers -= 1;
                        *workers as u32
                    };
                    if let Some(tx) = command_txs.get(&id) {
                        let _ = tx.send(WorkerCommand::Quit).await;
                    }

                    let client = self.client.clone();
                    let nick = self.nick.clone();
                    tokio::spawn(async move {
                        if let Err(err) =
                            client.clone().change_degree_ack(context::current(), nick, new_total).await
                        {
                            error!(error = %err, "change_degree_ack RPC failed");
                        }
                    });
                    return;
                }
                drop(kill);

                // spec.md §4.6's decision order: a worker always asks the
                // Coordinator for fresh map/merge work first, so a generator
                // with more inputs keeps every worker mapping. Local reduces
                // are only opportunistic, dispatched when the Coordinator
                // has nothing else for us right now (`try-later`) or has
                // told us the map phase is over (`end-of-stream`).
                let client = self.client.clone();
                let nick = self.nick.clone();
                let sleep_interval = self.config.sleep_interval;
                let threshold_nfile = self.config.threshold_nfile;
                let tx = command_txs.get(&id).cloned();
                let active_workers = active_workers.clone();
                let stats = stats.clone();
                let local_reduce = local_reduce.clone();
                let eos_received = eos_received.clone();
                let permit = request_pump.clone();

                tokio::spawn(async move {
                    let Ok(_permit) = permit.acquire_owned().await else { return };
                    loop {
                        let reply = client.clone().work_request(context::current(), nick.clone()).await;
                        let reply = match reply {
                            Ok(reply) => reply,
                            Err(err) => {
                                error!(error = %err, "work_request RPC failed");
                                return;
                            }
                        };

                        match reply {
                            WorkReply::ComputeMap { tag, input_path, doc_id } => {
                                if let Some(tx) = &tx {
                                    let _ = tx
                                        .send(WorkerCommand::ComputeMap(WorkItem::map(tag, input_path, doc_id)))
                                        .await;
                                }
                                return;
                            }
                            WorkReply::ReduceRecovery { buckets } => {
                                let reassigned = {
                                    let mut local = local_reduce.lock().await;
                                    for (reducer_index, bucket) in buckets.into_iter().enumerate() {
                                        if bucket.is_empty() {
                                            continue;
                                        }
                                        let file_ids = bucket.iter().map(|(fid, _)| *fid).collect();
                                        local.merge_pending.push_back((reducer_index, file_ids));
                                    }
                                    local.next_local_reduce(0, true)
                                };

                                if let Some((reducer_index, file_ids)) = reassigned {
                                    if let Some(tx) = &tx {
                                        let _ = tx
                                            .send(WorkerCommand::ComputeReduce(WorkItem::reduce(
                                                0,
                                                reducer_index,
                                                file_ids,
                                            )))
                                            .await;
                                    }
                                    stats.lock().await.reduce_ongoing += 1;
                                    return;
                                }
                                continue;
                            }
                            WorkReply::TryLater => {
                                let local_work = local_reduce.lock().await.next_local_reduce(threshold_nfile, false);
                                if let Some((reducer_index, file_ids)) = local_work {
                                    if let Some(tx) = &tx {
                                        let _ = tx
                                            .send(WorkerCommand::ComputeReduce(WorkItem::reduce(
                                                0,
                                                reducer_index,
                                                file_ids,
                                            )))
                                            .await;
                                    }
                                    stats.lock().await.reduce_ongoing += 1;
                                } else if let Some(tx) = &tx {
                                    let _ =
                                        tx.send(WorkerCommand::Sleep(Duration::from_secs_f64(sleep_interval))).await;
                                }
                                return;
                            }
                            WorkReply::EndOfStream => {
                                eos_received.store(true, std::sync::atomic::Ordering::Relaxed);
                                let relaxed_work = local_reduce.lock().await.next_local_reduce(0, true);
                                if let Some((reducer_index, file_ids)) = relaxed_work {
                                    if let Some(tx) = &tx {
                                        let _ = tx
                                            .send(WorkerCommand::ComputeReduce(WorkItem::reduce(
                                                0,
                                                reducer_index,
                                                file_ids,
                                            )))
                                            .await;
                                    }
                                    stats.lock().await.reduce_ongoing += 1;
                                } else if let Some(tx) = &tx {
                                    let _ = tx.send(WorkerCommand::Sleep(Duration::from_secs_f64(sleep_interval))).await;
                                }
                                return;
                            }
                            WorkReply::RegistrationNeeded => {
                                match client.clone().register(context::current(), nick.clone()).await {
                                    Ok(RegistrationReply::Registered { unique_id }) => {
                                        info!(nick, unique_id, "re-registered after registration-needed");
                                    }
                                    Ok(RegistrationReply::ChangeNick) => {
                                        warn!(nick, "registration-needed retry hit a nick collision");
                                        return;
                                    }
                                    Err(err) => {
                                        error!(error = %err, "re-registration RPC failed");
                                        return;
                                    }
                                }
                                continue;
                            }
                            WorkReply::PlzDie => {
                                *active_workers.lock().await -= 1;
                                if let Some(tx) = &tx {
                                    let _ = tx.send(WorkerCommand::Quit).await;
                                }
                                return;
                            }
                        }
                    }
                });
            }

            WorkerEvent::FinishedMap { tag, info: task_info, outputs, .. } => {
                {
                    let mut s = stats.lock().await;
                    s.map_ongoing = s.map_ongoing.saturating_sub(1);
                    s.map_finished += 1;
                    s.map_file += outputs.len() as u64;
                    s.map_file_size += task_info.total_bytes;
                    s.bandwidth += task_info.total_bytes;
                }

                {
                    let mut local = local_reduce.lock().await;
                    for output in &outputs {
                        local.reducing_files[output.reducer_index].push((output.file_id, output.size_bytes));
                    }
                }

                let client = self.client.clone();
                let nick = self.nick.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        client.clone().map_ack(context::current(), nick, tag, outputs, task_info).await
                    {
                        error!(error = ?err, "map_ack RPC failed");
                    }
                });
            }

            WorkerEvent::FinishedReduce { reducer_index, info: task_info, output, inputs, .. } => {
                {
                    let mut s = stats.lock().await;
                    s.reduce_ongoing = s.reduce_ongoing.saturating_sub(1);
                    s.reduce_finished += 1;
                    s.reduce_file += 1;
                    s.reduce_file_size += output.1;
                    s.bandwidth += task_info.total_bytes;
                }
                {
                    let mut local = local_reduce.lock().await;
                    local.reduce_in_flight[reducer_index] = false;
                }

                let client = self.client.clone();
                let nick = self.nick.clone();
                tokio::spawn(async move {
                    if let Err(err) = client
                        .clone()
                        .reduce_ack(context::current(), nick, reducer_index, output, inputs, task_info)
                        .await
                    {
                        error!(error = ?err, "reduce_ack RPC failed");
                    }
                });
            }
        }
    }

    async fn send_keep_alive(
        &self,
        stats: &Arc<Mutex<LocalStats>>,
        kill_state: &Arc<Mutex<KillState>>,
        nproc: u32,
    ) {
        let snapshot = stats.lock().await.snapshot(nproc);
        let request = KeepAliveRequest { timeprobe_ms: now_ms(), status: snapshot };

        match self.client.clone().keep_alive(context::current(), self.nick.clone(), request).await {
            Ok(reply) => {
                if let Some(delta) = reply.degree_change {
                    if delta < 0 {
                        kill_state.lock().await.pending_kill += -delta;
                        info!(delta, "coordinator requested a parallelism decrease");
                    } else if delta > 0 {
                        warn!(delta, "coordinator requested a parallelism increase, ignoring: scale-up is not implemented");
                    }
                }
            }
            Err(err) => error!(error = %err, "keep_alive RPC failed"),
        }
    }
}

fn now_ms() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0)
}

fn rand_suffix() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    Instant::now().elapsed().as_nanos().hash(&mut hasher);
    hasher.finish()
}
