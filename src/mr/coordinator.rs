//! The Global Coordinator: single authoritative owner of work state and
//! phase transitions (MAP -> REDUCE -> MERGE), per spec.md §4. Generalizes
//! the teacher's `Server` tarpc service (this file, in
//! `examples/xzhseh-MapReduce-rs/src/mr/coordinator.rs`) from four
//! word-count-shaped RPCs over a plain counter into the registration /
//! work-request / ack / keep-alive protocol of
//! `examples/original_source/src/server.py: Handler`, `MasterServer`,
//! `WorkQueue`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tarpc::context;
use tracing::{info, warn};

use crate::mr::blobstore::BlobStore;
use crate::mr::config::Config;
use crate::mr::message::{
    AckError, BucketEntry, FileId, IntermediateFile, KeepAliveReply, KeepAliveRequest, Nick,
    ReduceBuckets, ReducerIndex, RegistrationReply, Tag, TaskInfo, WorkReply,
};
use crate::mr::status::{ApplicationState, LogRing, Phase};
use crate::mr::work_queue::{InputPair, WorkQueue};

/// Everything the Coordinator tracks about one connected (or disconnecting)
/// Master. Reduce buckets are kept here, not only on the Master side, so a
/// disconnected Master's work can be recycled without asking it anything.
#[derive(Debug)]
pub struct MasterRecord {
    pub unique_id: u64,
    pub reduce_buckets: ReduceBuckets,
    pub pending_maps: HashMap<Tag, InputPair>,
    /// spec.md §3's `reduceMark`: set while this Master holds an
    /// un-acked reduce-recovery snapshot, so a second `work-request`
    /// arriving before the ack gets `try-later` instead of a duplicate
    /// assignment (spec.md §4.3 step 1).
    pub reduce_mark: bool,
    /// spec.md §3's `eosSent`: `end-of-stream` is sent at most once per
    /// Master, at the MAP -> REDUCE transition (spec.md §4.3 step 6).
    pub eos_sent: bool,
    pub last_seen: Instant,
    pub last_tag: Tag,
    /// Set by an out-of-band `request_degree_change` call, consumed by the
    /// next `keep_alive` reply (the only Coordinator -> Master push tarpc's
    /// request/reply model allows).
    pub pending_degree_change: Option<i32>,
}

impl MasterRecord {
    fn new(unique_id: u64, num_reducer: usize) -> Self {
        Self {
            unique_id,
            reduce_buckets: vec![Vec::new(); num_reducer],
            pending_maps: HashMap::new(),
            reduce_mark: false,
            eos_sent: false,
            last_seen: Instant::now(),
            last_tag: 0,
            pending_degree_change: None,
        }
    }

    fn next_tag(&mut self) -> Tag {
        self.last_tag += 1;
        self.last_tag
    }
}

pub struct CoordinatorState {
    pub phase: Phase,
    pub work_queue: WorkQueue,
    pub masters: HashMap<Nick, MasterRecord>,
    /// Reduce buckets orphaned by a disconnected Master, kept until either
    /// the same nick reconnects (full recovery, spec.md §4.3's
    /// `registration` branch) or a living Master steals them during MERGE
    /// (spec.md §4.3 step 1's `deadReduceTable` fallback).
    pub dead_reduce_table: HashMap<Nick, ReduceBuckets>,
    /// spec.md §4.4's static, once-computed `nicks[r mod |nicks|]`
    /// assignment. `None` until the MAP/REDUCE -> MERGE transition.
    pub merge_owner: Option<HashMap<ReducerIndex, Nick>>,
    /// Reducer indices whose cross-master merge has produced its single
    /// final file (spec.md §4.4's "terminal" bucket). Used both to decide
    /// when the whole run is done and, per index, as the §6 final output.
    pub merge_completed: HashMap<ReducerIndex, BucketEntry>,
    pub num_reducer: usize,
    /// spec.md §4.6 `checkThreshold`'s `threshold-nfile`; kept here purely
    /// for the REDUCE-COMPLETED comparison (`bucket.len() <= 1`), which is
    /// threshold-independent, and for diagnostics.
    pub threshold_nfile: usize,
    pub next_unique_id: u64,
    pub app: ApplicationState,
}

impl CoordinatorState {
    fn new(num_reducer: usize, threshold_nfile: usize, work_queue: WorkQueue) -> Self {
        Self {
            phase: Phase::Map,
            work_queue,
            masters: HashMap::new(),
            dead_reduce_table: HashMap::new(),
            merge_owner: None,
            merge_completed: HashMap::new(),
            num_reducer,
            threshold_nfile,
            next_unique_id: 1,
            app: ApplicationState::default(),
        }
    }

    /// spec.md §4.3's decision tree for MAP/REDUCE phase dispatch (steps
    /// 2, 3, 4 and 6 — step 1 is MERGE and lives in `assign_merge_work`,
    /// step 5's dead-table reassignment is also part of MERGE).
    ///
    /// Local reduces (the pre-merge REDUCE WorkItems of spec.md §3) are
    /// never assigned from here: spec.md §4.6 makes them a purely
    /// Master-local decision (`checkThreshold` over the Master's own
    /// mirrored `reducingFiles`), so the Coordinator only ever watches
    /// `reduce_buckets` settle via `map-ack`/`reduce-ack` and decides when
    /// to flip phases.
    fn assign_generic_work(&mut self, nick: &str) -> WorkReply {
        if self.phase == Phase::Map {
            if let Some(item) = self.work_queue.pop() {
                let master = self.masters.get_mut(nick).expect("registered master");
                let (input_path, doc_id) = match &item.payload {
                    crate::mr::message::WorkPayload::Map { input_path, doc_id } => {
                        (input_path.clone(), *doc_id)
                    }
                    _ => unreachable!("WorkQueue only emits map payloads"),
                };
                master.pending_maps.insert(item.tag, (input_path.clone(), doc_id));
                self.app.map_assigned += 1;
                return WorkReply::ComputeMap { tag: item.tag, input_path, doc_id };
            }

            let anyone_still_mapping = self.masters.values().any(|m| !m.pending_maps.is_empty());
            if anyone_still_mapping {
                return WorkReply::TryLater;
            }

            info!("map phase drained, entering reduce phase");
            self.phase = Phase::Reduce;
            self.app.phase = Phase::Reduce;
        }

        // Phase::Reduce: step 4's REDUCE-COMPLETED check.
        let reduce_completed =
            self.masters.values().all(|m| m.reduce_buckets.iter().all(|bucket| bucket.len() <= 1));

        if reduce_completed {
            if self.dead_reduce_table.is_empty() {
                info!("reduce phase drained, entering merge phase");
                self.phase = Phase::Merge;
                self.app.phase = Phase::Merge;
                return self.assign_merge_work(nick);
            }
            // step 5: a living master can still inherit a dead master's
            // buckets even though everyone's own buckets are settled.
            return self.steal_dead_buckets(nick);
        }

        // step 6: flip to REDUCE and send end-of-stream exactly once per
        // master; every other call in this branch gets try-later while
        // masters drain their own local reduces.
        let master = self.masters.get_mut(nick).expect("registered master");
        if !master.eos_sent {
            master.eos_sent = true;
            return WorkReply::EndOfStream;
        }
        WorkReply::TryLater
    }

    /// spec.md §4.4: deterministic round-robin assignment of each
    /// reducerIndex to exactly one living Master, computed exactly once at
    /// the REDUCE -> MERGE transition. Harvests every master's (and the
    /// dead table's) bucket contents into `acc[r]`, then re-homes each
    /// non-terminal `acc[r]` onto its target master's `reduce_buckets[r]`
    /// — clearing every master's buckets first so no entry is ever
    /// double-counted once the reassignment has run.
    fn compute_merge_assignment(&mut self) {
        let mut nicks: Vec<Nick> = self.masters.keys().cloned().collect();
        nicks.sort();

        let mut acc: Vec<Vec<BucketEntry>> = vec![Vec::new(); self.num_reducer];
        for reducer_index in 0..self.num_reducer {
            acc[reducer_index] = self.merge_entries_for(reducer_index);
        }

        for master in self.masters.values_mut() {
            master.reduce_buckets = vec![Vec::new(); self.num_reducer];
        }
        self.dead_reduce_table.clear();

        if nicks.is_empty() {
            self.merge_owner = Some(HashMap::new());
            return;
        }

        let mut owner = HashMap::new();
        for reducer_index in 0..self.num_reducer {
            let target = nicks[reducer_index % nicks.len()].clone();
            owner.insert(reducer_index, target.clone());

            let entries = &acc[reducer_index];
            if entries.len() <= 1 {
                if let Some(&entry) = entries.first() {
                    self.merge_completed.insert(reducer_index, entry);
                }
                continue;
            }

            self.masters.get_mut(&target).unwrap().reduce_buckets[reducer_index] = entries.clone();
        }
        self.merge_owner = Some(owner);
    }

    fn merge_entries_for(&self, reducer_index: ReducerIndex) -> Vec<BucketEntry> {
        let mut entries = Vec::new();
        for master in self.masters.values() {
            if let Some(bucket) = master.reduce_buckets.get(reducer_index) {
                entries.extend(bucket.iter().copied());
            }
        }
        for buckets in self.dead_reduce_table.values() {
            if let Some(bucket) = buckets.get(reducer_index) {
                entries.extend(bucket.iter().copied());
            }
        }
        entries
    }

    /// spec.md §4.3 step 1, the MERGE-phase decision tree:
    /// `reduceMark` set -> try-later; else a non-nil `reduce_buckets` ->
    /// send the full snapshot and set `reduceMark`; else steal one dead
    /// master's orphaned buckets; else `plz-die`.
    fn assign_merge_work(&mut self, nick: &str) -> WorkReply {
        if self.merge_owner.is_none() {
            self.compute_merge_assignment();
        }

        let master = self.masters.get_mut(nick).expect("registered master");
        if master.reduce_mark {
            return WorkReply::TryLater;
        }

        if master.reduce_buckets.iter().any(|bucket| !bucket.is_empty()) {
            master.reduce_mark = true;
            let buckets = master.reduce_buckets.clone();
            self.app.reduce_assigned += 1;
            return WorkReply::ReduceRecovery { buckets };
        }

        if !self.dead_reduce_table.is_empty() {
            return self.steal_dead_buckets(nick);
        }

        WorkReply::PlzDie
    }

    /// spec.md §4.3 step 5 / §4.3 step 1's dead-table fallback: transfer
    /// one orphaned Master's entire bucket set onto `nick`.
    fn steal_dead_buckets(&mut self, nick: &str) -> WorkReply {
        let Some(dead_nick) = self.dead_reduce_table.keys().next().cloned() else {
            return WorkReply::PlzDie;
        };
        let buckets = self.dead_reduce_table.remove(&dead_nick).unwrap();
        info!(nick, dead_nick, "inheriting reduce buckets from a dead master");

        let master = self.masters.get_mut(nick).expect("registered master");
        master.reduce_buckets = buckets.clone();
        master.reduce_mark = true;
        self.app.reduce_assigned += 1;
        WorkReply::ReduceRecovery { buckets }
    }

    /// A Master's connection dropped. Its pending map tags go back on the
    /// queue, its reduce buckets move to the dead table as-is (carrying
    /// forward whatever it had been given, dispatched or not).
    fn on_group_died(&mut self, nick: &str) {
        let Some(mut master) = self.masters.remove(nick) else { return };

        for (_, payload) in master.pending_maps.drain() {
            self.work_queue.push(payload);
        }

        if master.reduce_buckets.iter().any(|bucket| !bucket.is_empty()) {
            self.dead_reduce_table.insert(nick.to_string(), master.reduce_buckets);
        }
        self.app.mark_master_dead(nick);
        warn!(nick, dead_list_len = self.work_queue.dead_list_len(), "master group died, work recycled");
    }

    pub fn is_merge_done(&self) -> bool {
        self.phase == Phase::Merge && self.merge_completed.len() == self.num_reducer
    }
}

/// RPC surface between Master and Coordinator. tarpc is strictly
/// request/reply, so the original's server-push messages (`change-degree`,
/// ping-driven `keep-alive`) are folded into the return value of the next
/// call the Master makes.
#[tarpc::service]
pub trait CoordinatorService {
    async fn register(nick: Nick) -> RegistrationReply;
    async fn work_request(nick: Nick) -> WorkReply;
    async fn map_ack(
        nick: Nick,
        tag: Tag,
        outputs: Vec<IntermediateFile>,
        info: TaskInfo,
    ) -> Result<(), AckError>;
    /// No tag lookup, per spec.md §4.5: a reduce is purely Master-local
    /// bookkeeping until it is acked, so the Coordinator validates the ack
    /// directly against the bucket it already owns for `(nick,
    /// reducer_index)` rather than against a previously-recorded
    /// assignment.
    async fn reduce_ack(
        nick: Nick,
        reducer_index: ReducerIndex,
        output: BucketEntry,
        consumed: Vec<FileId>,
        info: TaskInfo,
    ) -> Result<(), AckError>;
    async fn keep_alive(nick: Nick, request: KeepAliveRequest) -> KeepAliveReply;
    /// Confirms a parallelism-degree change has actually taken effect,
    /// reporting the worker count the Master settled on (spec.md §4.6:
    /// "ack the new total to the Coordinator").
    async fn change_degree_ack(nick: Nick, new_total: u32);
}

#[derive(Clone)]
pub struct Coordinator {
    state: Arc<tokio::sync::Mutex<CoordinatorState>>,
    config: Arc<Config>,
    blob_store: Arc<dyn BlobStore>,
    log_ring: Arc<LogRing>,
}

impl Coordinator {
    pub fn new(config: Arc<Config>, blob_store: Arc<dyn BlobStore>, work_queue: WorkQueue) -> Self {
        let state = CoordinatorState::new(config.num_reducer, config.threshold_nfile, work_queue);
        Self {
            state: Arc::new(tokio::sync::Mutex::new(state)),
            config,
            blob_store,
            log_ring: Arc::new(LogRing::new()),
        }
    }

    /// Shared with the binary's tracing subscriber so every logged event
    /// lands in the same ring this Coordinator reads back out on snapshot.
    pub fn log_ring(&self) -> Arc<LogRing> {
        self.log_ring.clone()
    }

    pub async fn snapshot(&self) -> serde_json::Value {
        self.state.lock().await.app.serialize(self.log_ring.snapshot())
    }

    pub async fn is_done(&self) -> bool {
        self.state.lock().await.is_merge_done()
    }

    pub async fn on_connection_closed(&self, nick: &str) {
        let mut state = self.state.lock().await;
        state.on_group_died(nick);
    }

    /// Out-of-band admin action (the monitor's `/masters/:nick/degree`
    /// route), not a tarpc RPC: records the requested delta and lets the
    /// next `keep_alive` reply piggy-back it to the Master. Returns `false`
    /// if `nick` isn't a currently-registered master.
    pub async fn request_degree_change(&self, nick: &str, delta: i32) -> bool {
        let mut state = self.state.lock().await;
        let Some(master) = state.masters.get_mut(nick) else { return false };
        master.pending_degree_change = Some(delta);
        info!(nick, delta, "parallelism degree change requested");
        true
    }

    /// Periodically evicts Masters that have not sent a keep-alive within
    /// `ping_max` missed intervals. Per spec.md §5, heartbeats "never
    /// forcibly evict; they only warn when RTT exceeds ping-max" — so this
    /// loop only warns; cancellation remains disconnect-driven, handled by
    /// `on_connection_closed` when the RPC transport itself notices the
    /// Master is gone.
    pub async fn run_heartbeat(self, ping_interval: Duration, ping_max: u64) {
        let mut ticker = tokio::time::interval(ping_interval);
        loop {
            ticker.tick().await;
            let timeout = ping_interval * ping_max as u32;
            let state = self.state.lock().await;
            for (nick, master) in &state.masters {
                if master.last_seen.elapsed() > timeout {
                    warn!(nick, rtt_ms = ?master.last_seen.elapsed(), "master keep-alive overdue");
                }
            }
        }
    }
}

impl CoordinatorService for Coordinator {
    async fn register(self, _: context::Context, nick: Nick) -> RegistrationReply {
        let mut state = self.state.lock().await;

        // A nick is unique among live masters; `on_group_died` removes the
        // entry before a disconnected master's own nick can be reused, so
        // any survivor here is a genuine collision, not a stale record.
        if state.masters.contains_key(&nick) {
            return RegistrationReply::ChangeNick;
        }

        let unique_id = state.next_unique_id;
        state.next_unique_id += 1;

        let num_reducer = state.num_reducer;
        let mut record = MasterRecord::new(unique_id, num_reducer);
        if let Some(buckets) = state.dead_reduce_table.remove(&nick) {
            info!(nick, "recovering reduce buckets from a prior disconnect");
            record.reduce_buckets = buckets;
        }
        state.masters.insert(nick.clone(), record);

        info!(nick, unique_id, "master registered");
        RegistrationReply::Registered { unique_id }
    }

    async fn work_request(self, _: context::Context, nick: Nick) -> WorkReply {
        let mut state = self.state.lock().await;
        if !state.masters.contains_key(&nick) {
            return WorkReply::RegistrationNeeded;
        }

        match state.phase {
            Phase::Merge => state.assign_merge_work(&nick),
            Phase::Map | Phase::Reduce => state.assign_generic_work(&nick),
        }
    }

    async fn map_ack(
        self,
        _: context::Context,
        nick: Nick,
        tag: Tag,
        outputs: Vec<IntermediateFile>,
        info: TaskInfo,
    ) -> Result<(), AckError> {
        let mut state = self.state.lock().await;
        let master = state
            .masters
            .get_mut(&nick)
            .ok_or_else(|| AckError::UnregisteredMaster(nick.clone()))?;

        master
            .pending_maps
            .remove(&tag)
            .ok_or_else(|| AckError::UnknownTag(tag, nick.clone()))?;

        let mut total_bytes = 0u64;
        for output in &outputs {
            master.reduce_buckets[output.reducer_index].push((output.file_id, output.size_bytes));
            total_bytes += output.size_bytes;
        }

        state.app.map_completed += 1;
        state.app.map_file += outputs.len() as u64;
        state.app.map_file_size += total_bytes;
        let _ = info;

        Ok(())
    }

    async fn reduce_ack(
        self,
        _: context::Context,
        nick: Nick,
        reducer_index: ReducerIndex,
        output: BucketEntry,
        consumed: Vec<FileId>,
        info: TaskInfo,
    ) -> Result<(), AckError> {
        // Deleting the now-superseded input files is disk I/O and must not
        // happen while the state lock is held. spec.md §4.5: "delete the
        // on-disk file ... (or call blob-store nuke)" — the two are
        // alternatives, not both: when a DFS is configured the blob store
        // owns the file's lifecycle, otherwise the Coordinator unlinks it
        // directly from the shared output directory.
        let output_dir = self.config.output_path();
        let mut deleted_failures = Vec::new();
        for file_id in &consumed {
            let name = crate::mr::merge::intermediate_file_name(reducer_index, *file_id);
            let result = if self.config.dfs_enabled {
                self.blob_store.nuke(&name).await
            } else {
                tokio::fs::remove_file(output_dir.join(&name)).await.map_err(anyhow::Error::from)
            };
            if let Err(err) = result {
                warn!(file_id, error = %err, "failed to delete residual reduce input");
                deleted_failures.push(*file_id);
            }
        }

        let is_merge_phase;
        {
            let mut state = self.state.lock().await;
            is_merge_phase = state.phase == Phase::Merge;

            let master = state
                .masters
                .get_mut(&nick)
                .ok_or_else(|| AckError::UnregisteredMaster(nick.clone()))?;

            let bucket = master
                .reduce_buckets
                .get_mut(reducer_index)
                .ok_or_else(|| AckError::UnknownTag(0, nick.clone()))?;
            bucket.retain(|(fid, _)| !consumed.contains(fid));
            bucket.push(output);
            master.reduce_mark = false;

            state.app.reduce_completed += 1;
            state.app.reduce_file += 1;
            state.app.reduce_file_size += output.1;

            if is_merge_phase && bucket.len() <= 1 {
                if let Some(&entry) = bucket.first() {
                    state.merge_completed.insert(reducer_index, entry);
                }
            }
        }
        let _ = info;

        if !deleted_failures.is_empty() {
            return Err(AckError::ResidualDeleteFailures(deleted_failures));
        }
        Ok(())
    }

    async fn keep_alive(
        self,
        _: context::Context,
        nick: Nick,
        request: KeepAliveRequest,
    ) -> KeepAliveReply {
        let mut state = self.state.lock().await;
        let degree_change = if let Some(master) = state.masters.get_mut(&nick) {
            master.last_seen = Instant::now();
            master.pending_degree_change.take()
        } else {
            None
        };
        state.app.update_master(&nick, "alive", request.timeprobe_ms, request.status);

        KeepAliveReply { timeprobe_ms: request.timeprobe_ms, degree_change }
    }

    async fn change_degree_ack(self, _: context::Context, nick: Nick, new_total: u32) {
        info!(nick, new_total, "master acked parallelism degree change");
    }
}

/// Per-connection view of the Coordinator, one instance per accepted tarpc
/// channel. tarpc's request/reply RPCs carry no connection identity of
/// their own, so the Coordinator cannot otherwise tell *which* Master's
/// socket just dropped; this wrapper remembers the nick a connection
/// registered under so the binary's accept loop can recycle that Master's
/// work the moment the channel's request stream ends (spec.md §5:
/// "disconnect is the sole cancellation signal").
#[derive(Clone)]
pub struct ConnectionCoordinator {
    inner: Coordinator,
    registered_nick: Arc<tokio::sync::Mutex<Option<Nick>>>,
}

impl ConnectionCoordinator {
    pub fn new(inner: Coordinator) -> Self {
        Self { inner, registered_nick: Arc::new(tokio::sync::Mutex::new(None)) }
    }

    /// Called by the accept loop once this connection's request stream has
    /// ended, i.e. the underlying socket closed.
    pub async fn on_closed(&self) {
        if let Some(nick) = self.registered_nick.lock().await.take() {
            self.inner.on_connection_closed(&nick).await;
        }
    }
}

impl CoordinatorService for ConnectionCoordinator {
    async fn register(self, ctx: context::Context, nick: Nick) -> RegistrationReply {
        let reply = self.inner.clone().register(ctx, nick.clone()).await;
        if let RegistrationReply::Registered { .. } = reply {
            *self.registered_nick.lock().await = Some(nick);
        }
        reply
    }

    async fn work_request(self, ctx: context::Context, nick: Nick) -> WorkReply {
        self.inner.clone().work_request(ctx, nick).await
    }

    async fn map_ack(
        self,
        ctx: context::Context,
        nick: Nick,
        tag: Tag,
        outputs: Vec<IntermediateFile>,
        info: TaskInfo,
    ) -> Result<(), AckError> {
        self.inner.clone().map_ack(ctx, nick, tag, outputs, info).await
    }

    async fn reduce_ack(
        self,
        ctx: context::Context,
        nick: Nick,
        reducer_index: ReducerIndex,
        output: BucketEntry,
        consumed: Vec<FileId>,
        info: TaskInfo,
    ) -> Result<(), AckError> {
        self.inner.clone().reduce_ack(ctx, nick, reducer_index, output, consumed, info).await
    }

    async fn keep_alive(self, ctx: context::Context, nick: Nick, request: KeepAliveRequest) -> KeepAliveReply {
        self.inner.clone().keep_alive(ctx, nick, request).await
    }

    async fn change_degree_ack(self, ctx: context::Context, nick: Nick, new_total: u32) {
        self.inner.clone().change_degree_ack(ctx, nick, new_total).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mr::blobstore::NullBlobStore;
    use crate::mr::config::Config;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            machine_file: None,
            num_mapper: 1,
            num_reducer: 2,
            threshold_nfile: 2,
            threshold_size: 0,
            sleep_interval: 1.0,
            master_url: "http://127.0.0.1:0".into(),
            master_host: "127.0.0.1".into(),
            master_port: 0,
            input_module: None,
            map_module: None,
            reduce_module: None,
            map_executable: None,
            reduce_executable: None,
            datadir: "/tmp".into(),
            input_prefix: "input".into(),
            output_prefix: "output".into(),
            // These unit tests exercise the bucket/phase state machine in
            // isolation with synthetic file ids that never exist on disk;
            // routing deletes through the (no-op) blob store rather than a
            // real unlink keeps them independent of the filesystem.
            dfs_enabled: true,
            dfs_conf: None,
            ping_max: 5,
            ping_interval: 5,
        })
    }

    fn coordinator_with_inputs(inputs: Vec<InputPair>) -> Coordinator {
        let wq = WorkQueue::new(inputs.into_iter());
        Coordinator::new(test_config(), Arc::new(NullBlobStore), wq)
    }

    fn coordinator_with_one_input() -> Coordinator {
        coordinator_with_inputs(vec![("a.zip".to_string(), 0)])
    }

    #[tokio::test]
    async fn registration_then_map_dispatch() {
        let coordinator = coordinator_with_one_input();
        let reply = coordinator.clone().register(context::current(), "alice".into()).await;
        assert!(matches!(reply, RegistrationReply::Registered { .. }));

        let work = coordinator.clone().work_request(context::current(), "alice".into()).await;
        assert!(matches!(work, WorkReply::ComputeMap { doc_id: 0, .. }));
    }

    #[tokio::test]
    async fn map_phase_drains_into_reduce_phase_and_sends_eos_once() {
        let coordinator = coordinator_with_one_input();
        coordinator.clone().register(context::current(), "alice".into()).await;

        let work = coordinator.clone().work_request(context::current(), "alice".into()).await;
        let tag = match work {
            WorkReply::ComputeMap { tag, .. } => tag,
            other => panic!("unexpected reply: {other:?}"),
        };

        coordinator
            .clone()
            .map_ack(
                context::current(),
                "alice".into(),
                tag,
                vec![
                    IntermediateFile { reducer_index: 0, file_id: 1, size_bytes: 10 },
                    IntermediateFile { reducer_index: 1, file_id: 2, size_bytes: 20 },
                ],
                TaskInfo::default(),
            )
            .await
            .unwrap();

        // Both buckets have exactly one entry: REDUCE-COMPLETED is already
        // true, so no end-of-stream is needed before entering MERGE.
        let next = coordinator.clone().work_request(context::current(), "alice".into()).await;
        assert!(matches!(next, WorkReply::PlzDie | WorkReply::EndOfStream));
    }

    #[tokio::test]
    async fn local_reduce_must_drain_before_merge_begins() {
        // Two inputs routed to reducer 0 only: the bucket has 2 entries
        // (>1), so REDUCE-COMPLETED is false until the master's own local
        // reduce (simulated here via reduce_ack) drains it to one file.
        let coordinator = coordinator_with_inputs(vec![("a".into(), 0), ("b".into(), 1)]);
        coordinator.clone().register(context::current(), "alice".into()).await;

        for _ in 0..2 {
            let work = coordinator.clone().work_request(context::current(), "alice".into()).await;
            let (tag, doc_id) = match work {
                WorkReply::ComputeMap { tag, doc_id, .. } => (tag, doc_id),
                other => panic!("unexpected reply: {other:?}"),
            };
            coordinator
                .clone()
                .map_ack(
                    context::current(),
                    "alice".into(),
                    tag,
                    vec![IntermediateFile {
                        reducer_index: 0,
                        file_id: doc_id as u64 + 1,
                        size_bytes: 5,
                    }],
                    TaskInfo::default(),
                )
                .await
                .unwrap();
        }

        // Map phase just drained into REDUCE; bucket 0 has 2 entries so the
        // coordinator must send end-of-stream, not merge work.
        let eos = coordinator.clone().work_request(context::current(), "alice".into()).await;
        assert!(matches!(eos, WorkReply::EndOfStream));
        let try_later = coordinator.clone().work_request(context::current(), "alice".into()).await;
        assert!(matches!(try_later, WorkReply::TryLater));

        // Master performs its own local reduce and acks it directly,
        // without the Coordinator ever having assigned it.
        coordinator
            .clone()
            .reduce_ack(context::current(), "alice".into(), 0, (99, 8), vec![1, 2], TaskInfo::default())
            .await
            .unwrap();

        let merge = coordinator.clone().work_request(context::current(), "alice".into()).await;
        assert!(matches!(merge, WorkReply::PlzDie));
    }

    #[tokio::test]
    async fn disconnect_recycles_pending_map() {
        let coordinator = coordinator_with_one_input();
        coordinator.clone().register(context::current(), "alice".into()).await;
        coordinator.clone().work_request(context::current(), "alice".into()).await;

        coordinator.on_connection_closed("alice").await;

        coordinator.clone().register(context::current(), "bob".into()).await;
        let work = coordinator.clone().work_request(context::current(), "bob".into()).await;
        assert!(matches!(work, WorkReply::ComputeMap { doc_id: 0, .. }));
    }

    #[tokio::test]
    async fn live_nick_collision_is_rejected_without_losing_state() {
        let coordinator = coordinator_with_one_input();
        coordinator.clone().register(context::current(), "alice".into()).await;

        let work = coordinator.clone().work_request(context::current(), "alice".into()).await;
        assert!(matches!(work, WorkReply::ComputeMap { .. }));

        // A second registration under the same nick must not overwrite
        // alice's in-flight pending_maps, regardless of how recently she
        // was last seen.
        let reply = coordinator.clone().register(context::current(), "alice".into()).await;
        assert!(matches!(reply, RegistrationReply::ChangeNick));

        let state = coordinator.state.lock().await;
        assert_eq!(state.masters["alice"].pending_maps.len(), 1);
    }

    #[tokio::test]
    async fn unregistered_master_is_told_to_register() {
        let coordinator = coordinator_with_one_input();
        let work = coordinator.clone().work_request(context::current(), "ghost".into()).await;
        assert!(matches!(work, WorkReply::RegistrationNeeded));
    }

    #[tokio::test]
    async fn merge_assignment_is_round_robin_and_idle_masters_die() {
        // Three masters, two reducers, each bucket has 2 entries so merge
        // work is real. nicks sort lexically: alice, bob, carol.
        let coordinator = coordinator_with_inputs(vec![
            ("a".into(), 0),
            ("b".into(), 1),
            ("c".into(), 2),
            ("d".into(), 3),
        ]);
        for nick in ["alice", "bob", "carol"] {
            coordinator.clone().register(context::current(), nick.into()).await;
        }

        // Drive every map through alice so both buckets land on one
        // master, matching the "bucket.len() > 1 needs a real merge" setup.
        for _ in 0..4 {
            let work = coordinator.clone().work_request(context::current(), "alice".into()).await;
            let (tag, doc_id) = match work {
                WorkReply::ComputeMap { tag, doc_id, .. } => (tag, doc_id),
                other => panic!("unexpected reply: {other:?}"),
            };
            coordinator
                .clone()
                .map_ack(
                    context::current(),
                    "alice".into(),
                    tag,
                    vec![IntermediateFile {
                        reducer_index: (doc_id % 2) as usize,
                        file_id: doc_id as u64 + 1,
                        size_bytes: 5,
                    }],
                    TaskInfo::default(),
                )
                .await
                .unwrap();
        }

        for nick in ["alice", "bob", "carol"] {
            coordinator.clone().work_request(context::current(), nick.into()).await;
        }

        let alice_reply = coordinator.clone().work_request(context::current(), "alice".into()).await;
        assert!(matches!(alice_reply, WorkReply::ReduceRecovery { .. }));

        // carol never received any files for either reducer index and owns
        // nothing merge-eligible, so it is told to die immediately.
        let carol_reply = coordinator.clone().work_request(context::current(), "carol".into()).await;
        assert!(matches!(carol_reply, WorkReply::PlzDie));
    }

    #[tokio::test]
    async fn degree_change_is_piggybacked_on_next_keep_alive() {
        let coordinator = coordinator_with_one_input();
        coordinator.clone().register(context::current(), "alice".into()).await;

        assert!(coordinator.request_degree_change("alice", -2).await);
        assert!(!coordinator.request_degree_change("ghost", -1).await);

        let request = KeepAliveRequest { timeprobe_ms: 0, status: Default::default() };
        let reply = coordinator.clone().keep_alive(context::current(), "alice".into(), request.clone()).await;
        assert_eq!(reply.degree_change, Some(-2));

        // Consumed: the following keep-alive carries nothing new.
        let reply = coordinator.clone().keep_alive(context::current(), "alice".into(), request).await;
        assert_eq!(reply.degree_change, None);

        coordinator.clone().change_degree_ack(context::current(), "alice".into(), 1).await;
    }

    #[tokio::test]
    async fn dead_master_mid_merge_is_recovered_by_another() {
        let coordinator = coordinator_with_inputs(vec![("a".into(), 0), ("b".into(), 1)]);
        coordinator.clone().register(context::current(), "alice".into()).await;
        coordinator.clone().register(context::current(), "bob".into()).await;

        for _ in 0..2 {
            let work = coordinator.clone().work_request(context::current(), "alice".into()).await;
            let (tag, doc_id) = match work {
                WorkReply::ComputeMap { tag, doc_id, .. } => (tag, doc_id),
                other => panic!("unexpected reply: {other:?}"),
            };
            coordinator
                .clone()
                .map_ack(
                    context::current(),
                    "alice".into(),
                    tag,
                    vec![IntermediateFile { reducer_index: 0, file_id: doc_id as u64 + 1, size_bytes: 5 }],
                    TaskInfo::default(),
                )
                .await
                .unwrap();
        }

        coordinator.clone().work_request(context::current(), "bob".into()).await;
        let merge_reply = coordinator.clone().work_request(context::current(), "alice".into()).await;
        assert!(matches!(merge_reply, WorkReply::ReduceRecovery { .. }));

        coordinator.on_connection_closed("alice").await;

        let recovered = coordinator.clone().work_request(context::current(), "bob".into()).await;
        assert!(matches!(recovered, WorkReply::ReduceRecovery { buckets } if buckets[0].len() == 2));
    }
}
