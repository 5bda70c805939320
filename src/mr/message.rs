//! Wire types shared by the Coordinator, Master and Worker.
//!
//! The tagged `(command, tag, payload)` triple of the original protocol is
//! expressed here as Rust enums carried over a tarpc service (see
//! `coordinator::CoordinatorService`) instead of a hand-rolled HTTP/JSON
//! envelope: tarpc already gives us the `{"type", "data"}` framing, we only
//! need to describe the payload shapes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type Nick = String;
pub type Tag = u64;
pub type FileId = u64;
pub type ReducerIndex = usize;

/// One (fileId, sizeBytes) pair sitting in a reduce bucket.
pub type BucketEntry = (FileId, u64);

/// Ordered list of intermediate files for one (master, reducerIndex) pair.
pub type Bucket = Vec<BucketEntry>;

/// Per-master reduce bookkeeping: one `Bucket` per reducer index.
pub type ReduceBuckets = Vec<Bucket>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkKind {
    Map,
    Reduce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkPayload {
    Map { input_path: String, doc_id: i64 },
    Reduce { reducer_index: ReducerIndex, file_ids: Vec<FileId> },
}

/// A unit of work as tracked by the work queue / coordinator / master.
///
/// `tag` is unique within a master's lifetime; the Coordinator hands out a
/// monotonically increasing sequence for MAP tags it issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub kind: WorkKind,
    pub tag: Tag,
    pub payload: WorkPayload,
}

impl WorkItem {
    pub fn map(tag: Tag, input_path: String, doc_id: i64) -> Self {
        Self { kind: WorkKind::Map, tag, payload: WorkPayload::Map { input_path, doc_id } }
    }

    pub fn reduce(tag: Tag, reducer_index: ReducerIndex, file_ids: Vec<FileId>) -> Self {
        Self {
            kind: WorkKind::Reduce,
            tag,
            payload: WorkPayload::Reduce { reducer_index, file_ids },
        }
    }
}

/// `(reducerIndex, fileId, sizeBytes)` triple produced by a map task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntermediateFile {
    pub reducer_index: ReducerIndex,
    pub file_id: FileId,
    pub size_bytes: u64,
}

/// Reply to `work-request` when the Coordinator is still in MAP/REDUCE
/// phase. Modeled as the return value of the `work_request` RPC rather than
/// a server push, since tarpc is strictly request/reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkReply {
    ComputeMap { tag: Tag, input_path: String, doc_id: i64 },
    ReduceRecovery { buckets: ReduceBuckets },
    TryLater,
    EndOfStream,
    /// The nick this master is using isn't in `masters` (never registered,
    /// or recycled after a disconnect): re-register instead of dying.
    RegistrationNeeded,
    PlzDie,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistrationReply {
    Registered { unique_id: u64 },
    ChangeNick,
}

/// Piggy-backed on the keep-alive reply: the one case in which the
/// Coordinator genuinely needs to push something to a Master outside of a
/// request it initiated (a parallelism-degree change).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct KeepAliveReply {
    pub timeprobe_ms: u128,
    pub degree_change: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub timeprobe_ms: u128,
    pub status: crate::mr::status::MasterStatusSnapshot,
}

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum AckError {
    #[error("group {0} is not registered")]
    UnregisteredMaster(Nick),
    #[error("no pending work with tag {0} for group {1}")]
    UnknownTag(Tag, Nick),
    #[error("failed to remove reduce input files {0:?}")]
    ResidualDeleteFailures(Vec<FileId>),
}

/// Restricted command set carried over the local Master<->Worker channel
/// (an in-process `mpsc` pair standing in for the original's forked
/// Intercommunicator, see spec SPEC_FULL.md §2 [AMBIENT]).
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    ComputeMap(WorkItem),
    ComputeReduce(WorkItem),
    Sleep(Duration),
    Quit,
}

/// Performance measure attached to a finished map/reduce: cumulative bytes
/// produced and wall-clock time taken, used to derive the `avg` bandwidth
/// statistic in `MasterStatusSnapshot`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskInfo {
    pub total_bytes: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Available(usize),
    FinishedMap { worker: usize, tag: Tag, info: TaskInfo, outputs: Vec<IntermediateFile> },
    FinishedReduce {
        worker: usize,
        tag: Tag,
        reducer_index: ReducerIndex,
        info: TaskInfo,
        output: BucketEntry,
        inputs: Vec<FileId>,
    },
}
