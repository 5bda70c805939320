//! The Worker: a single-threaded AVAILABLE -> COMPUTE -> FINISHED loop, per
//! spec.md §4.7. Generalizes the teacher's `Worker` (this file, in
//! `examples/xzhseh-MapReduce-rs/src/mr/worker.rs`, a hard-coded word-count
//! loop driven by direct RPCs to the Coordinator) into a worker that is
//! owned by a `Master` and talks to it over the in-process channel pair
//! described in SPEC_FULL.md §4.6 [AMBIENT], standing in for the forked
//! Intercommunicator of `examples/original_source/src/mux.py` /
//! `src/worker.py`.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::mr::function::{FileIdAllocator, Mapper, Reducer};
use crate::mr::merge::intermediate_file_path;
use crate::mr::message::{WorkPayload, WorkerCommand, WorkerEvent};

pub struct Worker {
    id: usize,
}

impl Worker {
    pub fn new(id: usize) -> Self {
        Self { id }
    }

    /// Drives this worker's command channel until it receives `Quit`. Every
    /// iteration starts by reporting `Available`, mirroring spec.md §4.7's
    /// step 1; the Master replies with exactly one `WorkerCommand`.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<WorkerCommand>,
        events: mpsc::Sender<WorkerEvent>,
        mapper: Arc<dyn Mapper>,
        reducer: Arc<dyn Reducer>,
        output_dir: PathBuf,
        num_reducer: usize,
        file_ids: Arc<FileIdAllocator>,
    ) {
        if events.send(WorkerEvent::Available(self.id)).await.is_err() {
            return;
        }

        while let Some(command) = commands.recv().await {
            match command {
                WorkerCommand::ComputeMap(item) => {
                    let WorkPayload::Map { input_path, doc_id } = item.payload else {
                        warn!(worker = self.id, "ComputeMap command carried a non-map payload");
                        continue;
                    };

                    let result = mapper
                        .execute(
                            std::path::Path::new(&input_path),
                            doc_id,
                            &output_dir,
                            num_reducer,
                            &file_ids,
                        )
                        .await;

                    match result {
                        Ok((info, outputs)) => {
                            let sent = events
                                .send(WorkerEvent::FinishedMap { worker: self.id, tag: item.tag, info, outputs })
                                .await;
                            if sent.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            // spec.md §7: a failed map subprocess surfaces as an
                            // empty output list, not a crash; the Coordinator
                            // still accepts the (empty) finish.
                            error!(worker = self.id, tag = item.tag, error = %err, "map task failed");
                            let sent = events
                                .send(WorkerEvent::FinishedMap {
                                    worker: self.id,
                                    tag: item.tag,
                                    info: Default::default(),
                                    outputs: Vec::new(),
                                })
                                .await;
                            if sent.is_err() {
                                return;
                            }
                        }
                    }

                    if events.send(WorkerEvent::Available(self.id)).await.is_err() {
                        return;
                    }
                }

                WorkerCommand::ComputeReduce(item) => {
                    let WorkPayload::Reduce { reducer_index, file_ids: inputs } = item.payload else {
                        warn!(worker = self.id, "ComputeReduce command carried a non-reduce payload");
                        continue;
                    };

                    let input_paths: Vec<(u64, PathBuf)> = inputs
                        .iter()
                        .map(|fid| (*fid, intermediate_file_path(&output_dir, reducer_index, *fid)))
                        .collect();

                    match reducer.execute(reducer_index, &input_paths, &output_dir, &file_ids).await {
                        Ok((info, out_file_id, out_size)) => {
                            let sent = events
                                .send(WorkerEvent::FinishedReduce {
                                    worker: self.id,
                                    tag: item.tag,
                                    reducer_index,
                                    info,
                                    output: (out_file_id, out_size),
                                    inputs,
                                })
                                .await;
                            if sent.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            error!(worker = self.id, tag = item.tag, error = %err, "reduce task failed");
                        }
                    }

                    if events.send(WorkerEvent::Available(self.id)).await.is_err() {
                        return;
                    }
                }

                WorkerCommand::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    if events.send(WorkerEvent::Available(self.id)).await.is_err() {
                        return;
                    }
                }

                WorkerCommand::Quit => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mr::function::{WordCountMapper, WordCountReducer};
    use crate::mr::message::WorkItem;
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn runs_a_map_then_reports_available_again() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("doc.txt");
        tokio::fs::write(&input, "alpha beta alpha").await.unwrap();

        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (ev_tx, mut ev_rx) = mpsc::channel(8);

        let worker = Worker::new(0);
        let handle = tokio::spawn(worker.run(
            cmd_rx,
            ev_tx,
            Arc::new(WordCountMapper),
            Arc::new(WordCountReducer),
            dir.path().to_path_buf(),
            2,
            Arc::new(FileIdAllocator::new(1, 0)),
        ));

        assert!(matches!(ev_rx.recv().await.unwrap(), WorkerEvent::Available(0)));

        cmd_tx
            .send(WorkerCommand::ComputeMap(WorkItem::map(1, input.to_string_lossy().into_owned(), 0)))
            .await
            .unwrap();

        let finished = ev_rx.recv().await.unwrap();
        assert!(matches!(finished, WorkerEvent::FinishedMap { tag: 1, .. }));
        assert!(matches!(ev_rx.recv().await.unwrap(), WorkerEvent::Available(0)));

        cmd_tx.send(WorkerCommand::Quit).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn sleep_command_reports_available_when_done() {
        let dir = tempdir().unwrap();
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (ev_tx, mut ev_rx) = mpsc::channel(8);

        let worker = Worker::new(3);
        let handle = tokio::spawn(worker.run(
            cmd_rx,
            ev_tx,
            Arc::new(WordCountMapper),
            Arc::new(WordCountReducer),
            dir.path().to_path_buf(),
            1,
            Arc::new(FileIdAllocator::new(1, 3)),
        ));

        assert!(matches!(ev_rx.recv().await.unwrap(), WorkerEvent::Available(3)));
        cmd_tx.send(WorkerCommand::Sleep(StdDuration::from_millis(1))).await.unwrap();
        assert!(matches!(ev_rx.recv().await.unwrap(), WorkerEvent::Available(3)));

        cmd_tx.send(WorkerCommand::Quit).await.unwrap();
        handle.await.unwrap();
    }
}
