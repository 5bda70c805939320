//! Map and reduce function plugins.
//!
//! spec.md keeps the user-supplied map and reduce executables out of scope
//! as a feature to fully reimplement; `Mapper`/`Reducer` below are the
//! pluggable contract both the in-process and external-executable paths
//! honor, generalizing the teacher's hard-coded `wc` module (this file, in
//! `examples/xzhseh-MapReduce-rs/src/mr/function.rs`) into the original's
//! abstract `Mapper`/`Reducer` `execute()` contract
//! (`examples/original_source/src/mapper.py`, `src/reducer.py`).

use crate::mr::merge::{intermediate_file_path, k_way_merge, RecordWriter};
use crate::mr::message::{FileId, IntermediateFile, ReducerIndex, TaskInfo};
use async_trait::async_trait;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Allocates file ids unique across the run by combining a master/worker
/// identity with a local sequence. spec.md requires only that a fileId be
/// globally unique and recoverable from the file name (§3); since file ids
/// are minted locally by workers without a round trip to the Coordinator,
/// uniqueness rests on the (masterUniqueId, workerId) pair being unique.
pub struct FileIdAllocator {
    base: u64,
    counter: AtomicU64,
}

impl FileIdAllocator {
    pub fn new(master_unique_id: u64, worker_id: u64) -> Self {
        Self { base: (master_unique_id << 32) | (worker_id << 16), counter: AtomicU64::new(0) }
    }

    pub fn next(&self) -> FileId {
        self.base + self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
pub trait Mapper: Send + Sync {
    /// Read `input_path`, partition its output by reducer index, write one
    /// intermediate file per non-empty partition under `output_dir`, and
    /// report the produced files.
    async fn execute(
        &self,
        input_path: &Path,
        doc_id: i64,
        output_dir: &Path,
        num_reducers: usize,
        file_ids: &FileIdAllocator,
    ) -> anyhow::Result<(TaskInfo, Vec<IntermediateFile>)>;
}

#[async_trait]
pub trait Reducer: Send + Sync {
    /// Merge `inputs` (all belonging to `reducer_index`) into one combined
    /// intermediate file and report it.
    async fn execute(
        &self,
        reducer_index: ReducerIndex,
        inputs: &[(FileId, PathBuf)],
        output_dir: &Path,
        file_ids: &FileIdAllocator,
    ) -> anyhow::Result<(TaskInfo, FileId, u64)>;
}

/// The Framework's bundled word-count application: tokenizes the input
/// file, routes each term to `hash(term) % num_reducers`, and accumulates
/// per-document occurrence counts, a direct generalization of the teacher's
/// `wc::map`/`wc::reduce` to the binary intermediate format of spec.md §6.
pub struct WordCountMapper;

fn reducer_for_term(term: &str, num_reducers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    term.hash(&mut hasher);
    (hasher.finish() % num_reducers as u64) as usize
}

#[async_trait]
impl Mapper for WordCountMapper {
    async fn execute(
        &self,
        input_path: &Path,
        doc_id: i64,
        output_dir: &Path,
        num_reducers: usize,
        file_ids: &FileIdAllocator,
    ) -> anyhow::Result<(TaskInfo, Vec<IntermediateFile>)> {
        let start = Instant::now();
        let contents = tokio::fs::read_to_string(input_path).await?;

        let word_re = Regex::new(r"[A-Za-z0-9']+").unwrap();
        let mut by_reducer: BTreeMap<usize, BTreeMap<String, u32>> = BTreeMap::new();

        for word in word_re.find_iter(&contents) {
            let term = word.as_str().to_lowercase();
            let rid = reducer_for_term(&term, num_reducers);
            *by_reducer.entry(rid).or_default().entry(term).or_insert(0) += 1;
        }

        let mut outputs = Vec::new();
        let mut total_bytes = 0u64;

        for (reducer_index, counts) in by_reducer {
            let file_id = file_ids.next();
            let path = intermediate_file_path(output_dir, reducer_index, file_id);

            let mut writer = RecordWriter::create(&path)?;
            for (term, occurrences) in &counts {
                writer.start_record(term)?;
                writer.write_tuple(doc_id as u32, *occurrences)?;
                writer.finish_record()?;
            }
            drop(writer);

            let size_bytes = tokio::fs::metadata(&path).await?.len();
            total_bytes += size_bytes;
            outputs.push(IntermediateFile { reducer_index, file_id, size_bytes });
        }

        Ok((TaskInfo { total_bytes, elapsed: start.elapsed() }, outputs))
    }
}

pub struct WordCountReducer;

#[async_trait]
impl Reducer for WordCountReducer {
    async fn execute(
        &self,
        reducer_index: ReducerIndex,
        inputs: &[(FileId, PathBuf)],
        output_dir: &Path,
        file_ids: &FileIdAllocator,
    ) -> anyhow::Result<(TaskInfo, FileId, u64)> {
        let start = Instant::now();
        let file_id = file_ids.next();
        let output_path = intermediate_file_path(output_dir, reducer_index, file_id);

        let paths: Vec<PathBuf> = inputs.iter().map(|(_, p)| p.clone()).collect();
        let size_bytes = tokio::task::spawn_blocking({
            let output_path = output_path.clone();
            move || k_way_merge(&paths, &output_path)
        })
        .await??;

        Ok((TaskInfo { total_bytes: size_bytes, elapsed: start.elapsed() }, file_id, size_bytes))
    }
}

/// Drives a user-supplied executable as a child process, per spec.md §4.7
/// and §9: stdout lines prefixed `=> ` report output files as
/// `=> <name> <reducerIndex> <sizeBytes>`.
pub struct ExternalMapper {
    pub executable: PathBuf,
}

#[async_trait]
impl Mapper for ExternalMapper {
    async fn execute(
        &self,
        input_path: &Path,
        doc_id: i64,
        output_dir: &Path,
        num_reducers: usize,
        _file_ids: &FileIdAllocator,
    ) -> anyhow::Result<(TaskInfo, Vec<IntermediateFile>)> {
        let start = Instant::now();

        let output = tokio::process::Command::new(&self.executable)
            .arg(input_path)
            .arg(doc_id.to_string())
            .arg(output_dir)
            .arg(num_reducers.to_string())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut outputs = Vec::new();
        let mut total_bytes = 0u64;

        for line in stdout.lines() {
            if let Some((reducer_index, file_id, size_bytes)) = parse_emitted_line(line) {
                total_bytes += size_bytes;
                outputs.push(IntermediateFile { reducer_index, file_id, size_bytes });
            }
        }

        Ok((TaskInfo { total_bytes, elapsed: start.elapsed() }, outputs))
    }
}

pub struct ExternalReducer {
    pub executable: PathBuf,
}

#[async_trait]
impl Reducer for ExternalReducer {
    async fn execute(
        &self,
        reducer_index: ReducerIndex,
        inputs: &[(FileId, PathBuf)],
        output_dir: &Path,
        _file_ids: &FileIdAllocator,
    ) -> anyhow::Result<(TaskInfo, FileId, u64)> {
        let start = Instant::now();

        let mut command = tokio::process::Command::new(&self.executable);
        command.arg(reducer_index.to_string()).arg(output_dir);
        for (_, path) in inputs {
            command.arg(path);
        }

        let output = command.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let (_, file_id, size_bytes) = stdout
            .lines()
            .find_map(parse_emitted_line)
            .ok_or_else(|| anyhow::anyhow!("reduce executable produced no `=> ` output line"))?;

        Ok((TaskInfo { total_bytes: size_bytes, elapsed: start.elapsed() }, file_id, size_bytes))
    }
}

/// Parses `"=> <name> <reducerIndex> <sizeBytes>"`, recovering the fileId
/// from `<name>` the same way the Coordinator does for on-disk files.
fn parse_emitted_line(line: &str) -> Option<(ReducerIndex, FileId, u64)> {
    let rest = line.strip_prefix("=> ")?;
    let mut parts = rest.split_whitespace();
    let name = parts.next()?;
    let reducer_index: ReducerIndex = parts.next()?.parse().ok()?;
    let size_bytes: u64 = parts.next()?.parse().ok()?;
    let file_id = crate::mr::merge::file_id_from_name(name)?;
    Some((reducer_index, file_id, size_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn word_count_mapper_partitions_by_reducer() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("doc.txt");
        tokio::fs::write(&input, "the quick brown fox the fox").await.unwrap();

        let allocator = FileIdAllocator::new(1, 0);
        let (info, outputs) =
            WordCountMapper.execute(&input, 0, dir.path(), 4, &allocator).await.unwrap();

        assert!(info.total_bytes > 0);
        assert!(!outputs.is_empty());
        for out in &outputs {
            assert!(out.reducer_index < 4);
        }
    }

    #[test]
    fn parses_emitted_line() {
        let parsed = parse_emitted_line("=> output-r000002-p7 2 1024").unwrap();
        assert_eq!(parsed, (2, 7, 1024));
    }

    #[test]
    fn file_id_allocator_is_monotonic_and_distinct_per_worker() {
        let a = FileIdAllocator::new(1, 0);
        let b = FileIdAllocator::new(1, 1);

        let a0 = a.next();
        let a1 = a.next();
        let b0 = b.next();

        assert!(a1 > a0);
        assert_ne!(a0, b0);
    }
}
