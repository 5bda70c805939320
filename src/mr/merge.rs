//! The intermediate file format and its streaming k-way merge, per
//! spec.md §6:
//!
//! ```text
//! record = termLen:u32 | term:bytes[termLen] | numTuples:u32
//!        | (docId:u32, occurrences:u32) x numTuples | 0x0A
//! ```
//!
//! Intermediate files are named `output-r{reducerIndex:06}-p{fileId}`; the
//! fileId is recovered by splitting the basename on `-` and stripping the
//! leading `p`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub fn intermediate_file_name(reducer_index: usize, file_id: u64) -> String {
    format!("output-r{reducer_index:06}-p{file_id}")
}

pub fn intermediate_file_path(dir: &Path, reducer_index: usize, file_id: u64) -> PathBuf {
    dir.join(intermediate_file_name(reducer_index, file_id))
}

/// Recover the fileId encoded in an intermediate file name.
pub fn file_id_from_name(name: &str) -> Option<u64> {
    let p_field = name.split('-').nth(2)?;
    p_field.strip_prefix('p')?.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub term: String,
    /// `(docId, occurrences)` tuples, in the order written.
    pub tuples: Vec<(u32, u32)>,
}

/// Reads `Record`s sequentially from one intermediate file.
pub struct RecordReader<R> {
    inner: BufReader<R>,
}

impl RecordReader<File> {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self { inner: BufReader::new(File::open(path)?) })
    }
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self { inner: BufReader::new(reader) }
    }

    pub fn read_record(&mut self) -> io::Result<Option<Record>> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let term_len = u32::from_le_bytes(len_buf) as usize;

        let mut term_buf = vec![0u8; term_len];
        self.inner.read_exact(&mut term_buf)?;
        let term = String::from_utf8(term_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut count_buf = [0u8; 4];
        self.inner.read_exact(&mut count_buf)?;
        let num_tuples = u32::from_le_bytes(count_buf) as usize;

        let mut tuples = Vec::with_capacity(num_tuples);
        for _ in 0..num_tuples {
            let mut doc_buf = [0u8; 4];
            let mut occ_buf = [0u8; 4];
            self.inner.read_exact(&mut doc_buf)?;
            self.inner.read_exact(&mut occ_buf)?;
            tuples.push((u32::from_le_bytes(doc_buf), u32::from_le_bytes(occ_buf)));
        }

        let mut newline = [0u8; 1];
        self.inner.read_exact(&mut newline)?;
        debug_assert_eq!(newline[0], b'\n');

        Ok(Some(Record { term, tuples }))
    }
}

/// Writes `Record`s one at a time. Tuples are appended as they are merged
/// and the record's `numTuples` field is patched in place once the record
/// is finished, matching the original's seek-back finalization.
pub struct RecordWriter<W> {
    inner: W,
    count_field_pos: Option<u64>,
    tuple_count: u32,
    bytes_written: u64,
}

impl RecordWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self { inner: BufWriter::new(File::create(path)?), count_field_pos: None, tuple_count: 0, bytes_written: 0 })
    }
}

impl<W: Write + Seek> RecordWriter<W> {
    pub fn start_record(&mut self, term: &str) -> io::Result<()> {
        debug_assert!(self.count_field_pos.is_none(), "previous record not finished");

        let term_bytes = term.as_bytes();
        self.inner.write_all(&(term_bytes.len() as u32).to_le_bytes())?;
        self.inner.write_all(term_bytes)?;

        self.count_field_pos = Some(self.inner.stream_position()?);
        self.inner.write_all(&0u32.to_le_bytes())?;
        self.tuple_count = 0;

        Ok(())
    }

    pub fn write_tuple(&mut self, doc_id: u32, occurrences: u32) -> io::Result<()> {
        debug_assert!(self.count_field_pos.is_some(), "start_record not called");
        self.inner.write_all(&doc_id.to_le_bytes())?;
        self.inner.write_all(&occurrences.to_le_bytes())?;
        self.tuple_count += 1;
        Ok(())
    }

    pub fn finish_record(&mut self) -> io::Result<()> {
        let count_pos = self.count_field_pos.take().expect("start_record not called");
        let end_pos = self.inner.stream_position()?;

        self.inner.seek(SeekFrom::Start(count_pos))?;
        self.inner.write_all(&self.tuple_count.to_le_bytes())?;
        self.inner.seek(SeekFrom::Start(end_pos))?;
        self.inner.write_all(b"\n")?;

        self.bytes_written = end_pos + 5;
        Ok(())
    }

    pub fn write_whole_record(&mut self, record: &Record) -> io::Result<()> {
        self.start_record(&record.term)?;
        for (doc_id, occurrences) in &record.tuples {
            self.write_tuple(*doc_id, *occurrences)?;
        }
        self.finish_record()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[derive(Eq, PartialEq)]
struct HeapEntry {
    term: String,
    source: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.term.cmp(&other.term).then(self.source.cmp(&other.source))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Streaming k-way merge over `inputs` (each assumed sorted by term, as
/// emitted by the mapper), writing the combined, still-sorted result to
/// `output`. Tuples with the same `(term, docId)` have their occurrences
/// summed; tuples with the same term but different docId are appended.
///
/// Returns the number of bytes written to `output`.
pub fn k_way_merge(inputs: &[PathBuf], output: &Path) -> io::Result<u64> {
    let mut readers: Vec<RecordReader<File>> =
        inputs.iter().map(|p| RecordReader::open(p)).collect::<io::Result<_>>()?;

    let mut pending: Vec<Option<Record>> = Vec::with_capacity(readers.len());
    let mut heap = BinaryHeap::new();

    for (idx, reader) in readers.iter_mut().enumerate() {
        let record = reader.read_record()?;
        if let Some(r) = &record {
            heap.push(Reverse(HeapEntry { term: r.term.clone(), source: idx }));
        }
        pending.push(record);
    }

    let mut writer = RecordWriter::create(output)?;

    while let Some(Reverse(HeapEntry { term, .. })) = heap.pop() {
        // Every source currently holding this term contributes to one
        // merged record; sortedness guarantees no source will ever produce
        // this term again once it advances past it.
        let mut merged: Vec<(u32, u32)> = Vec::new();
        let mut doc_positions: std::collections::HashMap<u32, usize> = std::collections::HashMap::new();

        let mut sources_with_term = vec![];
        for (idx, record) in pending.iter().enumerate() {
            if matches!(record, Some(r) if r.term == term) {
                sources_with_term.push(idx);
            }
        }

        for idx in &sources_with_term {
            let record = pending[*idx].take().unwrap();
            for (doc_id, occ) in record.tuples {
                if let Some(&pos) = doc_positions.get(&doc_id) {
                    merged[pos].1 += occ;
                } else {
                    doc_positions.insert(doc_id, merged.len());
                    merged.push((doc_id, occ));
                }
            }

            let next = readers[*idx].read_record()?;
            if let Some(r) = &next {
                heap.push(Reverse(HeapEntry { term: r.term.clone(), source: *idx }));
            }
            pending[*idx] = next;
        }

        writer.write_whole_record(&Record { term, tuples: merged })?;
    }

    let mut inner = writer.into_inner();
    inner.flush()?;
    Ok(inner.stream_position()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, records: &[Record]) -> PathBuf {
        let path = dir.join(name);
        let mut w = RecordWriter::create(&path).unwrap();
        for r in records {
            w.write_whole_record(r).unwrap();
        }
        w.into_inner().flush().unwrap();
        path
    }

    fn read_all(path: &Path) -> Vec<Record> {
        let mut reader = RecordReader::open(path).unwrap();
        let mut out = Vec::new();
        while let Some(r) = reader.read_record().unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn merges_same_term_different_docs() {
        let dir = tempdir().unwrap();
        let a = write_file(
            dir.path(),
            "a",
            &[Record { term: "cat".into(), tuples: vec![(1, 3)] }],
        );
        let b = write_file(
            dir.path(),
            "b",
            &[Record { term: "cat".into(), tuples: vec![(2, 5)] }],
        );

        let out = dir.path().join("merged");
        k_way_merge(&[a, b], &out).unwrap();

        let records = read_all(&out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].term, "cat");
        let mut tuples = records[0].tuples.clone();
        tuples.sort();
        assert_eq!(tuples, vec![(1, 3), (2, 5)]);
    }

    #[test]
    fn sums_same_term_same_doc() {
        let dir = tempdir().unwrap();
        let a = write_file(dir.path(), "a", &[Record { term: "dog".into(), tuples: vec![(1, 2)] }]);
        let b = write_file(dir.path(), "b", &[Record { term: "dog".into(), tuples: vec![(1, 7)] }]);

        let out = dir.path().join("merged");
        k_way_merge(&[a, b], &out).unwrap();

        let records = read_all(&out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tuples, vec![(1, 9)]);
    }

    #[test]
    fn keeps_distinct_terms_sorted() {
        let dir = tempdir().unwrap();
        let a = write_file(
            dir.path(),
            "a",
            &[
                Record { term: "ant".into(), tuples: vec![(1, 1)] },
                Record { term: "zebra".into(), tuples: vec![(1, 1)] },
            ],
        );
        let b = write_file(dir.path(), "b", &[Record { term: "mouse".into(), tuples: vec![(2, 1)] }]);

        let out = dir.path().join("merged");
        k_way_merge(&[a, b], &out).unwrap();

        let terms: Vec<_> = read_all(&out).into_iter().map(|r| r.term).collect();
        assert_eq!(terms, vec!["ant", "mouse", "zebra"]);
    }

    #[test]
    fn recovers_file_id_from_name() {
        assert_eq!(file_id_from_name("output-r000003-p42"), Some(42));
    }

    #[test]
    fn merge_output_is_order_independent_of_input_order() {
        let dir = tempdir().unwrap();
        let a = write_file(dir.path(), "a", &[Record { term: "cat".into(), tuples: vec![(1, 3)] }]);
        let b = write_file(dir.path(), "b", &[Record { term: "cat".into(), tuples: vec![(2, 5)] }]);

        let out1 = dir.path().join("m1");
        let out2 = dir.path().join("m2");
        k_way_merge(&[a.clone(), b.clone()], &out1).unwrap();
        k_way_merge(&[b, a], &out2).unwrap();

        let r1 = read_all(&out1);
        let mut r2 = read_all(&out2);
        r2[0].tuples.sort();
        let mut r1_sorted = r1;
        r1_sorted[0].tuples.sort();
        assert_eq!(r1_sorted, r2);
    }
}
