//! The WorkQueue merges the application's input generator with a recycle
//! list ("dead list") of map payloads that must be retried after a master
//! disconnect. See spec.md §4.2 and
//! `examples/original_source/src/server.py: WorkQueue`.

use crate::mr::message::{Tag, WorkItem};

/// `(path, docId)` pair produced by the application-supplied input
/// generator. THE CORE treats the generator itself as an external
/// collaborator (spec.md §1); `WorkQueue` only needs something that yields
/// these pairs.
pub type InputPair = (String, i64);

/// spec.md §9's "Python input module loaded dynamically" becomes a
/// registered plugin interface with a single method, per SPEC_FULL.md §4.7
/// [SUPPLEMENT]: `inputs() -> iterator of (path, docId)`. The bundled
/// `DirectoryInputSource` below is the default the binaries wire up when no
/// other plugin is configured.
pub trait InputSource: Send {
    fn inputs(self: Box<Self>) -> Box<dyn Iterator<Item = InputPair> + Send>;
}

/// Scans `dir` for files whose name starts with `prefix`, sorts them for a
/// deterministic docId assignment, and yields `(path, index)` pairs.
pub struct DirectoryInputSource {
    pub dir: std::path::PathBuf,
    pub prefix: String,
}

impl InputSource for DirectoryInputSource {
    fn inputs(self: Box<Self>) -> Box<dyn Iterator<Item = InputPair> + Send> {
        let mut paths: Vec<String> = std::fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&self.prefix))
                    .unwrap_or(false)
            })
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
        paths.sort();

        Box::new(paths.into_iter().enumerate().map(|(idx, path)| (path, idx as i64)))
    }
}

/// Prioritized source of MAP work: the generator is drained first, the
/// recycle list backs it up once the generator is exhausted.
pub struct WorkQueue {
    generator: Box<dyn Iterator<Item = InputPair> + Send>,
    dead_list: Vec<InputPair>,
    last_tag: Tag,
}

impl WorkQueue {
    pub fn new(generator: impl Iterator<Item = InputPair> + Send + 'static) -> Self {
        Self { generator: Box::new(generator), dead_list: Vec::new(), last_tag: 0 }
    }

    /// Push a payload back onto the recycle list. Called when a master
    /// holding this payload disconnects before acknowledging it.
    pub fn push(&mut self, payload: InputPair) {
        self.dead_list.push(payload);
    }

    /// Advance the generator; on exhaustion, drain the dead list FIFO; if
    /// both are empty, return `None`. Every emitted item gets a freshly
    /// incremented tag.
    pub fn pop(&mut self) -> Option<WorkItem> {
        if let Some((path, doc_id)) = self.generator.next() {
            self.last_tag += 1;
            return Some(WorkItem::map(self.last_tag, path, doc_id));
        }

        if !self.dead_list.is_empty() {
            let (path, doc_id) = self.dead_list.remove(0);
            self.last_tag += 1;
            return Some(WorkItem::map(self.last_tag, path, doc_id));
        }

        None
    }

    pub fn dead_list_len(&self) -> usize {
        self.dead_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_generator_before_dead_list() {
        let mut q = WorkQueue::new(vec![("a.zip".to_string(), 0), ("b.zip".to_string(), 1)].into_iter());

        let first = q.pop().unwrap();
        assert_eq!(first.tag, 1);

        let second = q.pop().unwrap();
        assert_eq!(second.tag, 2);

        assert!(q.pop().is_none());
    }

    #[test]
    fn recycled_items_are_fifo() {
        let mut q = WorkQueue::new(std::iter::empty());
        q.push(("a.zip".to_string(), 0));
        q.push(("b.zip".to_string(), 1));

        let first = q.pop().unwrap();
        let second = q.pop().unwrap();

        match (first.payload, second.payload) {
            (crate::mr::message::WorkPayload::Map { doc_id: d0, .. }, crate::mr::message::WorkPayload::Map { doc_id: d1, .. }) => {
                assert_eq!(d0, 0);
                assert_eq!(d1, 1);
            }
            _ => panic!("expected map payloads"),
        }
    }

    #[test]
    fn directory_input_source_yields_sorted_deterministic_doc_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("input-b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("input-a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "x").unwrap();

        let source = DirectoryInputSource { dir: dir.path().to_path_buf(), prefix: "input-".to_string() };
        let pairs: Vec<InputPair> = Box::new(source).inputs().collect();

        assert_eq!(pairs.len(), 2);
        assert!(pairs[0].0.ends_with("input-a.txt"));
        assert_eq!(pairs[0].1, 0);
        assert!(pairs[1].0.ends_with("input-b.txt"));
        assert_eq!(pairs[1].1, 1);
    }

    #[test]
    fn tags_are_monotonic_across_recycling() {
        let mut q = WorkQueue::new(vec![("a.zip".to_string(), 0)].into_iter());
        let w1 = q.pop().unwrap();
        q.push(("a.zip".to_string(), 0));
        let w2 = q.pop().unwrap();
        assert!(w2.tag > w1.tag);
    }
}
