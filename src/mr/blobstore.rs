//! The optional distributed filesystem is treated as an opaque blob store
//! per spec.md §1: `import(path)` / `download(name)` / `nuke(name)`. The
//! implementation that talks to a real DFS is genuinely out of scope; this
//! module only carries the hook point so `dfs-enabled` has somewhere to
//! plug in, mirroring `examples/original_source/src/server.py`'s
//! `try: from filesystem import Filesystem` fallback.

use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn import(&self, path: &Path, name: &str) -> anyhow::Result<()>;
    async fn download(&self, name: &str) -> anyhow::Result<()>;
    async fn nuke(&self, name: &str) -> anyhow::Result<()>;
}

/// Used whenever `dfs-enabled` is false: intermediate files live on a
/// filesystem shared by convention (e.g. NFS) and are managed with plain
/// `std::fs` calls by the caller instead.
pub struct NullBlobStore;

#[async_trait]
impl BlobStore for NullBlobStore {
    async fn import(&self, _path: &Path, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn download(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn nuke(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
