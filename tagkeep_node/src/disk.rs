//! Disk usage probes for the registry storage directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

/// Reports bytes used by the registry's storage.
#[async_trait]
pub trait DiskProbe: Send + Sync {
    async fn used_bytes(&self) -> anyhow::Result<u64>;
}

/// Recursively sums the sizes of non-directory entries. Accurate but
/// O(files); entries that fail to stat are skipped, so the total may be
/// partial.
#[derive(Debug, Clone)]
pub struct WalkProbe {
    dir: PathBuf,
}

impl WalkProbe {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl DiskProbe for WalkProbe {
    async fn used_bytes(&self) -> anyhow::Result<u64> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let mut total: u64 = 0;
            for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_dir() {
                    continue;
                }
                if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                }
            }
            Ok(total)
        })
        .await
        .map_err(|e| anyhow::anyhow!("disk walk task failed: {}", e))?
    }
}

/// O(1) probe via statvfs: `(blocks - free blocks) * fragment size`.
///
/// This measures the *entire filesystem* containing the directory, not
/// just the registry tree. The mount must be dedicated to the registry
/// for the number to mean anything.
#[derive(Debug, Clone)]
pub struct StatfsProbe {
    dir: PathBuf,
}

impl StatfsProbe {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl DiskProbe for StatfsProbe {
    async fn used_bytes(&self) -> anyhow::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(self.dir.as_path())?;
        let used_blocks = stat.blocks().saturating_sub(stat.blocks_free());
        Ok(used_blocks as u64 * stat.fragment_size() as u64)
    }
}
