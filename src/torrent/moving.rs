use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::download::Torrent;
use super::State;
use crate::storage::StorageError;

impl Torrent {
    /// Moves the payload to a new base directory.
    ///
    /// Each file is hard-linked when the target is on the same
    /// filesystem; a cross-device link error falls back to a copy (the
    /// runtime's copy uses the platform's accelerated path where one
    /// exists). Sources are removed afterwards and emptied directories
    /// pruned. The prior state is restored on success; a failure parks
    /// the torrent in `Error`.
    pub async fn move_to(self: &Arc<Self>, target: PathBuf) -> Result<(), StorageError> {
        let original = self.state();
        if original.matches(State::MOVING | State::CHECKING) {
            return Ok(());
        }
        self.set_state(State::MOVING);

        let source = self.base_path();
        // No pooled handle may pin a source file, and cached pieces must
        // never be served from the old location.
        self.shared.file_pool.purge(&source);
        self.shared.piece_cache.remove_torrent(self.info().hash);

        match self.move_files(&source, &target).await {
            Ok(()) => {
                info!(
                    info_hash = %self.info().hash,
                    to = %target.display(),
                    "move complete"
                );
                self.set_base_path(target);
                self.set_state(original);
                Ok(())
            }
            Err(err) => {
                self.set_error(err);
                Ok(())
            }
        }
    }

    async fn move_files(&self, source: &Path, target: &Path) -> Result<(), StorageError> {
        for entry in &self.info().files {
            let src = source.join(&entry.path);
            let dst = target.join(&entry.path);

            if tokio::fs::metadata(&src).await.is_err() {
                // Never materialised; nothing to carry over.
                continue;
            }
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            match tokio::fs::hard_link(&src, &dst).await {
                Ok(()) => {}
                Err(err) => {
                    debug!(
                        src = %src.display(),
                        error = %err,
                        "hard link failed, copying"
                    );
                    let copied = tokio::fs::copy(&src, &dst).await?;
                    self.io_down.record(copied as usize);
                }
            }
        }

        for entry in &self.info().files {
            let _ = tokio::fs::remove_file(source.join(&entry.path)).await;
        }
        let _ = prune_empty_dirs(source).await;

        Ok(())
    }
}

/// Removes directories under `root` (and `root` itself) that ended up
/// empty, deepest first.
async fn prune_empty_dirs(root: &Path) -> std::io::Result<()> {
    let mut dirs = vec![root.to_path_buf()];
    let mut index = 0;

    while index < dirs.len() {
        let dir = dirs[index].clone();
        index += 1;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
    }

    for dir in dirs.iter().rev() {
        let _ = tokio::fs::remove_dir(dir).await;
    }
    Ok(())
}
