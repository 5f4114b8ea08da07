use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{bail, Context, Result};
use chrono::Local;

use crate::logger::Logger;
use crate::mail::Mail;

/// Writes accepted messages as uniquely-named flat files in one directory.
/// The sequence counter is the only globally-ordered resource in the
/// process; it disambiguates artifacts accepted within the same second.
pub struct Storage {
    dir: PathBuf,
    sequence: AtomicI64,
}

impl Storage {
    /// Validates the save directory up front so a bad path fails the
    /// process before any listener opens.
    pub fn new(dir: &Path) -> Result<Self> {
        match std::fs::metadata(dir) {
            Ok(stat) => {
                if !stat.is_dir() {
                    bail!("{:?} exists but is not a directory", dir);
                }
            }
            Err(_) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create save directory {:?}", dir))?;
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            sequence: AtomicI64::new(0),
        })
    }

    fn next_path(&self) -> PathBuf {
        let sequence = (self.sequence.fetch_add(1, Ordering::SeqCst) + 1) % 100_000;
        let name = format!(
            "{}-{:06}.eml",
            Local::now().format("%Y-%m-%dT%H:%M:%S"),
            sequence
        );
        self.dir.join(name)
    }

    /// Persists one accepted message and reports (path, bytes written).
    ///
    /// The 250 acceptance has already gone out by the time this runs, so a
    /// write failure is logged and reported as zero bytes rather than
    /// surfaced to the client. The size is taken from the filesystem after
    /// the file is closed.
    pub async fn save(&self, mail: &Mail, logger: &Logger) -> (PathBuf, u64) {
        let path = self.next_path();
        let mut content = Vec::new();
        if let Err(e) = mail.write_to(&mut content) {
            logger.log(&format!("Failed to serialize message: {}", e));
            return (path, 0);
        }
        if let Err(e) = tokio::fs::write(&path, &content).await {
            logger.log(&format!("Failed to create {:?}: {}", path, e));
            return (path, 0);
        }
        let written = tokio::fs::metadata(&path)
            .await
            .map(|stat| stat.len())
            .unwrap_or(0);
        (path, written)
    }
}
