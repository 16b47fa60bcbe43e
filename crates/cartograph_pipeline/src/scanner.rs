//! Directory scanning.
//!
//! Walks the target with the standard ignore rules (hidden files, VCS
//! directories, .gitignore), hashes file contents, and upserts file rows.
//! Unchanged, already-analyzed files are skipped, which is what makes a
//! re-run of the whole pipeline idempotent end to end.

use ignore::WalkBuilder;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use cartograph_db::store::ScanOutcome;
use cartograph_db::PipelineStore;
use cartograph_protocol::ids::content_hash;

use crate::error::{PipelineError, Result};

/// Extensions treated as source code. Everything else is skipped.
const SOURCE_EXTENSIONS: [&str; 18] = [
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "rb", "c", "h", "cpp", "hpp", "cs",
    "sql", "php", "kt", "swift",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub files_discovered: u64,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unchanged: u64,
    pub files_errored: u64,
    pub bytes_scanned: u64,
}

impl ScanStats {
    /// Files that need (re-)analysis.
    pub fn files_to_process(&self) -> u64 {
        self.files_new + self.files_changed
    }
}

pub struct Scanner {
    store: PipelineStore,
}

impl Scanner {
    pub fn new(store: PipelineStore) -> Self {
        Self { store }
    }

    /// Scan a directory tree, upserting file rows and per-directory
    /// summaries.
    pub async fn scan(&self, target: &Path) -> Result<ScanStats> {
        if !target.is_dir() {
            return Err(PipelineError::Invalid(format!(
                "target is not a directory: {}",
                target.display()
            )));
        }

        let mut stats = ScanStats::default();
        let mut dir_files: HashMap<String, (i64, i64)> = HashMap::new();

        for entry in WalkBuilder::new(target).build() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Walk error");
                    stats.files_errored += 1;
                    continue;
                }
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            if !is_source_file(path) {
                continue;
            }

            let bytes = match std::fs::read(path) {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Read failed");
                    stats.files_errored += 1;
                    continue;
                }
            };

            let path_str = path.to_string_lossy().to_string();
            let hash = content_hash(&bytes);
            let size = bytes.len() as i64;

            stats.files_discovered += 1;
            stats.bytes_scanned += size as u64;

            match self.store.upsert_scanned_file(&path_str, &hash, size).await? {
                ScanOutcome::New => stats.files_new += 1,
                ScanOutcome::Changed => stats.files_changed += 1,
                ScanOutcome::Unchanged => stats.files_unchanged += 1,
            }

            let parent = path
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            let slot = dir_files.entry(parent).or_insert((0, 0));
            slot.0 += 1;
            slot.1 += size;
        }

        for (dir, (count, bytes)) in &dir_files {
            self.store
                .upsert_directory_summary(dir, *count, *bytes)
                .await?;
        }

        info!(
            discovered = stats.files_discovered,
            new = stats.files_new,
            changed = stats.files_changed,
            unchanged = stats.files_unchanged,
            "Scan complete"
        );
        Ok(stats)
    }
}

fn is_source_file(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let matched = SOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str());
    if !matched {
        debug!(path = %path.display(), "Skipping non-source file");
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_db::CartographDb;
    use cartograph_protocol::FileStatus;
    use std::fs;

    async fn scan_dir(dir: &Path) -> (CartographDb, ScanStats) {
        let db = CartographDb::connect_memory().await.unwrap();
        let scanner = Scanner::new(db.store());
        let stats = scanner.scan(dir).await.unwrap();
        (db, stats)
    }

    #[tokio::test]
    async fn test_scan_discovers_source_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("util.py"), "def f(): pass").unwrap();
        fs::write(dir.path().join("notes.txt"), "not source").unwrap();

        let (db, stats) = scan_dir(dir.path()).await;
        assert_eq!(stats.files_discovered, 2);
        assert_eq!(stats.files_new, 2);

        let pending = db
            .store()
            .files_with_status(FileStatus::Pending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_rescan_skips_analyzed_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.rs");
        fs::write(&file, "fn main() {}").unwrap();

        let db = CartographDb::connect_memory().await.unwrap();
        let scanner = Scanner::new(db.store());
        scanner.scan(dir.path()).await.unwrap();

        // Simulate a completed analysis, then rescan
        let path = file.to_string_lossy().to_string();
        db.store().record_file_analysis(&path, &[]).await.unwrap();

        let stats = scanner.scan(dir.path()).await.unwrap();
        assert_eq!(stats.files_unchanged, 1);
        assert_eq!(stats.files_to_process(), 0);

        // Changed content requires re-analysis
        fs::write(&file, "fn main() { panic!() }").unwrap();
        let stats = scanner.scan(dir.path()).await.unwrap();
        assert_eq!(stats.files_changed, 1);
    }

    #[tokio::test]
    async fn test_scan_rejects_missing_target() {
        let db = CartographDb::connect_memory().await.unwrap();
        let scanner = Scanner::new(db.store());
        let err = scanner.scan(Path::new("/nonexistent-cartograph")).await;
        assert!(err.is_err());
    }
}
