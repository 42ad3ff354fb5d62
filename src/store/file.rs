//! File-backed run store.
//!
//! Layout:
//!
//! ```text
//! <root>/runs/<run_id>/run.json
//! <root>/runs/<run_id>/results/<dimension_id>.json
//! <root>/sessions/<session_id>.lock
//! ```
//!
//! Ids are escaped with [`encode_component`], so distinct ids always map to
//! distinct paths.

use super::{ensure_mutable, RunStore, StoreError};
use crate::models::{DimensionResult, Run};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// [`RunStore`] that keeps one JSON document per run and per result.
pub struct FileRunStore {
    root: PathBuf,
    /// Serializes read-modify-write of run documents.
    write_lock: Mutex<()>,
}

impl FileRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(encode_component(run_id))
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn lock_file(&self, session_id: &str) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}.lock", encode_component(session_id)))
    }

    fn run_file(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    fn results_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("results")
    }

    async fn read_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        read_run_at(&self.run_file(run_id)).await
    }

    async fn read_holder(&self, session_id: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.lock_file(session_id)).await {
            Ok(holder) => Ok(Some(holder.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// A holder whose run is not on disk yet is still creating it.
    async fn holds_live_run(&self, holder: &str) -> Result<bool, StoreError> {
        Ok(self
            .read_run(holder)
            .await?
            .map_or(true, |run| run.is_active()))
    }

    /// Publish a complete lock file in one step: the content goes to a temp
    /// file first and is then hard-linked into place, which fails if the lock
    /// already exists.
    async fn try_lock(&self, path: &Path, run_id: &str) -> Result<bool, StoreError> {
        let tmp = path.with_extension(format!("{}.tmp", encode_component(run_id)));
        fs::write(&tmp, run_id).await?;
        let linked = fs::hard_link(&tmp, path).await;
        if let Err(e) = fs::remove_file(&tmp).await {
            debug!("Could not remove {}: {}", tmp.display(), e);
        }
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temp file so readers never see a partial document.
    async fn write_run(&self, run: &Run) -> Result<(), StoreError> {
        let path = self.run_file(&run.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(run)?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

async fn read_run_at(path: &Path) -> Result<Option<Run>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Escape an id into a single path component.
///
/// ASCII letters, digits and `-` pass through. Every other byte, `_`
/// included, becomes `_` plus two hex digits, so the mapping is one-to-one
/// and never yields `.`, `..` or a separator.
fn encode_component(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
    out
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(self.results_dir(&run.id))
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", self.root.display(), e)))?;
        self.write_run(run).await?;
        debug!("Created run {} in {}", run.id, self.root.display());
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let stored = self.read_run(&run.id).await?.ok_or_else(|| StoreError::NotFound {
            run_id: run.id.clone(),
        })?;
        ensure_mutable(&stored)?;
        self.write_run(run).await
    }

    async fn append_result(&self, result: &DimensionResult) -> Result<(), StoreError> {
        let dir = self.results_dir(&result.run_id);
        if fs::metadata(&dir).await.is_err() {
            return Err(StoreError::NotFound {
                run_id: result.run_id.clone(),
            });
        }

        let path = dir.join(format!("{}.json", encode_component(&result.dimension_id)));
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::DuplicateResult {
                    run_id: result.run_id.clone(),
                    dimension_id: result.dimension_id.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        file.write_all(&serde_json::to_vec_pretty(result)?).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        self.read_run(run_id).await
    }

    async fn results_for_run(&self, run_id: &str) -> Result<Vec<DimensionResult>, StoreError> {
        let mut entries = match fs::read_dir(self.results_dir(run_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut results = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<DimensionResult>(&bytes) {
                Ok(result) => results.push(result),
                Err(e) => warn!("Skipping unreadable result {}: {}", path.display(), e),
            }
        }

        results.sort_by_key(|r| r.recorded_at);
        Ok(results)
    }

    async fn runs_for_session(&self, session_id: &str) -> Result<Vec<Run>, StoreError> {
        let mut entries = match fs::read_dir(self.runs_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join("run.json");
            match read_run_at(&path).await {
                Ok(Some(run)) if run.session_id == session_id => runs.push(run),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable run {}: {}", path.display(), e),
            }
        }

        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    async fn claim_session(&self, session_id: &str, run_id: &str) -> Result<Option<String>, StoreError> {
        fs::create_dir_all(self.sessions_dir())
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", self.root.display(), e)))?;
        let path = self.lock_file(session_id);

        // Retried only after the lock vanished or a stale one was cleared.
        for _ in 0..3 {
            if self.try_lock(&path, run_id).await? {
                debug!("Session {} claimed by run {}", session_id, run_id);
                return Ok(None);
            }

            let Some(holder) = self.read_holder(session_id).await? else {
                continue;
            };
            if holder == run_id {
                return Ok(None);
            }
            if self.holds_live_run(&holder).await? {
                return Ok(Some(holder));
            }

            warn!(
                "Clearing stale claim on session {} left by finished run {}",
                session_id, holder
            );
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Unavailable(format!(
            "could not claim session {} in {}",
            session_id,
            self.root.display()
        )))
    }

    async fn release_session(&self, session_id: &str, run_id: &str) -> Result<(), StoreError> {
        if self.read_holder(session_id).await?.as_deref() != Some(run_id) {
            return Ok(());
        }
        match fs::remove_file(self.lock_file(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
