//! Content cache index.
//!
//! Maps track ids to transcoded artifacts stored in the cache directory. The
//! index only ever points at files that exist and are larger than the
//! configured minimum; anything else is purged when it is noticed.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use guild_audio_types::CacheEntry;

use crate::config::CacheSettings;
use crate::error::CacheIntegrityError;

/// A validated cache hit.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    pub track_id: String,
    pub path: PathBuf,
    pub entry: CacheEntry,
}

/// Outcome of [`CacheIndex::initialize`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InitReport {
    /// Entries kept from the index file.
    pub loaded: usize,
    /// Entries dropped because their artifact was missing or truncated.
    pub dropped: usize,
    /// Entries recovered by scanning the cache directory.
    pub migrated: usize,
    /// True when the index file was missing or unreadable.
    pub rebuilt: bool,
    /// Leftover temp files from interrupted writes.
    pub temps_removed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

/// Temp file receiving a copy of a stream while it plays.
///
/// Deleted on drop unless it was promoted by [`CacheIndex::finalize`].
#[derive(Debug)]
pub struct TempArtifact {
    track_id: String,
    path: PathBuf,
    file: Option<tokio::fs::File>,
    written: u64,
    committed: bool,
}

impl TempArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Append a chunk to the temp file.
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("temp artifact already closed"))?;
        file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        drop(self.file.take());
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = ?self.path, error = %err, "failed to remove temp artifact");
            }
        }
    }
}

/// Process-wide cache index; share it behind an `Arc`.
pub struct CacheIndex {
    settings: CacheSettings,
    entries: RwLock<BTreeMap<String, CacheEntry>>,
    persist_lock: tokio::sync::Mutex<()>,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheIndex {
    /// Create an empty index; call [`CacheIndex::initialize`] before use.
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            entries: RwLock::new(BTreeMap::new()),
            persist_lock: tokio::sync::Mutex::new(()),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.settings.dir
    }

    /// Deterministic artifact file name for a track id.
    pub fn canonical_name(&self, track_id: &str) -> String {
        format!(
            "{}.{}",
            sanitize_id(track_id),
            self.settings.artifact_extension
        )
    }

    /// Load the index, dropping invalid entries, or rebuild it from the directory.
    ///
    /// Must run before any [`TempArtifact`] is opened: leftover `*.tmp` files
    /// are deleted.
    pub async fn initialize(&self) -> io::Result<InitReport> {
        tokio::fs::create_dir_all(self.dir()).await?;
        let temps_removed = self.remove_stale_temps().await?;
        let index_path = self.settings.index_path();
        let loaded = match tokio::fs::read_to_string(&index_path).await {
            Ok(raw) if raw.trim().is_empty() => Some(BTreeMap::new()),
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, CacheEntry>>(&raw) {
                Ok(map) => Some(map),
                Err(err) => {
                    let err = CacheIntegrityError::Index {
                        path: index_path.clone(),
                        message: err.to_string(),
                    };
                    tracing::warn!(error = %err, "rebuilding cache index");
                    None
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                let err = CacheIntegrityError::Io {
                    path: index_path.clone(),
                    source: err,
                };
                tracing::warn!(error = %err, "rebuilding cache index");
                None
            }
        };

        let mut report = InitReport {
            temps_removed,
            ..InitReport::default()
        };
        let mut valid = BTreeMap::new();
        match loaded {
            Some(map) => {
                for (track_id, mut entry) in map {
                    if !is_plain_file_name(&entry.file) {
                        tracing::warn!(track_id = %track_id, file = %entry.file, "dropping cache entry outside cache dir");
                        report.dropped += 1;
                        continue;
                    }
                    match self.validate(&entry.file).await {
                        Ok(size) => {
                            entry.size = Some(size);
                            valid.insert(track_id, entry);
                            report.loaded += 1;
                        }
                        Err(err) => {
                            tracing::debug!(track_id = %track_id, error = %err, "dropping cache entry");
                            report.dropped += 1;
                        }
                    }
                }
            }
            None => {
                report.rebuilt = true;
                for artifact in self.scan_artifacts().await? {
                    if artifact.size <= self.settings.min_artifact_bytes {
                        continue;
                    }
                    let Some(track_id) = self.extract_track_id(&artifact.file) else {
                        continue;
                    };
                    if valid.contains_key(&track_id) {
                        continue;
                    }
                    valid.insert(
                        track_id,
                        CacheEntry {
                            file: artifact.file,
                            title: None,
                            created_at: artifact.modified_ms,
                            size: Some(artifact.size),
                        },
                    );
                    report.migrated += 1;
                }
            }
        }

        *self.write_entries() = valid;
        self.persist().await;
        tracing::info!(
            dir = %self.dir().display(),
            loaded = report.loaded,
            dropped = report.dropped,
            migrated = report.migrated,
            rebuilt = report.rebuilt,
            temps_removed = report.temps_removed,
            "cache index initialized"
        );
        Ok(report)
    }

    /// Find a playable artifact for `track_id`.
    ///
    /// Checks the index, then the canonical file name, then any artifact whose
    /// name contains the id. Hits found outside the index are added to it.
    pub async fn lookup(&self, track_id: &str) -> Option<CachedArtifact> {
        if !self.settings.enabled || track_id.trim().is_empty() {
            return None;
        }

        let indexed = self.read_entries().get(track_id).cloned();
        if let Some(entry) = indexed {
            match self.validate(&entry.file).await {
                Ok(_) => {
                    tracing::debug!(track_id, file = %entry.file, "cache index hit");
                    return Some(CachedArtifact {
                        track_id: track_id.to_string(),
                        path: self.dir().join(&entry.file),
                        entry,
                    });
                }
                Err(_) => {
                    if let Some(hit) = self.purge_invalid(track_id).await {
                        return Some(hit);
                    }
                }
            }
        }

        let canonical = self.canonical_name(track_id);
        if let Ok(size) = self.validate(&canonical).await {
            tracing::debug!(track_id, file = %canonical, "found canonical cache artifact");
            let modified_ms = modified_ms(&self.dir().join(&canonical)).await;
            return Some(self.backfill(track_id, canonical, size, modified_ms).await);
        }

        let artifacts = match self.scan_artifacts().await {
            Ok(artifacts) => artifacts,
            Err(err) => {
                tracing::warn!(error = %err, "cache directory scan failed");
                return None;
            }
        };
        let found = artifacts.into_iter().find(|artifact| {
            artifact.file.contains(track_id) && artifact.size > self.settings.min_artifact_bytes
        })?;
        tracing::debug!(track_id, file = %found.file, "found cache artifact by scan");
        Some(
            self.backfill(track_id, found.file, found.size, found.modified_ms)
                .await,
        )
    }

    /// Open a uniquely named temp artifact for `track_id`.
    pub async fn begin(&self, track_id: &str) -> io::Result<TempArtifact> {
        tokio::fs::create_dir_all(self.dir()).await?;
        let name = format!(
            "{}.{}.{}.tmp",
            sanitize_id(track_id),
            Uuid::new_v4().simple(),
            self.settings.artifact_extension
        );
        let path = self.dir().join(name);
        let file = tokio::fs::File::create(&path).await?;
        Ok(TempArtifact {
            track_id: track_id.to_string(),
            path,
            file: Some(file),
            written: 0,
            committed: false,
        })
    }

    /// Promote `temp` to the canonical artifact for `track_id`.
    ///
    /// Returns `false` and deletes the temp file when it is missing, too small
    /// or cannot be renamed; the index is left untouched in that case.
    pub async fn finalize(&self, mut temp: TempArtifact, track_id: &str, title: Option<&str>) -> bool {
        let lock = self.write_lock(track_id);
        let committed = {
            let _guard = lock.lock().await;
            self.commit(&mut temp, track_id, title).await
        };
        drop(lock);
        self.release_write_lock(track_id);

        match committed {
            Ok(size) => {
                tracing::info!(track_id, size, "cached artifact saved");
                true
            }
            Err(err) => {
                tracing::info!(track_id, error = %err, "discarding temp artifact");
                drop(temp);
                false
            }
        }
    }

    /// Delete every stored artifact and reset the index.
    pub async fn purge_all(&self) -> io::Result<usize> {
        let index_path = self.settings.index_path();
        let index_tmp = index_tmp_path(&index_path);
        let mut removed = 0usize;
        let mut dir = match tokio::fs::read_dir(self.dir()).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path == index_path || path == index_tmp {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) => tracing::warn!(path = ?path, error = %err, "failed to remove artifact"),
            }
        }
        self.write_entries().clear();
        self.persist().await;
        tracing::info!(removed, "cache purged");
        Ok(removed)
    }

    /// Snapshot of all entries ordered by track id.
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        self.read_entries()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.read_entries();
        CacheStats {
            entries: entries.len(),
            total_bytes: entries.values().filter_map(|e| e.size).sum(),
        }
    }

    /// Recover a track id from an artifact file name.
    pub fn extract_track_id(&self, file_name: &str) -> Option<String> {
        let suffix = format!(".{}", self.settings.artifact_extension);
        let stem = file_name.strip_suffix(&suffix).unwrap_or(file_name);
        let pattern = &self.settings.id_pattern;
        if let Some(found) = pattern.find(stem) {
            if found.start() == 0 && found.end() == stem.len() {
                return Some(stem.to_string());
            }
        }
        pattern.find(stem).map(|m| m.as_str().to_string())
    }

    async fn commit(
        &self,
        temp: &mut TempArtifact,
        track_id: &str,
        title: Option<&str>,
    ) -> Result<u64, CacheIntegrityError> {
        temp.close().await.map_err(|source| CacheIntegrityError::Io {
            path: temp.path.clone(),
            source,
        })?;
        let meta = tokio::fs::metadata(&temp.path)
            .await
            .map_err(|_| CacheIntegrityError::Missing(temp.path.clone()))?;
        let size = meta.len();
        if size <= self.settings.min_artifact_bytes {
            return Err(CacheIntegrityError::Truncated {
                path: temp.path.clone(),
                size,
                min: self.settings.min_artifact_bytes,
            });
        }

        let file = self.canonical_name(track_id);
        let final_path = self.dir().join(&file);
        tokio::fs::rename(&temp.path, &final_path)
            .await
            .map_err(|source| CacheIntegrityError::Io {
                path: final_path.clone(),
                source,
            })?;
        temp.committed = true;

        self.write_entries().insert(
            track_id.to_string(),
            CacheEntry {
                file,
                title: title.map(str::to_string),
                created_at: now_ms(),
                size: Some(size),
            },
        );
        self.persist().await;
        Ok(size)
    }

    /// Drop the index entry for `track_id` if it is still invalid.
    ///
    /// Runs under the track's write lock so a concurrent `finalize` is never
    /// undone; returns the entry when it became valid in the meantime.
    async fn purge_invalid(&self, track_id: &str) -> Option<CachedArtifact> {
        let lock = self.write_lock(track_id);
        let hit = {
            let _guard = lock.lock().await;
            let indexed = self.read_entries().get(track_id).cloned();
            match indexed {
                None => None,
                Some(entry) => match self.validate(&entry.file).await {
                    Ok(_) => Some(CachedArtifact {
                        track_id: track_id.to_string(),
                        path: self.dir().join(&entry.file),
                        entry,
                    }),
                    Err(err) => {
                        tracing::info!(track_id, error = %err, "purging invalid cache entry");
                        if let CacheIntegrityError::Truncated { path, .. } = &err {
                            let _ = tokio::fs::remove_file(path).await;
                        }
                        self.write_entries().remove(track_id);
                        self.persist().await;
                        None
                    }
                },
            }
        };
        drop(lock);
        self.release_write_lock(track_id);
        hit
    }

    async fn remove_stale_temps(&self) -> io::Result<usize> {
        let mut removed = 0usize;
        let mut dir = tokio::fs::read_dir(self.dir()).await?;
        while let Some(entry) = dir.next_entry().await? {
            let Ok(file) = entry.file_name().into_string() else {
                continue;
            };
            if !file.ends_with(".tmp") || !entry.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) => tracing::warn!(file = %file, error = %err, "failed to remove stale temp file"),
            }
        }
        Ok(removed)
    }

    async fn validate(&self, file: &str) -> Result<u64, CacheIntegrityError> {
        let path = self.dir().join(file);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Err(CacheIntegrityError::Missing(path)),
        };
        let size = meta.len();
        if size <= self.settings.min_artifact_bytes {
            return Err(CacheIntegrityError::Truncated {
                path,
                size,
                min: self.settings.min_artifact_bytes,
            });
        }
        Ok(size)
    }

    async fn backfill(&self, track_id: &str, file: String, size: u64, created_at: u64) -> CachedArtifact {
        let entry = CacheEntry {
            file,
            title: None,
            created_at,
            size: Some(size),
        };
        self.write_entries()
            .insert(track_id.to_string(), entry.clone());
        self.persist().await;
        CachedArtifact {
            track_id: track_id.to_string(),
            path: self.dir().join(&entry.file),
            entry,
        }
    }

    async fn scan_artifacts(&self) -> io::Result<Vec<ScannedArtifact>> {
        let suffix = format!(".{}", self.settings.artifact_extension);
        let mut found = Vec::new();
        let mut dir = tokio::fs::read_dir(self.dir()).await?;
        while let Some(entry) = dir.next_entry().await? {
            let Ok(file) = entry.file_name().into_string() else {
                continue;
            };
            if !file.to_ascii_lowercase().ends_with(&suffix) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            found.push(ScannedArtifact {
                file,
                size: meta.len(),
                modified_ms: meta.modified().map(system_time_ms).unwrap_or_else(|_| now_ms()),
            });
        }
        found.sort_by(|a, b| a.file.cmp(&b.file));
        Ok(found)
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.read_entries().clone();
        let index_path = self.settings.index_path();
        let tmp_path = index_tmp_path(&index_path);
        let raw = match serde_json::to_string_pretty(&snapshot) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize cache index");
                return;
            }
        };
        let result = async {
            tokio::fs::write(&tmp_path, raw).await?;
            tokio::fs::rename(&tmp_path, &index_path).await
        }
        .await;
        if let Err(err) = result {
            tracing::warn!(path = ?index_path, error = %err, "failed to save cache index");
        }
    }

    fn write_lock(&self, track_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap_or_else(|err| err.into_inner());
        locks.entry(track_id.to_string()).or_default().clone()
    }

    fn release_write_lock(&self, track_id: &str) {
        let mut locks = self.write_locks.lock().unwrap_or_else(|err| err.into_inner());
        if locks
            .get(track_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(track_id);
        }
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, BTreeMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, BTreeMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(|err| err.into_inner())
    }
}

struct ScannedArtifact {
    file: String,
    size: u64,
    modified_ms: u64,
}

/// Replace characters that are unsafe in file names.
fn sanitize_id(track_id: &str) -> String {
    let cleaned: String = track_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// A bare file name, so joining it never leaves the cache directory.
fn is_plain_file_name(file: &str) -> bool {
    let mut components = Path::new(file).components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    )
}

fn index_tmp_path(index_path: &Path) -> PathBuf {
    let mut name = index_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    index_path.with_file_name(name)
}

async fn modified_ms(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .map(system_time_ms)
        .unwrap_or_else(|_| now_ms())
}

fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_ms() -> u64 {
    system_time_ms(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: u64 = 16;

    fn index_in(dir: &Path) -> CacheIndex {
        let mut settings = CacheSettings::with_dir(dir);
        settings.min_artifact_bytes = MIN;
        CacheIndex::new(settings)
    }

    async fn temp_with(index: &CacheIndex, track_id: &str, len: usize) -> TempArtifact {
        let mut temp = index.begin(track_id).await.unwrap();
        temp.write(&vec![7u8; len]).await.unwrap();
        temp
    }

    #[tokio::test]
    async fn finalize_promotes_temp_and_lookup_hits() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(dir.path());
        index.initialize().await.unwrap();

        let temp = temp_with(&index, "abc", 64).await;
        let temp_path = temp.path().to_path_buf();
        assert!(index.finalize(temp, "abc", Some("Song")).await);

        assert!(!temp_path.exists());
        let hit = index.lookup("abc").await.unwrap();
        assert_eq!(hit.path, dir.path().join("abc.webm"));
        assert_eq!(hit.entry.title.as_deref(), Some("Song"));
        assert_eq!(hit.entry.size, Some(64));

        let raw = std::fs::read_to_string(dir.path().join("index.json")).unwrap();
        let persisted: BTreeMap<String, CacheEntry> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted["abc"].file, "abc.webm");
    }

    #[tokio::test]
    async fn finalize_rejects_truncated_temp() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(dir.path());
        index.initialize().await.unwrap();

        let temp = temp_with(&index, "abc", MIN as usize).await;
        let temp_path = temp.path().to_path_buf();
        assert!(!index.finalize(temp, "abc", None).await);

        assert!(!temp_path.exists());
        assert!(!dir.path().join("abc.webm").exists());
        assert!(index.lookup("abc").await.is_none());
        assert!(index.entries().is_empty());
    }

    #[tokio::test]
    async fn dropped_temp_artifact_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(dir.path());
        let temp = temp_with(&index, "abc", 64).await;
        let temp_path = temp.path().to_path_buf();
        assert!(temp_path.exists());
        drop(temp);
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn lookup_purges_entry_whose_artifact_was_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(dir.path());
        index.initialize().await.unwrap();
        let temp = temp_with(&index, "abc", 64).await;
        assert!(index.finalize(temp, "abc", None).await);

        std::fs::write(dir.path().join("abc.webm"), b"tiny").unwrap();

        assert!(index.lookup("abc").await.is_none());
        assert!(index.entries().is_empty());
        assert!(!dir.path().join("abc.webm").exists());
    }

    #[tokio::test]
    async fn initialize_drops_entries_with_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.webm"), vec![1u8; 64]).unwrap();
        std::fs::write(
            dir.path().join("index.json"),
            r#"{
                "keep": {"file": "keep.webm", "title": "Keep", "createdAt": 1},
                "gone": {"file": "gone.webm", "title": null, "createdAt": 2.5}
            }"#,
        )
        .unwrap();

        let index = index_in(dir.path());
        let report = index.initialize().await.unwrap();

        assert_eq!(report.loaded, 1);
        assert_eq!(report.dropped, 1);
        assert!(!report.rebuilt);
        let raw = std::fs::read_to_string(dir.path().join("index.json")).unwrap();
        assert!(raw.contains("keep.webm"));
        assert!(!raw.contains("gone.webm"));
    }

    #[tokio::test]
    async fn initialize_removes_stale_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc.0f3c9a.webm.tmp"), vec![1u8; 64]).unwrap();
        std::fs::write(dir.path().join("index.json.tmp"), "{}").unwrap();
        std::fs::write(dir.path().join("abc.webm"), vec![1u8; 64]).unwrap();

        let index = index_in(dir.path());
        let report = index.initialize().await.unwrap();

        assert_eq!(report.temps_removed, 2);
        assert!(!dir.path().join("abc.0f3c9a.webm.tmp").exists());
        assert!(!dir.path().join("index.json.tmp").exists());
        assert!(dir.path().join("abc.webm").exists());
    }

    #[tokio::test]
    async fn initialize_drops_entries_pointing_outside_cache_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("cache");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(root.path().join("escape.webm"), vec![1u8; 64]).unwrap();
        let absolute = root.path().join("escape.webm");
        let raw = serde_json::json!({
            "up": {"file": "../escape.webm", "title": null, "createdAt": 1},
            "abs": {"file": absolute.to_string_lossy(), "title": null, "createdAt": 1}
        });
        std::fs::write(dir.join("index.json"), raw.to_string()).unwrap();

        let index = index_in(&dir);
        let report = index.initialize().await.unwrap();

        assert_eq!(report.loaded, 0);
        assert_eq!(report.dropped, 2);
        assert!(index.entries().is_empty());
        assert!(root.path().join("escape.webm").exists());
    }

    #[tokio::test]
    async fn purge_of_invalid_entry_waits_for_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(index_in(dir.path()));
        index.initialize().await.unwrap();
        let temp = temp_with(&index, "abc", 64).await;
        assert!(index.finalize(temp, "abc", Some("Song")).await);
        std::fs::write(dir.path().join("abc.webm"), b"tiny").unwrap();

        let lock = index.write_lock("abc");
        let guard = lock.lock().await;
        let lookup = tokio::spawn({
            let index = index.clone();
            async move { index.lookup("abc").await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!lookup.is_finished());

        // A writer holding the lock replaces the artifact.
        std::fs::write(dir.path().join("abc.webm"), vec![2u8; 64]).unwrap();
        drop(guard);

        let hit = lookup.await.unwrap().unwrap();
        assert_eq!(hit.entry.title.as_deref(), Some("Song"));
        assert_eq!(std::fs::read(dir.path().join("abc.webm")).unwrap(), vec![2u8; 64]);
        assert_eq!(index.entries().len(), 1);
    }

    #[test]
    fn plain_file_names_only() {
        assert!(is_plain_file_name("abc.webm"));
        assert!(is_plain_file_name("Some Song [dQw4w9WgXcQ].webm"));
        assert!(!is_plain_file_name("../abc.webm"));
        assert!(!is_plain_file_name("/tmp/abc.webm"));
        assert!(!is_plain_file_name("sub/abc.webm"));
        assert!(!is_plain_file_name(""));
    }

    #[tokio::test]
    async fn initialize_rebuilds_from_legacy_file_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Some Song [dQw4w9WgXcQ].webm"), vec![1u8; 64]).unwrap();
        std::fs::write(dir.path().join("AAAAAAAAAAA.webm"), b"short").unwrap();
        std::fs::write(dir.path().join("notes.txt"), vec![1u8; 64]).unwrap();

        let index = index_in(dir.path());
        let report = index.initialize().await.unwrap();

        assert!(report.rebuilt);
        assert_eq!(report.migrated, 1);
        let hit = index.lookup("dQw4w9WgXcQ").await.unwrap();
        assert_eq!(hit.entry.file, "Some Song [dQw4w9WgXcQ].webm");
    }

    #[tokio::test]
    async fn initialize_recovers_from_corrupt_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dQw4w9WgXcQ.webm"), vec![1u8; 64]).unwrap();
        std::fs::write(dir.path().join("index.json"), "{ not json").unwrap();

        let index = index_in(dir.path());
        let report = index.initialize().await.unwrap();

        assert!(report.rebuilt);
        assert_eq!(report.migrated, 1);
        assert_eq!(index.entries()[0].0, "dQw4w9WgXcQ");
    }

    #[tokio::test]
    async fn lookup_backfills_canonical_and_scanned_files() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(dir.path());
        index.initialize().await.unwrap();

        std::fs::write(dir.path().join("xyz.webm"), vec![1u8; 64]).unwrap();
        std::fs::write(dir.path().join("old copy of qrs.webm"), vec![1u8; 64]).unwrap();

        assert_eq!(index.lookup("xyz").await.unwrap().entry.file, "xyz.webm");
        assert_eq!(
            index.lookup("qrs").await.unwrap().entry.file,
            "old copy of qrs.webm"
        );
        assert_eq!(index.stats().entries, 2);
        assert_eq!(index.stats().total_bytes, 128);
    }

    #[tokio::test]
    async fn lookup_is_disabled_with_cache_off() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("xyz.webm"), vec![1u8; 64]).unwrap();
        let mut settings = CacheSettings::with_dir(dir.path());
        settings.min_artifact_bytes = MIN;
        settings.enabled = false;
        let index = CacheIndex::new(settings);
        assert!(index.lookup("xyz").await.is_none());
    }

    #[tokio::test]
    async fn purge_all_removes_artifacts_and_resets_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(dir.path());
        index.initialize().await.unwrap();
        for id in ["one", "two"] {
            let temp = temp_with(&index, id, 64).await;
            assert!(index.finalize(temp, id, None).await);
        }

        assert_eq!(index.purge_all().await.unwrap(), 2);

        assert!(index.lookup("one").await.is_none());
        let raw = std::fs::read_to_string(dir.path().join("index.json")).unwrap();
        assert_eq!(raw.trim(), "{}");
    }

    #[tokio::test]
    async fn concurrent_finalize_of_same_track_keeps_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(index_in(dir.path()));
        index.initialize().await.unwrap();
        let first = temp_with(&index, "same", 64).await;
        let second = temp_with(&index, "same", 80).await;
        assert_ne!(first.path(), second.path());

        let (a, b) = tokio::join!(
            index.finalize(first, "same", None),
            index.finalize(second, "same", None)
        );

        assert!(a && b);
        assert_eq!(index.entries().len(), 1);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn extract_track_id_prefers_whole_stem() {
        let index = index_in(Path::new("/unused"));
        assert_eq!(
            index.extract_track_id("dQw4w9WgXcQ.webm").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            index.extract_track_id("Title [dQw4w9WgXcQ].webm").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(index.extract_track_id("short.webm"), None);
    }

    #[test]
    fn sanitize_id_replaces_path_characters() {
        assert_eq!(sanitize_id("a/b:c"), "a_b_c");
        assert_eq!(sanitize_id(""), "_");
    }
}
