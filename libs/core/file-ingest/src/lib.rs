//! Streams source files to a temp directory with bounded concurrency,
//! validates their content, and reports the outcome as a `FileProcessed`
//! event. Grounded in the corpus's content-addressed upload pattern
//! (hash the bytes, stage under a managed path) generalized to a
//! concurrency-bounded, cache-aware ingestion pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use job_cache::{CacheKeyGenerator, TtlCache};
use job_events::{JobStatus, StatusBroadcaster, StatusEvent};
use serde::Serialize;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use uuid::Uuid;

const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 50 * 1024 * 1024;
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileProcessedEvent {
    pub file_path: String,
    pub file_name: String,
    pub status: FileStatus,
    pub size: u64,
    pub processing_time_ms: u64,
    pub import_id: Option<String>,
    pub content_length: Option<u64>,
    pub reason: Option<String>,
}

impl FileProcessedEvent {
    fn outcome(
        status: FileStatus,
        file_path: String,
        file_name: String,
        size: u64,
        elapsed: Duration,
        import_id: Option<String>,
        content_length: Option<u64>,
        reason: Option<String>,
    ) -> Self {
        Self {
            file_path,
            file_name,
            status,
            size,
            processing_time_ms: elapsed.as_millis() as u64,
            import_id,
            content_length,
            reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileIngestConfig {
    pub max_concurrency: usize,
    pub max_file_size_bytes: u64,
    pub validate_html: bool,
}

impl Default for FileIngestConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            validate_html: false,
        }
    }
}

/// Bounded-concurrency file ingestor. Each accepted file is streamed into
/// a process-owned temp directory; `shutdown` waits for in-flight
/// processors to drain before removing it.
pub struct FileIngestor {
    temp_dir: TempDir,
    config: FileIngestConfig,
    semaphore: Arc<Semaphore>,
    cache: Arc<TtlCache<String, ()>>,
    status_broadcaster: Option<Arc<StatusBroadcaster>>,
}

impl FileIngestor {
    pub fn new(config: FileIngestConfig) -> std::io::Result<Self> {
        let temp_dir = tempfile::Builder::new().prefix("recipe-ingest-").tempdir()?;
        Ok(Self {
            temp_dir,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            cache: Arc::new(TtlCache::new()),
            status_broadcaster: None,
            config,
        })
    }

    pub fn with_status_broadcaster(mut self, broadcaster: Arc<StatusBroadcaster>) -> Self {
        self.status_broadcaster = Some(broadcaster);
        self
    }

    pub fn temp_dir_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Streams `source_path` into the temp dir, validating it along the
    /// way. Never returns `Err` — every failure mode is reported as a
    /// `FileProcessedEvent` with `status: Failed`, mirroring the rest of
    /// the engine's "report, don't propagate" treatment of advisory steps.
    pub async fn process_file(&self, source_path: impl AsRef<Path>, import_id: Option<String>) -> FileProcessedEvent {
        let start = Instant::now();
        let source_path = source_path.as_ref();
        let file_name = source_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let path_string = source_path.to_string_lossy().to_string();

        let event = self.process_file_inner(source_path, &path_string, &file_name, start, import_id.clone()).await;
        self.broadcast(&event);
        event
    }

    async fn process_file_inner(
        &self,
        source_path: &Path,
        path_string: &str,
        file_name: &str,
        start: Instant,
        import_id: Option<String>,
    ) -> FileProcessedEvent {
        let metadata = match tokio::fs::metadata(source_path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                return FileProcessedEvent::outcome(
                    FileStatus::Failed,
                    path_string.to_string(),
                    file_name.to_string(),
                    0,
                    start.elapsed(),
                    import_id,
                    None,
                    Some(err.to_string()),
                )
            }
        };
        let size = metadata.len();

        if size == 0 {
            return FileProcessedEvent::outcome(
                FileStatus::Skipped,
                path_string.to_string(),
                file_name.to_string(),
                size,
                start.elapsed(),
                import_id,
                None,
                Some("empty file".to_string()),
            );
        }
        if size > self.config.max_file_size_bytes {
            return FileProcessedEvent::outcome(
                FileStatus::Failed,
                path_string.to_string(),
                file_name.to_string(),
                size,
                start.elapsed(),
                import_id,
                None,
                Some(format!("exceeds max file size of {} bytes", self.config.max_file_size_bytes)),
            );
        }

        let modified_unix = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let fingerprint = CacheKeyGenerator::file_processing(path_string, size, modified_unix);

        if self.cache.get(&fingerprint).is_some() {
            return FileProcessedEvent::outcome(
                FileStatus::Skipped,
                path_string.to_string(),
                file_name.to_string(),
                size,
                start.elapsed(),
                import_id,
                None,
                Some("cache hit".to_string()),
            );
        }

        let Ok(_permit) = self.semaphore.clone().acquire_owned().await else {
            return FileProcessedEvent::outcome(
                FileStatus::Failed,
                path_string.to_string(),
                file_name.to_string(),
                size,
                start.elapsed(),
                import_id,
                None,
                Some("ingestor is shutting down".to_string()),
            );
        };

        let dest_path = self.temp_dir.path().join(format!("{}-{file_name}", Uuid::new_v4()));

        match self.stream_and_validate(source_path, &dest_path).await {
            Ok(content_length) => {
                self.cache.set(fingerprint, (), CACHE_TTL);
                FileProcessedEvent::outcome(
                    FileStatus::Success,
                    path_string.to_string(),
                    file_name.to_string(),
                    size,
                    start.elapsed(),
                    import_id,
                    Some(content_length),
                    None,
                )
            }
            Err(reason) => FileProcessedEvent::outcome(
                FileStatus::Failed,
                path_string.to_string(),
                file_name.to_string(),
                size,
                start.elapsed(),
                import_id,
                None,
                Some(reason),
            ),
        }
    }

    async fn stream_and_validate(&self, source: &Path, dest: &PathBuf) -> Result<u64, String> {
        let mut reader = tokio::fs::File::open(source).await.map_err(|err| err.to_string())?;
        let mut writer = tokio::fs::File::create(dest).await.map_err(|err| err.to_string())?;
        let written = tokio::io::copy(&mut reader, &mut writer).await.map_err(|err| err.to_string())?;

        if written == 0 {
            return Err("no content written".to_string());
        }

        if self.config.validate_html {
            let content = tokio::fs::read_to_string(dest).await.map_err(|err| err.to_string())?;
            let looks_like_html =
                content.to_ascii_lowercase().contains("<html") || content.trim_start().to_ascii_lowercase().starts_with("<!doctype");
            if !looks_like_html {
                return Err("content does not look like HTML".to_string());
            }
        }

        Ok(written)
    }

    fn broadcast(&self, event: &FileProcessedEvent) {
        let Some(broadcaster) = &self.status_broadcaster else {
            return;
        };
        let Some(import_id) = &event.import_id else {
            return;
        };
        let status = match event.status {
            FileStatus::Success => JobStatus::Completed,
            FileStatus::Failed => JobStatus::Failed,
            FileStatus::Skipped => JobStatus::Completed,
        };
        let message = event.reason.clone().unwrap_or_else(|| "file processed".to_string());
        let status_event = StatusEvent::new(import_id.clone(), status, message, "file_ingest");
        let _ = broadcaster.add_status_event_and_broadcast(status_event);
    }

    /// Waits for every in-flight `process_file` call to release its
    /// concurrency permit, then removes the temp directory.
    pub async fn shutdown(self) -> std::io::Result<()> {
        let total_permits = self.config.max_concurrency.max(1) as u32;
        let _ = self.semaphore.acquire_many(total_permits).await;
        self.temp_dir.close()
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[tokio::test]
    async fn empty_file_is_skipped() {
        let source_dir = tempfile::tempdir().unwrap();
        let path = write_temp_file(source_dir.path(), "empty.html", b"");

        let ingestor = FileIngestor::new(FileIngestConfig::default()).unwrap();
        let event = ingestor.process_file(&path, None).await;

        assert_eq!(event.status, FileStatus::Skipped);
    }

    #[tokio::test]
    async fn oversized_file_is_failed() {
        let source_dir = tempfile::tempdir().unwrap();
        let path = write_temp_file(source_dir.path(), "big.html", b"<html>hi</html>");

        let config = FileIngestConfig {
            max_file_size_bytes: 4,
            ..FileIngestConfig::default()
        };
        let ingestor = FileIngestor::new(config).unwrap();
        let event = ingestor.process_file(&path, None).await;

        assert_eq!(event.status, FileStatus::Failed);
        assert!(event.reason.unwrap().contains("exceeds"));
    }

    #[tokio::test]
    async fn valid_file_is_streamed_successfully() {
        let source_dir = tempfile::tempdir().unwrap();
        let path = write_temp_file(source_dir.path(), "note.html", b"<html><body>Recipe</body></html>");

        let ingestor = FileIngestor::new(FileIngestConfig::default()).unwrap();
        let event = ingestor.process_file(&path, Some("import-1".to_string())).await;

        assert_eq!(event.status, FileStatus::Success);
        assert_eq!(event.content_length, Some(32));
    }

    #[tokio::test]
    async fn repeated_identical_file_is_served_from_cache() {
        let source_dir = tempfile::tempdir().unwrap();
        let path = write_temp_file(source_dir.path(), "note.html", b"<html>same</html>");

        let ingestor = FileIngestor::new(FileIngestConfig::default()).unwrap();
        let first = ingestor.process_file(&path, None).await;
        let second = ingestor.process_file(&path, None).await;

        assert_eq!(first.status, FileStatus::Success);
        assert_eq!(second.status, FileStatus::Skipped);
        assert_eq!(second.reason.unwrap(), "cache hit");
    }

    #[tokio::test]
    async fn html_validation_rejects_non_html_content_when_enabled() {
        let source_dir = tempfile::tempdir().unwrap();
        let path = write_temp_file(source_dir.path(), "note.txt", b"just some plain text");

        let config = FileIngestConfig {
            validate_html: true,
            ..FileIngestConfig::default()
        };
        let ingestor = FileIngestor::new(config).unwrap();
        let event = ingestor.process_file(&path, None).await;

        assert_eq!(event.status, FileStatus::Failed);
    }

    #[tokio::test]
    async fn shutdown_removes_the_temp_directory() {
        let ingestor = FileIngestor::new(FileIngestConfig::default()).unwrap();
        let temp_path = ingestor.temp_dir_path().to_path_buf();
        assert!(temp_path.exists());

        ingestor.shutdown().await.unwrap();

        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn broadcasts_a_status_event_when_configured() {
        let source_dir = tempfile::tempdir().unwrap();
        let path = write_temp_file(source_dir.path(), "note.html", b"<html>hi</html>");

        let broadcaster = Arc::new(StatusBroadcaster::new());
        let ingestor = FileIngestor::new(FileIngestConfig::default())
            .unwrap()
            .with_status_broadcaster(Arc::clone(&broadcaster));

        ingestor.process_file(&path, Some("import-9".to_string())).await;

        assert_eq!(broadcaster.events_for_import("import-9").len(), 1);
    }
}
