//! Local directory input and output components
//!
//! [`FileInput`] picks up every file in a directory matching a
//! [`FilePattern`], one file per read. Files stay where they are until the
//! flow acknowledges them; they are then archived or deleted. A rollback
//! leaves them in place for the next run. Concurrent runs never read the same
//! file, and a file whose archive or delete fails stays claimed so it is not
//! delivered again.
//!
//! [`FileOutput`] writes each batch to one file, first under a temporary
//! name, then renamed to its final name.

use super::pattern::{render_filename, FilePattern};
use crate::error::{IntegrationError, Result};
use crate::flow::component::{FlowContext, InputSource, OutputDestination};
use crate::flow::result::SendResult;
use crate::format::{FileFormat, FormatRegistry};
use crate::repository::{decode_values, default_formats, encode_values};
use crate::schema::Schema;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared by every run of the flows using one input. A file is claimed by at
/// most one run: it is pending, in flight for one run, or unclaimed.
#[derive(Debug, Default)]
struct InputState {
    /// Runs between `connect` and `close`
    sessions: usize,
    pending: VecDeque<PathBuf>,
    /// Read by a run but not yet acknowledged
    in_flight: HashMap<Uuid, Vec<PathBuf>>,
}

impl InputState {
    fn is_claimed(&self, path: &Path) -> bool {
        self.pending.iter().any(|p| p == path) || self.in_flight.values().any(|files| files.iter().any(|p| p == path))
    }

    fn release(&mut self, run_id: Uuid, path: &Path) {
        if let Some(files) = self.in_flight.get_mut(&run_id) {
            files.retain(|p| p != path);
            if files.is_empty() {
                self.in_flight.remove(&run_id);
            }
        }
    }
}

/// Reads matching files from a local directory
pub struct FileInput {
    name: String,
    directory: PathBuf,
    pattern: FilePattern,
    format: FileFormat,
    schema: Arc<Schema>,
    formats: Arc<FormatRegistry>,
    archive_dir: Option<PathBuf>,
    error_dir: Option<PathBuf>,
    delete_after_read: bool,
    state: Mutex<InputState>,
}

impl std::fmt::Debug for FileInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileInput")
            .field("name", &self.name)
            .field("directory", &self.directory)
            .field("pattern", &self.pattern)
            .field("schema", &self.schema.name())
            .finish()
    }
}

impl FileInput {
    pub fn new(
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
        pattern: FilePattern,
        format: FileFormat,
        schema: Arc<Schema>,
    ) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            pattern,
            format,
            schema,
            formats: default_formats(),
            archive_dir: None,
            error_dir: None,
            delete_after_read: false,
            state: Mutex::new(InputState::default()),
        }
    }

    /// Move acknowledged files here
    pub fn with_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    /// Move files that fail to parse here instead of retrying them every run
    pub fn with_error_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.error_dir = Some(dir.into());
        self
    }

    /// Delete acknowledged files (ignored when an archive dir is set)
    pub fn delete_after_read(mut self, delete: bool) -> Self {
        self.delete_after_read = delete;
        self
    }

    pub fn with_formats(mut self, formats: Arc<FormatRegistry>) -> Self {
        self.formats = formats;
        self
    }

    fn list_matching(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.directory).map_err(|e| {
            IntegrationError::connection(format!(
                "input directory {} is not readable: {}",
                self.directory.display(),
                e
            ))
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.pattern.matches(&name) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Move `path` into `dir`, suffixing a timestamp if the name is taken
    async fn move_into(&self, path: &Path, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let mut target = dir.join(&file_name);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            target = dir.join(format!("{}.{}", file_name, Utc::now().format("%Y%m%d%H%M%S%3f")));
        }
        tokio::fs::rename(path, &target).await?;
        Ok(target)
    }
}

#[async_trait]
impl InputSource for FileInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        let files = self.list_matching()?;
        info!(
            "Input '{}' found {} file(s) matching '{}' in {}",
            self.name,
            files.len(),
            self.pattern,
            self.directory.display()
        );
        let mut state = self.state.lock();
        for file in files {
            if !state.is_claimed(&file) {
                state.pending.push_back(file);
            }
        }
        state.sessions += 1;
        Ok(())
    }

    async fn has_data(&self) -> Result<bool> {
        let state = self.state.lock();
        if state.sessions == 0 {
            return Err(IntegrationError::illegal_state(format!("input '{}' is not connected", self.name)));
        }
        Ok(!state.pending.is_empty())
    }

    async fn read(&self, ctx: &FlowContext) -> Result<Vec<Value>> {
        let next = {
            let mut state = self.state.lock();
            if state.sessions == 0 {
                return Err(IntegrationError::illegal_state(format!("input '{}' is not connected", self.name)));
            }
            let next = state.pending.pop_front();
            if let Some(path) = &next {
                state.in_flight.entry(ctx.run_id).or_default().push(path.clone());
            }
            next
        };
        let Some(path) = next else {
            return Ok(Vec::new());
        };

        let label = path.display().to_string();
        let decoded = match tokio::fs::read(&path).await {
            Ok(bytes) => decode_values(&self.formats, &self.schema, &bytes, &self.format, &label),
            Err(e) => Err(IntegrationError::file_parse(&label, e.to_string())),
        };
        let records = match decoded {
            Ok(records) => records,
            Err(e) => {
                let moved = match &self.error_dir {
                    Some(dir) => self.move_into(&path, dir).await.map(Some),
                    None => Ok(None),
                };
                self.state.lock().release(ctx.run_id, &path);
                if let Some(target) = moved? {
                    warn!("Input '{}' moved unparseable {} to {}", self.name, label, target.display());
                }
                return Err(e);
            }
        };
        debug!("Input '{}' read {} records from {}", self.name, records.len(), label);
        Ok(records)
    }

    async fn acknowledge(&self, ctx: &FlowContext) -> Result<()> {
        let files = self.state.lock().in_flight.get(&ctx.run_id).cloned().unwrap_or_default();
        for path in &files {
            match (&self.archive_dir, self.delete_after_read) {
                (Some(dir), _) => {
                    let target = self.move_into(path, dir).await?;
                    debug!("Archived {} to {}", path.display(), target.display());
                }
                (None, true) => {
                    tokio::fs::remove_file(path).await?;
                    debug!("Deleted {}", path.display());
                }
                (None, false) => {}
            }
            self.state.lock().release(ctx.run_id, path);
        }
        if !files.is_empty() {
            info!("Input '{}' acknowledged {} file(s)", self.name, files.len());
        }
        Ok(())
    }

    async fn rollback(&self, ctx: &FlowContext) -> Result<()> {
        let files = self.state.lock().in_flight.remove(&ctx.run_id).unwrap_or_default();
        if !files.is_empty() {
            warn!("Input '{}' rolled back; {} file(s) left in place", self.name, files.len());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.sessions = state.sessions.saturating_sub(1);
        if state.sessions == 0 {
            state.pending.clear();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().sessions > 0
    }
}

/// Writes each batch to a file in a local directory
pub struct FileOutput {
    name: String,
    directory: PathBuf,
    filename_pattern: String,
    format: FileFormat,
    schema: Arc<Schema>,
    formats: Arc<FormatRegistry>,
    required: bool,
    connected: AtomicBool,
    /// Files written since the last commit
    written: Mutex<Vec<PathBuf>>,
}

impl std::fmt::Debug for FileOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileOutput")
            .field("name", &self.name)
            .field("directory", &self.directory)
            .field("filename_pattern", &self.filename_pattern)
            .finish()
    }
}

impl FileOutput {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>, format: FileFormat, schema: Arc<Schema>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            filename_pattern: "{flow}_{timestamp}.{ext}".to_string(),
            format,
            schema,
            formats: default_formats(),
            required: true,
            connected: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn with_filename_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.filename_pattern = pattern.into();
        self
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_formats(mut self, formats: Arc<FormatRegistry>) -> Self {
        self.formats = formats;
        self
    }
}

#[async_trait]
impl OutputDestination for FileOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_required(&self) -> bool {
        self.required
    }

    async fn connect(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory).await.map_err(|e| {
            IntegrationError::connection(format!(
                "cannot create output directory {}: {}",
                self.directory.display(),
                e
            ))
        })?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, ctx: &FlowContext, record: &Value) -> Result<SendResult> {
        self.send_batch(ctx, std::slice::from_ref(record)).await
    }

    async fn send_batch(&self, ctx: &FlowContext, records: &[Value]) -> Result<SendResult> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(IntegrationError::illegal_state(format!("output '{}' is not connected", self.name)));
        }
        let file_name = render_filename(&self.filename_pattern, &ctx.flow_name, self.format.format_type.extension());
        let path = self.directory.join(&file_name);
        let label = path.display().to_string();
        let data = encode_values(&self.formats, &self.schema, records, &self.format, &label)?;

        let temp = self.directory.join(format!(".{}.tmp", file_name));
        tokio::fs::write(&temp, &data)
            .await
            .map_err(|e| IntegrationError::file_write(&label, None, e.to_string()))?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(IntegrationError::file_write(&label, None, e.to_string()));
        }

        info!("Output '{}' wrote {} records to {}", self.name, records.len(), label);
        self.written.lock().push(path);
        Ok(SendResult::success(records.len()).with_metadata("path", label))
    }

    async fn commit(&self) -> Result<()> {
        self.written.lock().clear();
        Ok(())
    }

    /// Remove the files written by the failed run
    async fn rollback(&self) -> Result<()> {
        let files = std::mem::take(&mut *self.written.lock());
        for path in files {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove {} on rollback: {}", path.display(), e);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::test_support::payment_schema;
    use serde_json::json;

    fn schema() -> Arc<Schema> {
        Arc::new(payment_schema())
    }

    fn csv_input(dir: &Path) -> FileInput {
        FileInput::new(
            "inbox",
            dir,
            FilePattern::new("*.csv").unwrap(),
            FileFormat::csv(),
            schema(),
        )
    }

    async fn write_sample(dir: &Path, name: &str) {
        let rows = vec![json!({"id": 1, "payee": "Acme", "amount": 10.5, "booked": "2024-01-02"})];
        let bytes = encode_values(&default_formats(), &payment_schema(), &rows, &FileFormat::csv(), name).unwrap();
        tokio::fs::write(dir.join(name), bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_input_reads_matching_files_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        write_sample(dir.path(), "a.csv").await;
        write_sample(dir.path(), "b.csv").await;
        tokio::fs::write(dir.path().join("notes.txt"), "ignore me").await.unwrap();

        let input = csv_input(dir.path()).with_archive_dir(&archive);
        let ctx = FlowContext::new("test");
        input.connect().await.unwrap();

        let mut total = 0;
        while input.has_data().await.unwrap() {
            total += input.read(&ctx).await.unwrap().len();
        }
        assert_eq!(total, 2);
        input.close().await.unwrap();
        input.acknowledge(&ctx).await.unwrap();

        assert!(archive.join("a.csv").exists());
        assert!(archive.join("b.csv").exists());
        assert!(!dir.path().join("a.csv").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_rollback_leaves_files() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a.csv").await;

        let input = csv_input(dir.path()).delete_after_read(true);
        let ctx = FlowContext::new("test");
        input.connect().await.unwrap();
        assert_eq!(input.read(&ctx).await.unwrap().len(), 1);
        input.rollback(&ctx).await.unwrap();
        assert!(dir.path().join("a.csv").exists());

        input.connect().await.unwrap();
        assert!(input.has_data().await.unwrap());
        input.read(&ctx).await.unwrap();
        input.acknowledge(&ctx).await.unwrap();
        assert!(!dir.path().join("a.csv").exists());
    }

    #[tokio::test]
    async fn test_concurrent_runs_keep_their_own_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        for name in ["a.csv", "b.csv", "c.csv"] {
            write_sample(dir.path(), name).await;
        }
        let input = csv_input(dir.path()).with_archive_dir(&archive);
        let (first, second) = (FlowContext::new("north"), FlowContext::new("south"));

        input.connect().await.unwrap();
        assert_eq!(input.read(&first).await.unwrap().len(), 1);
        input.connect().await.unwrap();
        input.close().await.unwrap();

        // the second run still sees the files the first one left pending
        let mut read = 0;
        while input.has_data().await.unwrap() {
            read += input.read(&second).await.unwrap().len();
        }
        assert_eq!(read, 2);
        input.rollback(&second).await.unwrap();
        input.close().await.unwrap();
        input.acknowledge(&first).await.unwrap();

        assert!(archive.join("a.csv").exists());
        assert!(dir.path().join("b.csv").exists());
        assert!(dir.path().join("c.csv").exists());

        let third = FlowContext::new("north");
        input.connect().await.unwrap();
        while input.has_data().await.unwrap() {
            input.read(&third).await.unwrap();
        }
        input.close().await.unwrap();
        input.acknowledge(&third).await.unwrap();
        assert!(archive.join("b.csv").exists());
        assert!(archive.join("c.csv").exists());
        assert_eq!(std::fs::read_dir(&archive).unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_failed_acknowledge_keeps_remaining_files_claimed() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a.csv").await;
        write_sample(dir.path(), "b.csv").await;
        let input = csv_input(dir.path()).delete_after_read(true);
        let ctx = FlowContext::new("payments");

        input.connect().await.unwrap();
        input.read(&ctx).await.unwrap();
        input.read(&ctx).await.unwrap();
        input.close().await.unwrap();
        tokio::fs::remove_file(dir.path().join("b.csv")).await.unwrap();

        assert!(input.acknowledge(&ctx).await.is_err());
        assert!(!dir.path().join("a.csv").exists());

        // b.csv reappears but is still claimed by the run that read it
        write_sample(dir.path(), "b.csv").await;
        input.connect().await.unwrap();
        assert!(!input.has_data().await.unwrap());
        input.close().await.unwrap();

        input.acknowledge(&ctx).await.unwrap();
        assert!(!dir.path().join("b.csv").exists());
    }

    #[tokio::test]
    async fn test_unparseable_file_moved_to_error_dir() {
        let dir = tempfile::tempdir().unwrap();
        let errors = dir.path().join("errors");
        tokio::fs::write(dir.path().join("bad.json"), b"{not json").await.unwrap();
        let input = FileInput::new(
            "inbox",
            dir.path(),
            FilePattern::new("*.json").unwrap(),
            FileFormat::json(),
            schema(),
        )
        .with_error_dir(&errors);
        let ctx = FlowContext::new("payments");

        input.connect().await.unwrap();
        assert!(input.read(&ctx).await.is_err());
        assert!(!dir.path().join("bad.json").exists());
        assert!(errors.join("bad.json").exists());
        assert!(!input.has_data().await.unwrap());
    }

    #[tokio::test]
    async fn test_input_not_connected() {
        let dir = tempfile::tempdir().unwrap();
        let input = csv_input(dir.path());
        let err = input.has_data().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalState);
    }

    #[tokio::test]
    async fn test_output_writes_and_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let output = FileOutput::new("outbox", dir.path().join("out"), FileFormat::json(), schema())
            .with_filename_pattern("{flow}.{ext}");
        let ctx = FlowContext::new("payments");
        output.connect().await.unwrap();

        let records = vec![json!({"id": 7, "payee": "Zed", "amount": 1.0, "booked": null})];
        let result = output.send_batch(&ctx, &records).await.unwrap();
        assert!(result.is_success());
        let path = dir.path().join("out").join("payments.json");
        assert!(path.exists());
        assert_eq!(result.metadata["path"], path.display().to_string());

        output.rollback().await.unwrap();
        assert!(!path.exists());
    }
}
