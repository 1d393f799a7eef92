use crate::cleaner::{remove_quietly, Staging};
use crate::state::IngestState;
use crate::{FilemanError, PartMetadata, StagedFile, Upload};
use anyhow::Context;
use bytes::Bytes;
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error};

/// Events produced by a multipart tokenizer and consumed by an
/// [UploadTracker].
#[derive(Debug)]
pub enum PartEvent {
    /// A file part started. Its contents are delivered through `chunks`, the
    /// part ends when the sender is dropped.
    FileAnnounced { metadata: PartMetadata, chunks: mpsc::Receiver<Bytes> },

    /// A non-file part started, its value follows in
    /// [PartEvent::FieldReceived].
    FieldAnnounced { name: String },

    FieldReceived { name: String, value: String },

    /// Every part of the body has been announced.
    Finished,

    Errored(FilemanError),
}

type Writers = JoinSet<Result<PathBuf, FilemanError>>;

/// Turns the unordered [PartEvent]s of one request into a single outcome.
///
/// File parts are written to the temporary directory by concurrent staging
/// tasks while the tokenizer keeps delivering parts. [UploadTracker::run]
/// resolves once the body is finished and every staged write has completed,
/// or with the first error, in which case every file staged so far is removed.
#[derive(Debug)]
pub struct UploadTracker {
    tempdir: PathBuf,
    staging: Staging,
    state: IngestState,
    upload: Upload,
}

impl UploadTracker {
    pub fn new(tempdir: impl Into<PathBuf>, staging: Staging) -> Self {
        Self { tempdir: tempdir.into(), staging, state: IngestState::new(), upload: Upload::default() }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<PartEvent>) -> Result<Upload, FilemanError> {
        let mut writers = Writers::new();
        let mut listening = true;

        loop {
            if self.state.complete() {
                debug!(
                    files = self.upload.files.len(),
                    fields = self.upload.fields.len(),
                    "multipart ingestion completed"
                );
                return Ok(self.upload);
            }

            let outcome = tokio::select! {
                event = events.recv(), if listening => match event {
                    Some(event) => self.dispatch(event, &mut writers),
                    None => {
                        listening = false;
                        match self.state.is_finished() {
                            true => Ok(()),
                            false => Err(FilemanError::IncompleteBody),
                        }
                    }
                },
                Some(joined) = writers.join_next() => self.staged(joined),
                else => Err(FilemanError::IncompleteBody),
            };

            if let Err(err) = outcome {
                return Err(self.abort(err, writers).await);
            }
        }
    }

    fn dispatch(&mut self, event: PartEvent, writers: &mut Writers) -> Result<(), FilemanError> {
        match event {
            | PartEvent::FileAnnounced { metadata, chunks } => {
                let file = StagedFile::reserve(&self.tempdir, metadata);
                debug!(field = %file.field, path = %file.path.display(), "staging uploaded file");

                self.staging.register(&file.path);
                self.state.file_announced();
                writers.spawn(stage(file.path.clone(), chunks));
                self.upload.files.push(file);
            }
            | PartEvent::FieldAnnounced { .. } => self.state.field_announced(),
            | PartEvent::FieldReceived { name, value } => {
                self.upload.fields.insert(name, parse_field_value(value));
                self.state.field_recorded();
            }
            | PartEvent::Finished => self.state.finish(),
            | PartEvent::Errored(err) => return Err(err),
        }
        Ok(())
    }

    fn staged(&mut self, joined: Result<Result<PathBuf, FilemanError>, JoinError>) -> Result<(), FilemanError> {
        let path = joined.context("staging task failed")??;
        self.state.file_staged();
        debug!(path = %path.display(), pending = self.state.pending_files(), "staged uploaded file");
        Ok(())
    }

    async fn abort(mut self, err: FilemanError, mut writers: Writers) -> FilemanError {
        self.state.fail();
        error!(error = %err, staged = self.upload.files.len(), "multipart ingestion failed");

        writers.shutdown().await;
        for file in &self.upload.files {
            remove_quietly(&file.path).await;
        }

        err
    }
}

/// Parses a field value as JSON, falling back to the raw string.
pub(crate) fn parse_field_value(value: String) -> Value {
    serde_json::from_str(&value).unwrap_or(Value::String(value))
}

async fn stage(path: PathBuf, mut chunks: mpsc::Receiver<Bytes>) -> Result<PathBuf, FilemanError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await.map_err(FilemanError::staging(&path))?;
    }

    let mut file = File::create(&path).await.map_err(FilemanError::staging(&path))?;

    while let Some(chunk) = chunks.recv().await {
        file.write_all(&chunk).await.map_err(FilemanError::staging(&path))?;
    }

    file.flush().await.map_err(FilemanError::staging(&path))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn metadata(field: &str, file_name: &str) -> PartMetadata {
        PartMetadata {
            field: field.to_string(),
            file_name: file_name.to_string(),
            encoding: "7bit".to_string(),
            media_type: Some("text/plain".to_string()),
        }
    }

    fn field(name: &str, value: &str) -> [PartEvent; 2] {
        [
            PartEvent::FieldAnnounced { name: name.to_string() },
            PartEvent::FieldReceived { name: name.to_string(), value: value.to_string() },
        ]
    }

    #[test]
    fn test_parse_field_value() {
        assert_eq!(parse_field_value("42".to_string()), json!(42));
        assert_eq!(parse_field_value("hello".to_string()), json!("hello"));
        assert_eq!(parse_field_value("true".to_string()), json!(true));
        assert_eq!(parse_field_value(r#"{"a":[1,2]}"#.to_string()), json!({ "a": [1, 2] }));
        assert_eq!(parse_field_value(String::new()), json!(""));
    }

    #[tokio::test]
    async fn test_empty_body() {
        let tempdir = TempDir::new().unwrap();
        let (sender, receiver) = mpsc::channel(8);
        sender.send(PartEvent::Finished).await.unwrap();

        let upload = UploadTracker::new(tempdir.path(), Staging::default()).run(receiver).await.unwrap();

        assert!(upload.files.is_empty());
        assert!(upload.fields.is_empty());
    }

    #[tokio::test]
    async fn test_files_and_fields() {
        let tempdir = TempDir::new().unwrap();
        let staging = Staging::default();
        let (sender, receiver) = mpsc::channel(8);
        let tracker = tokio::spawn(UploadTracker::new(tempdir.path(), staging.clone()).run(receiver));

        let (first, first_chunks) = mpsc::channel(8);
        let (second, second_chunks) = mpsc::channel(8);
        sender.send(PartEvent::FileAnnounced { metadata: metadata("a", "a.txt"), chunks: first_chunks }).await.unwrap();
        sender.send(PartEvent::FileAnnounced { metadata: metadata("b", "b.md"), chunks: second_chunks }).await.unwrap();
        for event in field("count", "42").into_iter().chain(field("greeting", "hello")) {
            sender.send(event).await.unwrap();
        }
        sender.send(PartEvent::Finished).await.unwrap();

        // The body is finished but both files are still being written.
        second.send(Bytes::from_static(b"# second")).await.unwrap();
        drop(second);
        first.send(Bytes::from_static(b"first ")).await.unwrap();
        first.send(Bytes::from_static(b"file")).await.unwrap();
        drop(first);

        let upload = tracker.await.unwrap().unwrap();

        assert_eq!(upload.files.len(), 2);
        assert_eq!(upload.files[0].field, "a");
        assert_eq!(upload.files[0].name.as_deref(), Some("a.txt"));
        assert_eq!(upload.files[1].field, "b");
        assert_eq!(std::fs::read_to_string(&upload.files[0].path).unwrap(), "first file");
        assert_eq!(std::fs::read_to_string(&upload.files[1].path).unwrap(), "# second");
        assert_eq!(upload.fields.get("count"), Some(&json!(42)));
        assert_eq!(upload.fields.get("greeting"), Some(&json!("hello")));

        let staged: Vec<_> = upload.files.iter().map(|file| file.path.clone()).collect();
        assert_eq!(staging.paths(), staged);
    }

    #[tokio::test]
    async fn test_last_field_wins() {
        let tempdir = TempDir::new().unwrap();
        let (sender, receiver) = mpsc::channel(8);
        for event in field("name", "first").into_iter().chain(field("name", "second")) {
            sender.send(event).await.unwrap();
        }
        sender.send(PartEvent::Finished).await.unwrap();

        let upload = UploadTracker::new(tempdir.path(), Staging::default()).run(receiver).await.unwrap();

        assert_eq!(upload.fields.len(), 1);
        assert_eq!(upload.fields.get("name"), Some(&json!("second")));
    }

    #[tokio::test]
    async fn test_registers_before_writing() {
        let tempdir = TempDir::new().unwrap();
        let staging = Staging::default();
        let (sender, receiver) = mpsc::channel(8);
        let tracker = tokio::spawn(UploadTracker::new(tempdir.path(), staging.clone()).run(receiver));

        let (chunks, receiver) = mpsc::channel(8);
        sender.send(PartEvent::FileAnnounced { metadata: metadata("a", "a.txt"), chunks: receiver }).await.unwrap();

        for _ in 0..100 {
            if !staging.paths().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(staging.paths().len(), 1);

        drop(chunks);
        sender.send(PartEvent::Finished).await.unwrap();
        let upload = tracker.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&upload.files[0].path).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_error_removes_staged_files() {
        let tempdir = TempDir::new().unwrap();
        let (sender, receiver) = mpsc::channel(8);
        let tracker = tokio::spawn(UploadTracker::new(tempdir.path(), Staging::default()).run(receiver));

        let (chunks, receiver) = mpsc::channel(8);
        chunks.send(Bytes::from_static(b"partial")).await.unwrap();
        drop(chunks);
        sender.send(PartEvent::FileAnnounced { metadata: metadata("a", "a.txt"), chunks: receiver }).await.unwrap();

        let (_pending, receiver) = mpsc::channel(8);
        sender.send(PartEvent::FileAnnounced { metadata: metadata("b", "b.txt"), chunks: receiver }).await.unwrap();

        for _ in 0..200 {
            if std::fs::read_dir(tempdir.path()).unwrap().count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sender.send(PartEvent::Errored(FilemanError::IncompleteBody)).await.unwrap();

        let error = tracker.await.unwrap().unwrap_err();

        assert!(matches!(error, FilemanError::IncompleteBody));
        assert_eq!(std::fs::read_dir(tempdir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_staging_failure() {
        let root = TempDir::new().unwrap();
        let blocker = root.path().join("not-a-directory");
        std::fs::write(&blocker, b"").unwrap();

        let (sender, receiver) = mpsc::channel(8);
        let (chunks, chunk_receiver) = mpsc::channel(8);
        sender.send(PartEvent::FileAnnounced { metadata: metadata("a", "a.txt"), chunks: chunk_receiver }).await.unwrap();
        drop(chunks);

        let error = UploadTracker::new(&blocker, Staging::default()).run(receiver).await.unwrap_err();

        match error {
            | FilemanError::Staging { path, .. } => assert_eq!(path.parent(), Some(blocker.as_path())),
            | other => panic!("unexpected error: {other}"),
        }
        assert!(Path::new(&blocker).is_file());
    }

    #[tokio::test]
    async fn test_tokenizer_gone() {
        let tempdir = TempDir::new().unwrap();
        let (sender, receiver) = mpsc::channel(8);
        for event in field("name", "value") {
            sender.send(event).await.unwrap();
        }
        drop(sender);

        let error = UploadTracker::new(tempdir.path(), Staging::default()).run(receiver).await.unwrap_err();

        assert!(matches!(error, FilemanError::IncompleteBody));
    }
}
