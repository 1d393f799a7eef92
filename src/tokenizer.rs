use crate::{FilemanError, PartEvent, PartMetadata};
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use multer::{Constraints, Multipart};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Chunks buffered between the tokenizer and a staging writer.
const CHUNK_BUFFER: usize = 16;

/// Multipart tokenizer over a request body.
///
/// Remembers whether the body delivered any byte so that an empty body can be
/// told apart from a truncated one.
pub(crate) struct Tokenizer {
    multipart: Multipart<'static>,
    received: Arc<AtomicBool>,
}

impl Tokenizer {
    pub fn new<S, E>(stream: S, boundary: impl Into<String>, constraints: Constraints) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let received = Arc::new(AtomicBool::new(false));
        let seen = received.clone();
        let stream = stream.inspect(move |chunk| {
            if chunk.as_ref().is_ok_and(|chunk| !chunk.is_empty()) {
                seen.store(true, Ordering::Relaxed);
            }
        });

        Self { multipart: Multipart::with_constraints(stream, boundary, constraints), received }
    }

    fn is_empty_body(&self) -> bool {
        !self.received.load(Ordering::Relaxed)
    }
}

/// Feeds the parts of `tokenizer` to the tracker listening on `events`.
///
/// Parse errors are reported as [PartEvent::Errored], except for a body
/// without a single byte which is an empty form. The sender is held until the
/// tracker goes away so an abandoned file part is always explained by the
/// failure of its staging writer.
pub(crate) async fn pump(mut tokenizer: Tokenizer, events: mpsc::Sender<PartEvent>) {
    match drive(&mut tokenizer.multipart, &events).await {
        | Ok(()) => {}
        | Err(FilemanError::InvalidRequestBody { source: multer::Error::IncompleteStream })
            if tokenizer.is_empty_body() =>
        {
            debug!("empty multipart body");
            let _ = events.send(PartEvent::Finished).await;
        }
        | Err(err) => {
            warn!(error = %err, "failed to tokenize multipart body");
            let _ = events.send(PartEvent::Errored(err)).await;
        }
    }

    events.closed().await;
}

async fn drive(multipart: &mut Multipart<'static>, events: &mpsc::Sender<PartEvent>) -> Result<(), FilemanError> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.file_name().is_some() {
            let metadata = PartMetadata::from(&field);
            trace!(field = %metadata.field, file_name = %metadata.file_name, "file part");

            let (chunks, receiver) = mpsc::channel(CHUNK_BUFFER);
            if events.send(PartEvent::FileAnnounced { metadata, chunks: receiver }).await.is_err() {
                return Ok(());
            }

            while let Some(chunk) = field.chunk().await? {
                if chunks.send(chunk).await.is_err() {
                    return Ok(());
                }
            }
        } else {
            let name = field.name().map(String::from).unwrap_or_default();
            trace!(field = %name, "field part");

            if events.send(PartEvent::FieldAnnounced { name: name.clone() }).await.is_err() {
                return Ok(());
            }

            let value = field.text().await?;
            if events.send(PartEvent::FieldReceived { name, value }).await.is_err() {
                return Ok(());
            }
        }
    }

    let _ = events.send(PartEvent::Finished).await;
    Ok(())
}
