use axum::body::{Body, Bytes, HttpBody};
use axum::extract::Request;
use axum::http::Extensions;
use axum::middleware::Next;
use axum::response::Response;
use http_body::{Frame, SizeHint};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Temporary paths staged while serving one request.
///
/// Shared through the request extensions between the
/// [multiparser](crate::multiparser), which registers every staged path, and
/// the [cleaner], which removes them once the response is over.
#[derive(Debug, Clone, Default)]
pub struct Staging {
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl Staging {
    /// Returns the registry of the request, inserting a new one if missing.
    pub fn attach(extensions: &mut Extensions) -> Self {
        if let Some(staging) = extensions.get::<Staging>() {
            return staging.clone();
        }
        let staging = Staging::default();
        extensions.insert(staging.clone());
        staging
    }

    pub fn register(&self, path: &Path) {
        self.lock().push(path.to_path_buf());
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().clone()
    }

    fn take(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes every path of a [Staging] registry when dropped.
///
/// Removal happens in the background and failures are only logged. Paths that
/// no longer exist, for example because a handler saved them, are skipped.
#[derive(Debug)]
pub struct RetentionGuard {
    staging: Staging,
}

impl RetentionGuard {
    pub fn new(staging: Staging) -> Self {
        Self { staging }
    }
}

impl Drop for RetentionGuard {
    fn drop(&mut self) {
        let paths = self.staging.take();
        if paths.is_empty() {
            return;
        }

        debug!(count = paths.len(), "removing staged uploads");

        match Handle::try_current() {
            | Ok(handle) => {
                handle.spawn(async move {
                    for path in paths {
                        remove_quietly(&path).await;
                    }
                });
            }
            | Err(_) => {
                for path in paths {
                    log_removal(&path, std::fs::remove_file(&path));
                }
            }
        }
    }
}

/// Middleware removing the files staged during a request once its response is
/// over.
///
/// The cleanup is tied to the response body: it runs after the body has been
/// sent, when the client disconnects, or when the request is dropped before a
/// response was produced.
pub async fn cleaner(mut req: Request, next: Next) -> Response {
    let guard = RetentionGuard::new(Staging::attach(req.extensions_mut()));
    next.run(req).await.map(|inner| Body::new(RetainedBody { inner, _guard: guard }))
}

/// Response body keeping a [RetentionGuard] alive until it is dropped.
struct RetainedBody {
    inner: Body,
    _guard: RetentionGuard,
}

impl HttpBody for RetainedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Removes the file at `path`, logging failures. A missing file is not an
/// error.
pub async fn remove_quietly(path: &Path) {
    log_removal(path, tokio::fs::remove_file(path).await);
}

fn log_removal(path: &Path, result: io::Result<()>) {
    match result {
        | Ok(()) => debug!(path = %path.display(), "removed staged upload"),
        | Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        | Err(err) => warn!(path = %path.display(), error = %err, "could not remove staged upload"),
    }
}
