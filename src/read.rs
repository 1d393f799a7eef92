use crate::store::digest_file;
use crate::{FileRef, Fileman, FilemanError};
use anyhow::anyhow;
use axum::body::Body;
use axum::http::header::{
    CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH, LAST_MODIFIED,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use std::io;
use std::path::Path;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::debug;

const CACHE_CONTROL_VALUE: &str = "max-age=31536000";
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

impl Fileman {
    /// Opens a persisted file for reading.
    pub async fn read<'a>(&self, file: impl Into<FileRef<'a>>) -> Result<File, FilemanError> {
        let file = file.into();
        let path = self.resolve(file)?;
        File::open(&path).await.map_err(|err| read_error(file, &path, err))
    }

    /// Builds a response streaming a persisted file with caching headers.
    ///
    /// The `ETag` is the MD5 digest of the contents, taken from the descriptor
    /// when one is given. A request whose `If-None-Match` matches it is
    /// answered with `304 Not Modified`.
    ///
    /// Serving by path hashes the whole file on every call, revalidations
    /// included. Pass the [StoredFile](crate::StoredFile) returned by
    /// [save](Fileman::save) to skip that read.
    pub async fn serve<'a>(
        &self,
        file: impl Into<FileRef<'a>>,
        request_headers: &HeaderMap,
    ) -> Result<Response, FilemanError> {
        let file = file.into();
        let path = self.resolve(file)?;

        let stats = fs::metadata(&path).await.map_err(|err| read_error(file, &path, err))?;
        if !stats.is_file() {
            return Err(FilemanError::NotFound { path: file.path().to_string() });
        }

        let (md5, media_type) = match file {
            | FileRef::ByDescriptor(stored) => (stored.md5.clone(), stored.media_type.clone()),
            | FileRef::ByPath(_) => {
                let digest = digest_file(&path).await.map_err(|err| read_error(file, &path, err))?;
                (digest.md5, digest.media_type)
            }
        };

        let etag = format!("\"{md5}\"");
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_VALUE));
        insert(&mut headers, ETAG, &etag);
        if let Ok(modified) = stats.modified() {
            insert(&mut headers, LAST_MODIFIED, &DateTime::<Utc>::from(modified).format(HTTP_DATE).to_string());
        }

        if etag_matches(request_headers, &etag) {
            debug!(path = %file.path(), "file not modified");
            return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
        }

        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            let name = name.replace('"', "'");
            insert(&mut headers, CONTENT_DISPOSITION, &format!("inline; filename=\"{name}\""));
        }
        let media_type = media_type.unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());
        insert(&mut headers, CONTENT_TYPE, &media_type);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(stats.len()));

        let reader = File::open(&path).await.map_err(|err| read_error(file, &path, err))?;
        debug!(path = %file.path(), size = stats.len(), "serving file");

        Ok((headers, Body::from_stream(ReaderStream::new(reader))).into_response())
    }
}

fn insert(headers: &mut HeaderMap, name: axum::http::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn etag_matches(request_headers: &HeaderMap, etag: &str) -> bool {
    request_headers
        .get_all(IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate.trim_start_matches("W/") == etag)
}

fn read_error(file: FileRef, path: &Path, err: io::Error) -> FilemanError {
    match err.kind() {
        | io::ErrorKind::NotFound => FilemanError::NotFound { path: file.path().to_string() },
        | _ => anyhow!(err).context(format!("could not read '{}'", path.display())).into(),
    }
}
