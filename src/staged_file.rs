use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const DEFAULT_ENCODING: &str = "7bit";

/// Information about a file part supplied by the client in the request.
#[derive(Debug, Clone, Default)]
pub struct PartMetadata {
    /// Name of the HTML field in the form.
    ///
    /// Extracted from the
    /// [`Content-Disposition`](https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/Content-Disposition)
    /// header.
    pub field: String,

    /// Original name of the file transmitted.
    ///
    /// The filename must not be used blindly by the application: only its
    /// extension is carried over to the staged file name.
    pub file_name: String,

    /// Transfer encoding of the part, `7bit` unless the client sent a
    /// `Content-Transfer-Encoding` header.
    pub encoding: String,

    /// MIME type of the part.
    ///
    /// Extracted from the
    /// [`Content-Type`](https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/Content-Type)
    /// header.
    pub media_type: Option<String>,
}

impl From<&multer::Field<'_>> for PartMetadata {
    fn from(field: &multer::Field) -> Self {
        Self {
            field: field.name().map(String::from).unwrap_or_default(),
            file_name: field.file_name().map(String::from).unwrap_or_default(),
            encoding: transfer_encoding(field.headers()),
            media_type: field.content_type().map(ToString::to_string),
        }
    }
}

fn transfer_encoding(headers: &HeaderMap) -> String {
    headers
        .get("content-transfer-encoding")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_ENCODING.to_string())
}

/// A file part staged to the temporary directory during a request.
///
/// The temporary path is reserved as soon as the part is announced, it is
/// built from a random token followed by the extension of the original file
/// name so concurrent uploads never collide.
///
/// There is no write-completion flag: an [Upload](crate::Upload) is only
/// handed out once every staged file has been fully written, so every
/// `StagedFile` a handler sees is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub field: String,
    pub path: PathBuf,
    pub name: Option<String>,
    pub encoding: Option<String>,
    pub media_type: Option<String>,
}

impl StagedFile {
    /// Reserves a new temporary path inside `tempdir` for the announced part.
    pub fn reserve(tempdir: &Path, metadata: PartMetadata) -> Self {
        let mut token = Uuid::new_v4().to_string();
        if let Some(extension) = Path::new(&metadata.file_name).extension().and_then(|e| e.to_str()) {
            token.push('.');
            token.push_str(extension);
        }

        Self {
            field: metadata.field,
            path: tempdir.join(token),
            name: Some(metadata.file_name).filter(|name| !name.is_empty()),
            encoding: Some(metadata.encoding),
            media_type: metadata.media_type,
        }
    }

    /// Describes an existing file so it can be handed to
    /// [Fileman::save](crate::Fileman::save) without going through a request.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.file_name().and_then(|name| name.to_str()).map(String::from);
        Self { field: String::new(), path, name, encoding: None, media_type: None }
    }
}
