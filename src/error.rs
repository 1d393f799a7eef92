use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io;
use std::path::PathBuf;

/// Error type shared by every operation of a [Fileman](crate::Fileman)
/// instance.
#[derive(thiserror::Error, Debug)]
pub enum FilemanError {
    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("path '{path}' escapes the storage directory")]
    PathEscape { path: String },

    #[error("request is malformed ({source})")]
    InvalidRequest { source: multer::Error },

    #[error("request body is malformed ({source})")]
    InvalidRequestBody {
        #[from]
        source: multer::Error,
    },

    #[error("request body ended before the multipart stream was finished")]
    IncompleteBody,

    #[error("could not stage upload to '{}' ({source})", .path.display())]
    Staging { path: PathBuf, source: io::Error },

    #[error("could not persist '{}' ({source})", .path.display())]
    Persist { path: PathBuf, source: io::Error },

    #[error("file '{path}' does not exist")]
    NotFound { path: String },

    #[error(transparent)]
    Other {
        #[from]
        source: anyhow::Error,
    },
}

impl FilemanError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub(crate) fn staging(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Staging { path, source }
    }

    pub(crate) fn persist(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Persist { path, source }
    }

    fn get_status(&self) -> StatusCode {
        match self {
            | Self::PathEscape { .. } | Self::IncompleteBody => StatusCode::BAD_REQUEST,
            | Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            | Self::InvalidRequestBody { source } => multer_status(source),
            | Self::NotFound { .. } => StatusCode::NOT_FOUND,
            | Self::Config { .. }
            | Self::Staging { .. }
            | Self::Persist { .. }
            | Self::Other { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn multer_status(error: &multer::Error) -> StatusCode {
    match error {
        | multer::Error::FieldSizeExceeded { .. } | multer::Error::StreamSizeExceeded { .. } => {
            StatusCode::PAYLOAD_TOO_LARGE
        }
        | _ => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for FilemanError {
    fn into_response(self) -> Response {
        (self.get_status(), self.to_string()).into_response()
    }
}
