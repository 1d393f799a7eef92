use crate::cleaner::Staging;
use crate::tokenizer::{self, Tokenizer};
use crate::{Fileman, FilemanError, StagedFile, UploadTracker};
use axum::async_trait;
use axum::body::Body;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use multer::{Constraints, SizeLimit};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tracing::debug;

/// Part events buffered between the tokenizer and the tracker.
const EVENT_BUFFER: usize = 32;

/// Files and fields collected from a multipart request.
///
/// Inserted in the request extensions by the [multiparser] middleware and
/// usable as an axum extractor. Requests that were not processed by the
/// middleware yield an empty upload.
///
/// ## Example
///
/// ```rust
/// use axum::extract::State;
/// use axum::Json;
/// use axum_fileman::{Fileman, FilemanError, StoredFile, Upload};
///
/// async fn upload(
///     State(fileman): State<Fileman>,
///     upload: Upload,
/// ) -> Result<Json<Vec<StoredFile>>, FilemanError> {
///     let mut saved = Vec::new();
///     for file in &upload.files {
///         saved.push(fileman.save(file, "uploads").await?);
///     }
///     Ok(Json(saved))
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Upload {
    /// Staged files, in the order their parts were announced.
    pub files: Vec<StagedFile>,

    /// Field values, parsed as JSON when possible, otherwise kept as strings.
    pub fields: Map<String, Value>,
}

impl Upload {
    /// Deserializes the collected fields into `T`.
    pub fn fields_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Upload
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<Upload>().cloned().unwrap_or_default())
    }
}

impl Fileman {
    /// Stages every file part of a multipart `body` and collects its fields.
    ///
    /// Staged paths are registered in `staging` as soon as their parts are
    /// announced. On error every file staged by this call is removed.
    pub async fn ingest(&self, headers: &HeaderMap, body: Body, staging: Staging) -> Result<Upload, FilemanError> {
        let content_type = headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok());
        let boundary = content_type
            .ok_or(multer::Error::NoMultipart)
            .and_then(multer::parse_boundary)
            .map_err(|source| FilemanError::InvalidRequest { source })?;

        let tokenizer = Tokenizer::new(body.into_data_stream(), boundary, self.constraints());
        let (sender, receiver) = mpsc::channel(EVENT_BUFFER);

        let tokenizer = tokio::spawn(tokenizer::pump(tokenizer, sender));
        let outcome = UploadTracker::new(self.tempdir(), staging).run(receiver).await;
        tokenizer.abort();

        outcome
    }

    fn constraints(&self) -> Constraints {
        let mut size_limit = SizeLimit::new();
        if let Some(max_file_size) = self.max_file_size() {
            size_limit = size_limit.per_field(max_file_size);
        }
        Constraints::new().size_limit(size_limit)
    }
}

/// Middleware parsing `POST` and `PUT` multipart requests.
///
/// File parts are staged to the temporary directory and fields are collected,
/// the resulting [Upload] is attached to the request before the next service
/// runs. Any other request is passed through untouched. Ingestion errors are
/// answered directly and the next service is never called.
///
/// Install the [cleaner](crate::cleaner) as the outer layer so staged files
/// are removed on every outcome, including failed ingestions.
///
/// ## Example
///
/// ```rust,no_run
/// use axum::middleware::{from_fn, from_fn_with_state};
/// use axum::routing::post;
/// use axum::Router;
/// use axum_fileman::{cleaner, multiparser, Fileman, FilemanConfig};
///
/// let fileman = Fileman::new(FilemanConfig::default()).unwrap();
///
/// let app: Router = Router::new()
///     .route("/", post(|| async {}))
///     .layer(from_fn_with_state(fileman.clone(), multiparser))
///     .layer(from_fn(cleaner))
///     .with_state(fileman);
/// ```
pub async fn multiparser(State(fileman): State<Fileman>, mut req: Request, next: Next) -> Response {
    if !is_upload(&req) {
        return next.run(req).await;
    }

    let staging = Staging::attach(req.extensions_mut());
    req.extensions_mut().insert(Upload::default());

    let (mut parts, body) = req.into_parts();
    debug!(method = %parts.method, uri = %parts.uri, "ingesting multipart request");

    match fileman.ingest(&parts.headers, body, staging).await {
        | Ok(upload) => {
            parts.extensions.insert(upload);
            next.run(Request::from_parts(parts, Body::empty())).await
        }
        | Err(err) => err.into_response(),
    }
}

fn is_upload(req: &Request) -> bool {
    if req.method() != Method::POST && req.method() != Method::PUT {
        return false;
    }

    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .is_some_and(|media_type| media_type.type_() == mime::MULTIPART)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn request(method: Method, content_type: Option<&str>) -> Request {
        let mut builder = Request::builder().method(method).uri("/");
        if let Some(content_type) = content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_is_upload() {
        let multipart = Some("multipart/form-data; boundary=X");
        assert!(is_upload(&request(Method::POST, multipart)));
        assert!(is_upload(&request(Method::PUT, multipart)));
        assert!(is_upload(&request(Method::POST, Some("multipart/mixed; boundary=X"))));
        assert!(!is_upload(&request(Method::GET, multipart)));
        assert!(!is_upload(&request(Method::PATCH, multipart)));
        assert!(!is_upload(&request(Method::POST, Some("application/json"))));
        assert!(!is_upload(&request(Method::POST, None)));
    }

    #[test]
    fn test_fields_as() {
        #[derive(Deserialize)]
        struct Fields {
            count: u32,
            greeting: String,
        }

        let mut upload = Upload::default();
        upload.fields.insert("count".to_string(), json!(42));
        upload.fields.insert("greeting".to_string(), json!("hello"));

        let fields: Fields = upload.fields_as().unwrap();
        assert_eq!(fields.count, 42);
        assert_eq!(fields.greeting, "hello");
    }

    #[tokio::test]
    async fn test_extract_missing_upload() {
        let (mut parts, _) = request(Method::GET, None).into_parts();
        let upload = Upload::from_request_parts(&mut parts, &()).await.unwrap();
        assert!(upload.files.is_empty());
        assert!(upload.fields.is_empty());
    }
}
