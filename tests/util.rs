#![allow(dead_code)]

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_fileman::{cleaner, multiparser, Fileman, FilemanConfig, FilemanError, StagedFile, StoredFile, Upload};
use axum_test_helper::TestClient;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub struct App {
    pub root: TempDir,
    pub fileman: Fileman,
    pub client: TestClient,
}

pub fn app() -> App {
    app_with(FilemanConfig::default())
}

pub fn app_with(config: FilemanConfig) -> App {
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_test_writer().try_init();

    let root = TempDir::new().unwrap();
    let config = FilemanConfig {
        stordir: Some(root.path().join("storage")),
        tempdir: Some(root.path().join("uploads")),
        ..config
    };
    let fileman = Fileman::new(config).unwrap();
    let client = TestClient::new(router(fileman.clone()));
    App { root, fileman, client }
}

fn router(fileman: Fileman) -> Router {
    Router::new()
        .route("/", get(|| async {}).post(save).put(save))
        .route("/fields", post(fields))
        .route("/staged", post(staged))
        .route("/file", get(file))
        .layer(from_fn_with_state(fileman.clone(), multiparser))
        .layer(from_fn(cleaner))
        .with_state(fileman)
}

async fn save(State(fileman): State<Fileman>, upload: Upload) -> Result<Json<Vec<StoredFile>>, FilemanError> {
    let mut saved = Vec::new();
    for file in &upload.files {
        saved.push(fileman.save(file, "with-post").await?);
    }
    Ok(Json(saved))
}

async fn fields(upload: Upload) -> Json<Value> {
    Json(Value::Object(upload.fields))
}

async fn staged(upload: Upload) -> Json<Vec<StagedFile>> {
    let staged = upload.files.iter().filter(|file| file.path.is_file()).cloned().collect();
    Json(staged)
}

#[derive(Deserialize)]
struct FileQuery {
    path: Option<String>,
}

async fn file(
    State(fileman): State<Fileman>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Result<Response, FilemanError> {
    match query.path {
        | Some(path) => fileman.serve(path.as_str(), &headers).await,
        | None => Ok(StatusCode::BAD_REQUEST.into_response()),
    }
}

/// Waits for the background cleanup to empty `dir`.
pub async fn wait_until_empty(dir: &Path) -> bool {
    for _ in 0..200 {
        match std::fs::read_dir(dir) {
            | Ok(mut entries) => {
                if entries.next().is_none() {
                    return true;
                }
            }
            | Err(_) => return true,
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
