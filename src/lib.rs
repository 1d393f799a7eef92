//! Multipart upload handling for axum: uploads are staged to a temporary
//! directory by the [multiparser] middleware, persisted into a storage tree
//! with [Fileman::save] and served back with [Fileman::serve]. The [cleaner]
//! middleware removes whatever was staged once the response is over.

mod cleaner;
mod config;
mod error;
mod ingest;
mod read;
mod resolve;
mod staged_file;
mod state;
mod store;
mod stored_file;
mod tokenizer;
mod tracker;

pub use cleaner::{cleaner, remove_quietly, RetentionGuard, Staging};
pub use config::{Fileman, FilemanConfig};
pub use error::FilemanError;
pub use ingest::{multiparser, Upload};
pub use resolve::FileRef;
pub use staged_file::{PartMetadata, StagedFile};
pub use state::{IngestState, Phase};
pub use stored_file::StoredFile;
pub use tracker::{PartEvent, UploadTracker};
