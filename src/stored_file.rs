use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Descriptor of a file persisted in the storage directory.
///
/// Returned by [Fileman::save](crate::Fileman::save). The `path` is relative to
/// the storage root and can be passed back to
/// [Fileman::resolve](crate::Fileman::resolve), [Fileman::read](crate::Fileman::read)
/// or [Fileman::serve](crate::Fileman::serve).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    /// Original name of the uploaded file, for display purposes only.
    pub name: Option<String>,
    /// Storage-relative path, `/` separated.
    pub path: String,
    pub encoding: Option<String>,
    pub media_type: Option<String>,
    /// Hex encoded MD5 digest of the contents.
    pub md5: String,
    /// Size in bytes.
    pub size: u64,
    pub modified: DateTime<Utc>,
}
