use crate::FilemanError;
use serde::Deserialize;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const STORDIR_NAME: &str = "fileman-storage";
const TEMPDIR_NAME: &str = "fileman-uploads";

/// Options recognized when building a [Fileman] instance.
///
/// Every option is optional, unset values fall back to defaults derived from
/// the running process.
///
/// ## Example
///
/// ```rust
/// use axum_fileman::{Fileman, FilemanConfig};
///
/// let config = FilemanConfig {
///     stordir: Some("/srv/files".into()),
///     tempdir: Some("/tmp/uploads".into()),
///     ..Default::default()
/// };
///
/// let fileman = Fileman::new(config).unwrap();
/// assert_eq!(fileman.stordir().to_str(), Some("/srv/files"));
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilemanConfig {
    /// Root directory of the persisted files.
    ///
    /// Defaults to `fileman-storage` inside the user's home directory.
    pub stordir: Option<PathBuf>,

    /// Root directory where uploads are staged while a request is in flight.
    ///
    /// Defaults to `fileman-uploads` inside the system temp directory.
    pub tempdir: Option<PathBuf>,

    /// Maximum size in bytes of a single uploaded part.
    pub max_file_size: Option<u64>,
}

impl FilemanConfig {
    /// Reads the options from `FILEMAN_STORDIR`, `FILEMAN_TEMPDIR` and
    /// `FILEMAN_MAX_FILE_SIZE`.
    pub fn from_env() -> Result<Self, FilemanError> {
        Self::from_vars(|name| env::var_os(name))
    }

    fn from_vars(var: impl Fn(&str) -> Option<OsString>) -> Result<Self, FilemanError> {
        let max_file_size = match var("FILEMAN_MAX_FILE_SIZE") {
            Some(value) => {
                let value = value.to_string_lossy();
                Some(value.trim().parse::<u64>().map_err(|_| {
                    FilemanError::config(format!("FILEMAN_MAX_FILE_SIZE must be a byte count, got '{value}'"))
                })?)
            }
            None => None,
        };

        Ok(Self {
            stordir: var("FILEMAN_STORDIR").map(PathBuf::from),
            tempdir: var("FILEMAN_TEMPDIR").map(PathBuf::from),
            max_file_size,
        })
    }

    /// Default storage root: `$HOME/fileman-storage` (or `%USERPROFILE%`).
    pub fn default_stordir() -> Option<PathBuf> {
        env::var_os("HOME")
            .or_else(|| env::var_os("USERPROFILE"))
            .filter(|home| !home.is_empty())
            .map(|home| PathBuf::from(home).join(STORDIR_NAME))
    }

    /// Default staging root: `fileman-uploads` in the system temp directory.
    pub fn default_tempdir() -> PathBuf {
        env::temp_dir().join(TEMPDIR_NAME)
    }
}

#[derive(Debug)]
struct Settings {
    stordir: PathBuf,
    tempdir: PathBuf,
    max_file_size: Option<u64>,
}

/// An independently configured file manager.
///
/// Cloning is cheap, all clones share the same settings. Use it as axum state
/// for the [multiparser](crate::multiparser) middleware and in handlers to
/// [save](Fileman::save), [resolve](Fileman::resolve),
/// [read](Fileman::read) and [serve](Fileman::serve) files.
#[derive(Debug, Clone)]
pub struct Fileman {
    settings: Arc<Settings>,
}

impl Fileman {
    /// Builds a new instance, validating `config` and applying the defaults.
    pub fn new(config: FilemanConfig) -> Result<Self, FilemanError> {
        let stordir = match config.stordir {
            Some(stordir) => checked_dir("stordir", stordir)?,
            None => FilemanConfig::default_stordir().ok_or_else(|| {
                FilemanError::config("stordir is not set and no home directory could be found")
            })?,
        };
        let tempdir = match config.tempdir {
            Some(tempdir) => checked_dir("tempdir", tempdir)?,
            None => FilemanConfig::default_tempdir(),
        };
        if config.max_file_size == Some(0) {
            return Err(FilemanError::config("max_file_size must be greater than zero"));
        }

        debug!(stordir = %stordir.display(), tempdir = %tempdir.display(), "configured fileman");

        let settings = Settings { stordir, tempdir, max_file_size: config.max_file_size };
        Ok(Self { settings: Arc::new(settings) })
    }

    /// Root directory of the persisted files.
    pub fn stordir(&self) -> &Path {
        &self.settings.stordir
    }

    /// Root directory of the staged uploads.
    pub fn tempdir(&self) -> &Path {
        &self.settings.tempdir
    }

    /// Maximum size in bytes of a single uploaded part, if limited.
    pub fn max_file_size(&self) -> Option<u64> {
        self.settings.max_file_size
    }

    /// Creates the storage and staging directories if they are missing.
    pub async fn ensure(&self) -> Result<(), FilemanError> {
        tokio::fs::create_dir_all(self.stordir())
            .await
            .map_err(FilemanError::persist(self.stordir()))?;
        tokio::fs::create_dir_all(self.tempdir())
            .await
            .map_err(FilemanError::staging(self.tempdir()))?;
        Ok(())
    }
}

fn checked_dir(option: &str, dir: PathBuf) -> Result<PathBuf, FilemanError> {
    if dir.as_os_str().is_empty() {
        return Err(FilemanError::config(format!("{option} must not be empty")));
    }
    Ok(crate::resolve::normalize(&dir))
}
