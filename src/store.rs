use crate::cleaner::remove_quietly;
use crate::resolve::{join_within, relative_key};
use crate::{Fileman, FilemanError, StagedFile, StoredFile};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use std::io;
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

const BUFFER_SIZE: usize = 64 * 1024;

/// MD5 digest of a file plus the media type sniffed from its first bytes.
#[derive(Debug)]
pub(crate) struct FileDigest {
    pub md5: String,
    pub media_type: Option<String>,
}

impl Fileman {
    /// Moves a staged file into the `dest` sub directory of the storage
    /// directory.
    ///
    /// The file keeps the unique name it was staged with, the original name is
    /// only kept in the returned descriptor. Size and hash are taken from the
    /// staged file before it is moved. When copying across file systems fails
    /// the partial copy at the destination is removed.
    pub async fn save(&self, file: &StagedFile, dest: &str) -> Result<StoredFile, FilemanError> {
        let dir = join_within(self.stordir(), dest)?;
        let basename = file.path.file_name().ok_or_else(|| FilemanError::Persist {
            path: file.path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "staged path has no file name"),
        })?;
        let outpath = dir.join(basename);
        let key = relative_key(self.stordir(), &outpath).ok_or_else(|| FilemanError::Persist {
            path: outpath.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, "destination is not valid UTF-8"),
        })?;

        debug!(from = %file.path.display(), to = %outpath.display(), "saving staged file");

        let stats = fs::metadata(&file.path).await.map_err(FilemanError::persist(&file.path))?;
        let modified = stats.modified().map_err(FilemanError::persist(&file.path))?;
        let digest = digest_file(&file.path).await.map_err(FilemanError::persist(&file.path))?;

        fs::create_dir_all(&dir).await.map_err(FilemanError::persist(&dir))?;
        move_file(&file.path, &outpath).await.map_err(FilemanError::persist(&outpath))?;

        info!(path = %key, size = stats.len(), md5 = %digest.md5, "saved file");

        Ok(StoredFile {
            name: file.name.clone(),
            path: key,
            encoding: file.encoding.clone(),
            media_type: file.media_type.clone().or(digest.media_type),
            md5: digest.md5,
            size: stats.len(),
            modified: DateTime::<Utc>::from(modified),
        })
    }
}

/// Renames `from` to `to`, copying when both are on different file systems.
///
/// Only a failed copy removes `to`, a missing source leaves the destination
/// untouched.
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to).await {
        | Ok(()) => Ok(()),
        | Err(err) if err.kind() == io::ErrorKind::NotFound => Err(err),
        | Err(err) => {
            debug!(error = %err, "rename failed, copying instead");
            if let Err(err) = fs::copy(from, to).await {
                remove_quietly(to).await;
                return Err(err);
            }
            // The file is persisted, a leftover source is removed by the cleaner.
            remove_quietly(from).await;
            Ok(())
        }
    }
}

pub(crate) async fn digest_file(path: &Path) -> io::Result<FileDigest> {
    let mut file = File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut media_type = None;
    let mut first = true;

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        if first {
            media_type = infer::get(&buffer[..n]).map(|kind| kind.mime_type().to_string());
            first = false;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(FileDigest { md5: hex::encode(hasher.finalize()), media_type })
}
