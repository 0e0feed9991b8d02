use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::session::SessionClient;

/// Gives up looking for a free filename after this many suffixed attempts.
const MAX_NAME_ATTEMPTS: u32 = 100;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media unavailable for message {message_id}: {reason}")]
    Unavailable { message_id: String, reason: String },
    #[error("failed to store media at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MediaError {
    fn storage(path: &Path, source: std::io::Error) -> Self {
        MediaError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A captured attachment, as reported in the webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub file_path: String,
    pub mimetype: String,
    pub filename: String,
    pub filesize_bytes: u64,
}

/// Downloads message attachments from the session and writes them to disk.
pub struct MediaCapture {
    session: Arc<dyn SessionClient>,
}

impl MediaCapture {
    pub fn new(session: Arc<dyn SessionClient>) -> Self {
        Self { session }
    }

    /// Fetch the attachment of `message_id` and persist it under
    /// `destination_dir`. Never overwrites an existing file.
    pub async fn capture(
        &self,
        message_id: &str,
        destination_dir: &Path,
    ) -> Result<MediaInfo, MediaError> {
        let payload = self.session.download_media(message_id).await?;

        tokio::fs::create_dir_all(destination_dir)
            .await
            .map_err(|e| MediaError::storage(destination_dir, e))?;

        let wanted = derive_filename(payload.filename.as_deref(), message_id, &payload.mimetype);
        let path = write_unique(destination_dir, &wanted, &payload.data).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(wanted);

        info!(
            "Saved media for {} to {} ({} bytes)",
            message_id,
            path.display(),
            payload.data.len()
        );

        Ok(MediaInfo {
            file_path: path.display().to_string(),
            mimetype: payload.mimetype,
            filename,
            filesize_bytes: payload.data.len() as u64,
        })
    }
}

/// Final path component of the declared name, with separators and control
/// characters replaced. Falls back to `<message_id>.<ext>`.
fn derive_filename(declared: Option<&str>, message_id: &str, mimetype: &str) -> String {
    if let Some(name) = declared.map(sanitize).filter(|n| !n.is_empty()) {
        return name;
    }
    let stem = sanitize(message_id);
    let stem = if stem.is_empty() { "media".to_string() } else { stem };
    format!("{}.{}", stem, extension_for(mimetype))
}

fn sanitize(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    cleaned.trim().trim_start_matches('.').to_string()
}

/// `image/jpeg; charset=binary` -> `jpg`. Only ASCII alphanumerics survive.
fn extension_for(mimetype: &str) -> String {
    let essence = mimetype.split(';').next().unwrap_or("").trim();
    let subtype = essence
        .split_once('/')
        .map(|(_, sub)| sub)
        .unwrap_or("")
        .split('+')
        .next()
        .unwrap_or("");
    let ext: String = match subtype {
        "octet-stream" => "bin".to_string(),
        "jpeg" => "jpg".to_string(),
        "plain" => "txt".to_string(),
        "mpeg" => "mp3".to_string(),
        other => other
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect(),
    };
    if ext.is_empty() {
        "bin".to_string()
    } else {
        ext
    }
}

/// `photo.jpg` -> (`photo`, Some(`jpg`))
fn split_name(filename: &str) -> (&str, Option<&str>) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    }
}

fn with_suffix(filename: &str, suffix: &str) -> String {
    match split_name(filename) {
        (stem, Some(ext)) => format!("{}-{}.{}", stem, suffix, ext),
        (stem, None) => format!("{}-{}", stem, suffix),
    }
}

/// Create `filename` under `dir` without clobbering anything. On collision
/// the name gets the current Unix millis appended, then a counter.
async fn write_unique(dir: &Path, filename: &str, data: &[u8]) -> Result<PathBuf, MediaError> {
    let millis = chrono::Utc::now().timestamp_millis();
    let candidates = std::iter::once(filename.to_string())
        .chain(std::iter::once(with_suffix(filename, &millis.to_string())))
        .chain((1..MAX_NAME_ATTEMPTS).map(|n| with_suffix(filename, &format!("{}-{}", millis, n))));

    for name in candidates {
        let path = dir.join(&name);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Media file {} exists, trying another name", path.display());
                continue;
            }
            Err(e) => return Err(MediaError::storage(&path, e)),
        };

        let written = async {
            file.write_all(data).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove partial media file {}: {}", path.display(), cleanup);
            }
            return Err(MediaError::storage(&path, e));
        }
        return Ok(path);
    }

    Err(MediaError::storage(
        &dir.join(filename),
        std::io::Error::new(ErrorKind::AlreadyExists, "no free filename"),
    ))
}
