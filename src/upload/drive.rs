//! Google Drive v3 resumable uploads.
//!
//! A session is opened with the file metadata, then the content is sent in
//! chunks read from disk one at a time. Drive creates the file only when the
//! last chunk lands, so an abandoned session never leaves a partial object
//! in the folder.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use super::auth::ServiceAccountAuth;
use super::{ObjectStore, RemoteObject, UploadTarget};
use crate::errors::TransferError;

pub const DRIVE_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
/// Drive requires every chunk except the last to be a multiple of 256 KiB.
pub const CHUNK_ALIGNMENT: usize = 256 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

const ARTIFACT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone)]
struct ResumableSession {
    uri: String,
    source: PathBuf,
    name: String,
    total: u64,
}

impl ResumableSession {
    fn serves(&self, source: &Path, name: &str, total: u64) -> bool {
        self.source == source && self.name == name && self.total == total
    }
}

enum Progress {
    Committed(u64),
    Complete(RemoteObject),
}

/// [`ObjectStore`] backed by a Drive folder.
///
/// The open session survives a failed attempt, so the next attempt for the
/// same file asks Drive how much it already has and continues from there.
pub struct DriveStore {
    http: reqwest::Client,
    auth: ServiceAccountAuth,
    upload_url: String,
    session: Mutex<Option<ResumableSession>>,
}

impl DriveStore {
    pub fn new() -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            // Drive answers intermediate chunks with 308 and no Location.
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            auth: ServiceAccountAuth::new(http.clone()),
            http,
            upload_url: DRIVE_UPLOAD_URL.to_string(),
            session: Mutex::new(None),
        })
    }

    /// Points uploads at another endpoint (a proxy, or a mock server in tests).
    pub fn with_upload_url(mut self, upload_url: impl Into<String>) -> Self {
        self.upload_url = upload_url.into();
        self
    }

    async fn open_session(
        &self,
        token: &str,
        source: &Path,
        name: &str,
        total: u64,
        folder_id: &str,
    ) -> Result<ResumableSession, TransferError> {
        const OPERATION: &str = "open upload session";
        let mut url = Url::parse(&self.upload_url).map_err(|e| TransferError::Protocol {
            operation: OPERATION,
            detail: format!("invalid upload URL {:?}: {e}", self.upload_url),
        })?;
        url.query_pairs_mut()
            .append_pair("uploadType", "resumable")
            .append_pair("supportsAllDrives", "true")
            .append_pair("fields", "id,name");

        let metadata = serde_json::json!({
            "name": name,
            "parents": [folder_id],
            "mimeType": ARTIFACT_MIME_TYPE,
        });
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .header("X-Upload-Content-Type", ARTIFACT_MIME_TYPE)
            .header("X-Upload-Content-Length", total)
            .json(&metadata)
            .send()
            .await
            .map_err(|source| TransferError::Network { operation: OPERATION, source })?;

        if !response.status().is_success() {
            return Err(status_error(OPERATION, response).await);
        }
        let uri = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| TransferError::Protocol {
                operation: OPERATION,
                detail: "response carried no Location header".to_string(),
            })?
            .to_string();

        debug!(name, total, "Opened resumable upload session");
        Ok(ResumableSession {
            uri,
            source: source.to_path_buf(),
            name: name.to_string(),
            total,
        })
    }

    async fn query_progress(&self, token: &str, session: &ResumableSession) -> Result<Progress, TransferError> {
        const OPERATION: &str = "query upload status";
        let response = self
            .http
            .put(&session.uri)
            .bearer_auth(token)
            .header(CONTENT_RANGE, format!("bytes */{}", session.total))
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|source| TransferError::Network { operation: OPERATION, source })?;
        read_progress(OPERATION, response).await
    }

    async fn send_chunk(
        &self,
        token: &str,
        session: &ResumableSession,
        file: &mut tokio::fs::File,
        offset: u64,
        chunk_size: usize,
    ) -> Result<Progress, TransferError> {
        const OPERATION: &str = "upload chunk";
        let end = (offset + chunk_size as u64).min(session.total);
        let mut chunk = vec![0u8; (end - offset) as usize];
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut chunk).await?;

        let content_range = if session.total == 0 {
            "bytes */0".to_string()
        } else {
            format!("bytes {}-{}/{}", offset, end - 1, session.total)
        };
        debug!(%content_range, "Sending chunk");

        let response = self
            .http
            .put(&session.uri)
            .bearer_auth(token)
            .header(CONTENT_TYPE, ARTIFACT_MIME_TYPE)
            .header(CONTENT_RANGE, content_range)
            .body(chunk)
            .send()
            .await
            .map_err(|source| TransferError::Network { operation: OPERATION, source })?;
        read_progress(OPERATION, response).await
    }
}

#[async_trait]
impl ObjectStore for DriveStore {
    async fn put_file(
        &self,
        source: &Path,
        name: &str,
        target: &UploadTarget<'_>,
    ) -> Result<RemoteObject, TransferError> {
        let total = tokio::fs::metadata(source).await?.len();
        let token = self.auth.access_token(target.credential).await?;

        let mut current = self.session.lock().await;
        let reusable = current.as_ref().filter(|s| s.serves(source, name, total)).cloned();
        let (session, mut offset) = match reusable {
            Some(session) => match self.query_progress(&token, &session).await {
                Ok(Progress::Complete(object)) => {
                    *current = None;
                    return Ok(object);
                }
                Ok(Progress::Committed(committed)) => {
                    let committed = within_session(committed, &session)?;
                    info!(committed, total, "↻ Resuming upload session");
                    (session, committed)
                }
                Err(TransferError::SessionExpired) => {
                    info!("Previous upload session expired, starting a new one");
                    let fresh = self.open_session(&token, source, name, total, target.folder_id).await?;
                    (fresh, 0)
                }
                Err(e) => return Err(e),
            },
            None => {
                let fresh = self.open_session(&token, source, name, total, target.folder_id).await?;
                (fresh, 0)
            }
        };
        *current = Some(session.clone());

        let chunk_size = aligned_chunk_size(target.chunk_size);
        let mut file = tokio::fs::File::open(source).await?;
        loop {
            let token = self.auth.access_token(target.credential).await?;
            match self.send_chunk(&token, &session, &mut file, offset, chunk_size).await {
                Ok(Progress::Complete(object)) => {
                    *current = None;
                    return Ok(object);
                }
                Ok(Progress::Committed(committed)) => {
                    offset = within_session(committed, &session)?;
                    debug!(committed, total, "Chunk accepted");
                }
                Err(TransferError::SessionExpired) => {
                    *current = None;
                    return Err(TransferError::SessionExpired);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Rounds `bytes` up to Drive's 256 KiB granularity; zero means the default.
pub fn aligned_chunk_size(bytes: usize) -> usize {
    if bytes == 0 {
        return DEFAULT_CHUNK_SIZE;
    }
    bytes.div_ceil(CHUNK_ALIGNMENT) * CHUNK_ALIGNMENT
}

async fn read_progress(operation: &'static str, response: reqwest::Response) -> Result<Progress, TransferError> {
    match response.status() {
        StatusCode::OK | StatusCode::CREATED => {
            let object = response
                .json::<RemoteObject>()
                .await
                .map_err(|e| TransferError::Protocol { operation, detail: e.to_string() })?;
            Ok(Progress::Complete(object))
        }
        StatusCode::PERMANENT_REDIRECT => Ok(Progress::Committed(committed_bytes(&response)?)),
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(TransferError::SessionExpired),
        _ => Err(status_error(operation, response).await),
    }
}

/// A committed range past the end of the file means the reply is not from
/// this session.
fn within_session(committed: u64, session: &ResumableSession) -> Result<u64, TransferError> {
    if committed > session.total {
        return Err(TransferError::Protocol {
            operation: "upload chunk",
            detail: format!("store reports {committed} bytes committed of a {}-byte upload", session.total),
        });
    }
    Ok(committed)
}

/// Reads `Range: bytes=0-N` from a 308 reply; no header means nothing was kept.
fn committed_bytes(response: &reqwest::Response) -> Result<u64, TransferError> {
    let Some(range) = response.headers().get(RANGE) else {
        return Ok(0);
    };
    range
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("bytes=0-"))
        .and_then(|last| last.parse::<u64>().ok())
        .map(|last| last + 1)
        .ok_or_else(|| TransferError::Protocol {
            operation: "upload chunk",
            detail: format!("unparseable Range header {range:?}"),
        })
}

async fn status_error(operation: &'static str, response: reqwest::Response) -> TransferError {
    TransferError::Status {
        operation,
        status: response.status().as_u16(),
        body: response.text().await.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_rounds_to_alignment() {
        assert_eq!(aligned_chunk_size(0), DEFAULT_CHUNK_SIZE);
        assert_eq!(aligned_chunk_size(1), CHUNK_ALIGNMENT);
        assert_eq!(aligned_chunk_size(CHUNK_ALIGNMENT * 3), CHUNK_ALIGNMENT * 3);
        assert_eq!(aligned_chunk_size(CHUNK_ALIGNMENT + 1), CHUNK_ALIGNMENT * 2);
    }

    #[test]
    fn test_session_matches_same_file_only() {
        let session = ResumableSession {
            uri: "https://example.test/session".into(),
            source: PathBuf::from("/tmp/a.enc"),
            name: "a.enc".into(),
            total: 10,
        };
        assert!(session.serves(Path::new("/tmp/a.enc"), "a.enc", 10));
        assert!(!session.serves(Path::new("/tmp/a.enc"), "a.enc", 11));
        assert!(!session.serves(Path::new("/tmp/b.enc"), "a.enc", 10));
    }

    #[test]
    fn test_committed_range_past_end_is_rejected() {
        let session = ResumableSession {
            uri: "https://example.test/session".into(),
            source: PathBuf::from("/tmp/a.enc"),
            name: "a.enc".into(),
            total: 1000,
        };
        assert_eq!(within_session(1000, &session).unwrap(), 1000);
        assert!(matches!(
            within_session(10_000_000, &session),
            Err(TransferError::Protocol { .. })
        ));
    }
}
