use crate::{checksums_match, crc32c_from_hash_header, CloudClient, Crc32cHasher, Downloaded};
use derive_more::{Display, Error};
use futures_util::StreamExt;
use miette::Diagnostic;
use packsync_config::MAX_PACKAGE_SIZE;
use reqwest::{header, Response, StatusCode};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::io::AsyncWriteExt;

/// Error type of [`DownloadArchive`] and [`ResumeDownload`](crate::ResumeDownload).
#[derive(Debug, Display, Error, Diagnostic)]
pub enum DownloadError {
    #[display("Request to {url} failed: {error}")]
    Request {
        url: String,
        #[error(source)]
        error: reqwest::Error,
    },
    #[display("Unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { url: String, status: StatusCode },
    #[display("Response from {url} is missing the {header} header")]
    MissingHeader { url: String, header: &'static str },
    #[display("Failed to write downloaded bytes to {path:?}: {error}")]
    WriteFile {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    #[display("Archive at {url} exceeds the {limit}-byte package size limit")]
    TooLarge { url: String, limit: u64 },
    #[display("Downloaded archive did not match expected hash {expected}: computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },
    #[display("Unparseable checksum in x-goog-hash header: {value}")]
    BadHashHeader { value: String },
    #[display("Download was cancelled")]
    Cancelled,
}

/// Authenticated single-shot GET of a package archive.
///
/// Streams the body into `destination` while hashing it, then holds the
/// computed CRC32C against the server's `x-goog-hash` claim. On a mismatch
/// the destination file is deleted so a truncated or tampered archive never
/// survives on disk.
#[must_use]
pub struct DownloadArchive<'a> {
    pub client: &'a CloudClient,
    pub url: &'a str,
    pub destination: &'a Path,
    pub cancel: &'a tokio_util::sync::CancellationToken,
}

impl<'a> DownloadArchive<'a> {
    /// Execute the subroutine.
    pub async fn run(self) -> Result<Downloaded, DownloadError> {
        let DownloadArchive { client, url, destination, cancel } = self;

        tracing::debug!(target: "packsync::download", url, destination = %destination.display(), "Downloading archive");

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|error| DownloadError::Request { url: url.to_string(), error })?;
        if response.status() != StatusCode::OK {
            return Err(DownloadError::UnexpectedStatus {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let content_type = header_string(&response, header::CONTENT_TYPE.as_str());
        let expected_checksum = expected_checksum(&response);

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|error| DownloadError::WriteFile { path: destination.to_path_buf(), error })?;
        let mut hasher = Crc32cHasher::new();
        let mut received: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            if cancel.is_cancelled() {
                drop(file);
                let _ = tokio::fs::remove_file(destination).await;
                return Err(DownloadError::Cancelled);
            }
            let chunk =
                chunk.map_err(|error| DownloadError::Request { url: url.to_string(), error })?;
            received += chunk.len() as u64;
            if received > MAX_PACKAGE_SIZE {
                drop(file);
                let _ = tokio::fs::remove_file(destination).await;
                return Err(DownloadError::TooLarge {
                    url: url.to_string(),
                    limit: MAX_PACKAGE_SIZE,
                });
            }
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|error| DownloadError::WriteFile { path: destination.to_path_buf(), error })?;
        }
        file.sync_all()
            .await
            .map_err(|error| DownloadError::WriteFile { path: destination.to_path_buf(), error })?;
        drop(file);

        let computed = hasher.to_base64();
        if let Some(expected) = expected_checksum {
            verify_or_remove(&expected, &computed, destination).await?;
        }
        Ok(Downloaded { checksum: computed, content_type })
    }
}

pub(crate) fn header_string(response: &Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// The server's CRC32C claim, when it makes one.
pub(crate) fn expected_checksum(response: &Response) -> Option<String> {
    response
        .headers()
        .get("x-goog-hash")
        .and_then(|value| value.to_str().ok())
        .and_then(crc32c_from_hash_header)
        .map(str::to_string)
}

pub(crate) async fn verify_or_remove(
    expected: &str,
    computed: &str,
    destination: &Path,
) -> Result<(), DownloadError> {
    let matches = checksums_match(expected, computed)
        .map_err(|_| DownloadError::BadHashHeader { value: expected.to_string() })?;
    if matches {
        return Ok(());
    }
    let _ = tokio::fs::remove_file(destination).await;
    Err(DownloadError::ChecksumMismatch {
        expected: expected.to_string(),
        computed: computed.to_string(),
    })
}
