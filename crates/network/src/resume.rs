use crate::{
    download::{expected_checksum, header_string, verify_or_remove},
    CloudClient, Crc32cHasher, DownloadError, Downloaded,
};
use futures_util::StreamExt;
use packsync_config::MAX_PACKAGE_SIZE;
use reqwest::{header, StatusCode};
use std::{
    io::Read,
    path::Path,
    time::{Duration, Instant},
};
use tokio::io::AsyncWriteExt;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Ranged-GET download that can complete a partially-written destination
/// file.
///
/// A HEAD request learns the total length and the expected checksum, then
/// ranged GETs append whatever is still missing. Because earlier bytes may
/// already be on disk, the CRC32C is recomputed over the whole file at the
/// end rather than on the wire.
#[must_use]
pub struct ResumeDownload<'a> {
    pub client: &'a CloudClient,
    pub url: &'a str,
    pub destination: &'a Path,
    pub cancel: &'a tokio_util::sync::CancellationToken,
    /// Cap on the bytes asked for per ranged request. Only exists so tests
    /// can force the multi-request resume path; `None` asks for the rest of
    /// the file at once.
    pub max_bytes_per_request: Option<u64>,
}

impl<'a> ResumeDownload<'a> {
    /// Execute the subroutine.
    pub async fn run(self) -> Result<Downloaded, DownloadError> {
        let ResumeDownload { client, url, destination, cancel, max_bytes_per_request } = self;
        let request_error =
            |error| DownloadError::Request { url: url.to_string(), error };
        let write_error =
            |error| DownloadError::WriteFile { path: destination.to_path_buf(), error };

        let head = client.head(url).send().await.map_err(request_error)?;
        if head.status() != StatusCode::OK {
            return Err(DownloadError::UnexpectedStatus { url: url.to_string(), status: head.status() });
        }
        let total: u64 = header_string(&head, header::CONTENT_LENGTH.as_str())
            .parse()
            .map_err(|_| DownloadError::MissingHeader {
                url: url.to_string(),
                header: "content-length",
            })?;
        if total > MAX_PACKAGE_SIZE {
            return Err(DownloadError::TooLarge { url: url.to_string(), limit: MAX_PACKAGE_SIZE });
        }
        let content_type = header_string(&head, header::CONTENT_TYPE.as_str());
        let claimed_checksum = expected_checksum(&head);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(destination)
            .await
            .map_err(write_error)?;
        let mut received =
            file.metadata().await.map_err(write_error)?.len();
        let started = Instant::now();
        let mut last_report = Instant::now();

        while received < total {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let end = match max_bytes_per_request {
                Some(max) => (received + max - 1).min(total - 1),
                None => total - 1,
            };
            let response = client
                .get(url)
                .header(header::RANGE, format!("bytes={received}-{end}"))
                .send()
                .await
                .map_err(request_error)?;
            if !matches!(response.status(), StatusCode::OK | StatusCode::PARTIAL_CONTENT) {
                return Err(DownloadError::UnexpectedStatus {
                    url: url.to_string(),
                    status: response.status(),
                });
            }
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                if cancel.is_cancelled() {
                    return Err(DownloadError::Cancelled);
                }
                let chunk = chunk.map_err(request_error)?;
                received += chunk.len() as u64;
                if received > total {
                    return Err(DownloadError::UnexpectedStatus {
                        url: url.to_string(),
                        status: StatusCode::PARTIAL_CONTENT,
                    });
                }
                file.write_all(&chunk).await.map_err(write_error)?;

                if last_report.elapsed() >= PROGRESS_INTERVAL {
                    last_report = Instant::now();
                    tracing::info!(
                        target: "packsync::download",
                        url,
                        percent = received * 100 / total.max(1),
                        elapsed_secs = started.elapsed().as_secs(),
                        "Download in progress",
                    );
                }
            }
        }
        file.sync_all().await.map_err(write_error)?;
        drop(file);

        let computed = file_crc32c(destination).map_err(write_error)?;
        if let Some(expected) = claimed_checksum {
            verify_or_remove(&expected, &computed, destination).await?;
        }
        Ok(Downloaded { checksum: computed, content_type })
    }
}

/// CRC32C of an entire file already on disk.
fn file_crc32c(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Crc32cHasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.to_base64())
}
