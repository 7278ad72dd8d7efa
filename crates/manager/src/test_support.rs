//! Shared fixtures for backend and pipeline tests.

use crate::FetchError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::{write::GzEncoder, Compression};
use packsync_network::{CopyLocalArchive, Downloaded};
use std::{
    fs,
    future::Ready,
    path::{Path, PathBuf},
};

/// Opt into tracing output while debugging a test: `TRACE=debug cargo test`.
pub(crate) fn enable_test_tracing() {
    packsync_diagnostics::enable_tracing_by_env();
}

/// Write a gzipped tar with the given `(path, content)` regular files.
pub(crate) fn gzipped_tarball(archive: &Path, files: &[(&str, &[u8])]) {
    fs::write(archive, gzipped_tarball_bytes(files)).unwrap();
}

/// In-memory gzipped tar with the given `(path, content)` regular files.
pub(crate) fn gzipped_tarball_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        builder.append_data(&mut header, path, *content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Base64 CRC32C in the form the object store advertises.
pub(crate) fn crc32c_base64(payload: &[u8]) -> String {
    BASE64.encode(crc32c::crc32c(payload).to_be_bytes())
}

pub(crate) fn test_credentials() -> packsync_network::CloudCredentials {
    packsync_network::CloudCredentials {
        part_id: "part-1".to_string(),
        secret: "part-secret".to_string(),
        api_key: None,
    }
}

/// Mount `body` on `server` at `path` with the headers the object store
/// sends, expecting exactly `hits` downloads.
pub(crate) async fn serve_archive(
    server: &mut mockito::Server,
    path: &str,
    body: &[u8],
    hits: usize,
) -> mockito::Mock {
    server
        .mock("GET", path)
        .with_header("content-type", "application/x-gzip")
        .with_header("x-goog-hash", &format!("crc32c={}", crc32c_base64(body)))
        .with_body(body)
        .expect(hits)
        .create_async()
        .await
}

/// Transport callback that panics when invoked, for asserting that a code
/// path performs no transfer at all.
pub(crate) fn refusing_fetch(
    message: &'static str,
) -> impl FnOnce(PathBuf) -> Ready<Result<Downloaded, FetchError>> {
    move |_destination| panic!("{message}")
}

/// Transport callback that copies a local tarball, as the local backend does.
pub(crate) fn local_fetch(
    source: &Path,
) -> impl FnOnce(PathBuf) -> Ready<Result<Downloaded, FetchError>> + '_ {
    move |destination| {
        std::future::ready(
            CopyLocalArchive { source, destination: &destination }
                .run()
                .map_err(FetchError::LocalCopy),
        )
    }
}
