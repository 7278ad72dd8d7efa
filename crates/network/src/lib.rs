mod checksum;
mod client;
mod download;
mod local;
mod resume;

pub use checksum::*;
pub use client::*;
pub use download::*;
pub use local::*;
pub use resume::*;

/// The only content type the install pipeline accepts for package archives.
pub const GZIP_CONTENT_TYPE: &str = "application/x-gzip";

/// What a completed transfer reports back to the install pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    /// Base64 CRC32C (Castagnoli) of the transferred bytes.
    pub checksum: String,
    /// `Content-Type` the source reported.
    pub content_type: String,
}
