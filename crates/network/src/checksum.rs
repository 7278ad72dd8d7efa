use base64::{engine::general_purpose::STANDARD as BASE64, DecodeError, Engine};

/// Incremental CRC32C (Castagnoli) over transferred chunks.
#[derive(Debug, Default)]
pub struct Crc32cHasher {
    state: u32,
}

impl Crc32cHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, chunk);
    }

    /// The big-endian digest in the base64 form the object store uses.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.state.to_be_bytes())
    }
}

/// Pull the base64 CRC32C out of an `x-goog-hash` header value.
///
/// The header carries comma-separated `<algo>=<base64>` pairs and may list
/// `md5` next to `crc32c`; base64 padding within a value also contains `=`,
/// so values are split on the first `=` only.
pub fn crc32c_from_hash_header(header: &str) -> Option<&str> {
    header.split(',').find_map(|pair| {
        let (algorithm, value) = pair.trim().split_once('=')?;
        (algorithm == "crc32c").then_some(value)
    })
}

/// Compare two base64 CRC32C digests, tolerating the server-side encoding
/// idiosyncrasy of dropped leading zero bytes.
pub fn checksums_match(expected: &str, computed: &str) -> Result<bool, DecodeError> {
    let expected = BASE64.decode(expected)?;
    let computed = BASE64.decode(computed)?;
    fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
        let start = bytes.iter().position(|byte| *byte != 0).unwrap_or(bytes.len());
        &bytes[start..]
    }
    Ok(trim_leading_zeros(&expected) == trim_leading_zeros(&computed))
}
