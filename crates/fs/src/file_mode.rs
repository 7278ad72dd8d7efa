/// Owner read-write bits (`rw-------`), the floor for every unpacked file.
pub const OWNER_RW: u32 = 0o600;

/// Restrict a tar header mode to its permission bits and guarantee the owner
/// can read and write the result.
pub fn unpacked_file_mode(header_mode: u32) -> u32 {
    OWNER_RW | (header_mode & 0o777)
}
