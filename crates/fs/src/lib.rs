mod file_mode;
mod safe_path;
mod symlink;
mod write_file;

pub use file_mode::*;
pub use safe_path::*;
pub use symlink::*;
pub use write_file::*;
