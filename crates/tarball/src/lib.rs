mod unpack;

pub use unpack::*;
