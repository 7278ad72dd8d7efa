mod module;
mod package;
mod reference;

pub use module::*;
pub use package::*;
pub use reference::*;
