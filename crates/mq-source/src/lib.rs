pub mod error;
pub mod gerrit;
pub mod memory;
pub mod source;

pub use error::*;
pub use gerrit::*;
pub use memory::*;
pub use source::*;
