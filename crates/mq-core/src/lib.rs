pub mod config;
pub mod events;
pub mod labels;
pub mod meta;
pub mod protocol;
pub mod state;
pub mod types;
pub mod validation;

pub use config::*;
pub use events::*;
pub use labels::*;
pub use meta::*;
pub use protocol::*;
pub use state::*;
pub use types::*;
pub use validation::*;
