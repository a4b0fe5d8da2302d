pub mod client;
pub mod daemon_loop;
pub mod pidfile;
pub mod ticker;

pub use client::*;
pub use daemon_loop::*;
pub use pidfile::*;
pub use ticker::*;
