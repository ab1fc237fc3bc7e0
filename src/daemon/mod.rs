pub mod protocol;
pub mod registry;
pub mod server;

pub use protocol::{Request, Response};
pub use registry::Registry;
pub use server::Daemon;
