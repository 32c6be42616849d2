pub use config::{ClientConfig, ServerConfig};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use server::{MessageHandler, Server, ServerEvent, ServerHandle};

mod config;
mod registry;
mod server;
