mod client;
mod error;
mod network;
mod server;

pub use client::ClientSession;
pub use error::{AppError, AppResult};
pub use network::{
    decode_header, encode_frame, Connection, HEADER_MARK, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
pub use server::{
    ClientConfig, ConnectionId, ConnectionRegistry, MessageHandler, Server, ServerConfig,
    ServerEvent, ServerHandle,
};
