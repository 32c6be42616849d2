//! Network Module Implementation
//!
//! This module provides the wire-level functionality for the message
//! transport: the length-prefixed frame codec and the per-connection receive
//! state machine.
//!
//! # Architecture
//!
//! - `frame`: pure encode/decode of the `[0xEE, 0xEE, len_hi, len_lo]`
//!   envelope, no I/O
//! - `Connection`: drives header and body reads over any async reader,
//!   carrying partial-read progress across poll cycles
//!
//! A frame is dispatched only once its payload has been read to exactly the
//! announced length; protocol violations are fatal to the connection.

pub use connection::Connection;
pub use frame::{decode_header, encode_frame, HEADER_MARK, HEADER_SIZE, MAX_PAYLOAD_SIZE};
mod connection;
mod frame;
