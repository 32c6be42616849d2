use bytes::{BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// Both header mark bytes carry this sentinel value.
pub const HEADER_MARK: u8 = 0xEE;
/// Wire header: two mark bytes followed by a big-endian u16 payload length.
pub const HEADER_SIZE: usize = 4;
/// Largest payload the two-byte length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Encodes one payload into a complete wire frame.
///
/// Fails before any I/O if the payload cannot be represented by the two-byte
/// length field.
pub fn encode_frame(payload: &[u8]) -> AppResult<Bytes> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(AppError::PayloadTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(HEADER_MARK);
    buf.put_u8(HEADER_MARK);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decodes a frame header, returning the payload length it announces.
///
/// The length is authoritative and sizes the body read that follows; no
/// validation happens here beyond the mark bytes.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> AppResult<usize> {
    if header[0] != HEADER_MARK || header[1] != HEADER_MARK {
        return Err(AppError::BadMark);
    }
    Ok(u16::from_be_bytes([header[2], header[3]]) as usize)
}
