use std::io::{self, ErrorKind};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::network::frame::{decode_header, HEADER_SIZE};
use crate::{AppError, AppResult};

/// Where a connection stands inside the wire framing.
///
/// `AwaitingHeader` is the initial phase and is re-entered after every
/// completed message. `AwaitingBody` carries the partially filled payload
/// buffer across poll cycles.
#[derive(Debug)]
enum ReceivePhase {
    AwaitingHeader {
        header: [u8; HEADER_SIZE],
        filled: usize,
    },
    AwaitingBody {
        buf: BytesMut,
        expected: usize,
    },
}

impl ReceivePhase {
    fn header() -> Self {
        ReceivePhase::AwaitingHeader {
            header: [0; HEADER_SIZE],
            filled: 0,
        }
    }
}

fn check_body_count(received: usize, expected: usize) -> AppResult<()> {
    if received > expected {
        return Err(AppError::BadDataByteCount {
            got: received,
            expected,
        });
    }
    Ok(())
}

/// Represents the receive direction of one peer connection.
///
/// Drives the framing state machine over any reader: a header read sizes a
/// fresh payload buffer, body reads append at the current offset, and a
/// completed payload hands ownership of the buffer to the caller while the
/// phase returns to `AwaitingHeader`.
#[derive(Debug)]
pub struct Connection<R> {
    reader: R,
    phase: ReceivePhase,
}

impl<R: AsyncRead + Unpin> Connection<R> {
    pub fn new(reader: R) -> Connection<R> {
        Connection {
            reader,
            phase: ReceivePhase::header(),
        }
    }

    /// Reads until one complete message is assembled.
    ///
    /// Returns `Ok(None)` if the peer closed the socket at a frame boundary.
    /// A close mid-header is `BadHeaderByteCount`, a close mid-body is a
    /// connection reset, and a mark mismatch is `BadMark`; all of them are
    /// fatal to the connection and the caller is expected to tear it down.
    pub async fn read_message(&mut self) -> AppResult<Option<Bytes>> {
        loop {
            match &mut self.phase {
                ReceivePhase::AwaitingHeader { header, filled } => {
                    let n = self.reader.read(&mut header[*filled..]).await?;
                    if n == 0 {
                        if *filled == 0 {
                            // peer closed the connection gracefully
                            return Ok(None);
                        }
                        return Err(AppError::BadHeaderByteCount(*filled));
                    }
                    *filled += n;
                    if *filled < HEADER_SIZE {
                        continue;
                    }
                    let expected = decode_header(header)?;
                    if expected == 0 {
                        self.phase = ReceivePhase::header();
                        return Ok(Some(Bytes::new()));
                    }
                    self.phase = ReceivePhase::AwaitingBody {
                        buf: BytesMut::with_capacity(expected),
                        expected,
                    };
                }
                ReceivePhase::AwaitingBody { buf, expected } => {
                    let remaining = *expected - buf.len();
                    let n = (&mut self.reader)
                        .take(remaining as u64)
                        .read_buf(buf)
                        .await?;
                    if n == 0 {
                        return Err(io::Error::new(
                            ErrorKind::ConnectionReset,
                            "connection reset by peer mid frame",
                        )
                        .into());
                    }
                    check_body_count(buf.len(), *expected)?;
                    if buf.len() < *expected {
                        // wait for the remainder on the next readiness signal
                        continue;
                    }
                    let payload = std::mem::take(buf).freeze();
                    self.phase = ReceivePhase::header();
                    return Ok(Some(payload));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use crate::network::frame::encode_frame;

    use super::*;

    #[tokio::test]
    async fn reads_back_to_back_messages() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut conn = Connection::new(rx);

        let mut wire = encode_frame(b"first").unwrap().to_vec();
        wire.extend_from_slice(&encode_frame(b"second").unwrap());
        tx.write_all(&wire).await.unwrap();

        assert_eq!(conn.read_message().await.unwrap().unwrap(), &b"first"[..]);
        assert_eq!(conn.read_message().await.unwrap().unwrap(), &b"second"[..]);
    }

    #[tokio::test]
    async fn accumulates_body_across_partial_reads() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut conn = Connection::new(rx);

        let frame = encode_frame(b"split-into-pieces").unwrap();
        let reader = tokio::spawn(async move { conn.read_message().await });

        // header, then the body as 1 + 1 + remainder
        tx.write_all(&frame[..4]).await.unwrap();
        tx.flush().await.unwrap();
        tokio::task::yield_now().await;
        tx.write_all(&frame[4..5]).await.unwrap();
        tx.flush().await.unwrap();
        tokio::task::yield_now().await;
        tx.write_all(&frame[5..6]).await.unwrap();
        tx.flush().await.unwrap();
        tokio::task::yield_now().await;
        tx.write_all(&frame[6..]).await.unwrap();
        tx.flush().await.unwrap();

        let payload = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(payload, &b"split-into-pieces"[..]);
    }

    #[tokio::test]
    async fn empty_payload_completes_without_body_read() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut conn = Connection::new(rx);

        tx.write_all(&encode_frame(b"").unwrap()).await.unwrap();
        let payload = conn.read_message().await.unwrap().unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn bad_mark_is_fatal() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut conn = Connection::new(rx);

        tx.write_all(&[0xAB, 0xEE, 0x00, 0x01, 0x42]).await.unwrap();
        assert!(matches!(
            conn.read_message().await,
            Err(AppError::BadMark)
        ));
    }

    #[tokio::test]
    async fn clean_close_between_frames_is_none() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut conn = Connection::new(rx);

        tx.write_all(&encode_frame(b"bye").unwrap()).await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);

        assert_eq!(conn.read_message().await.unwrap().unwrap(), &b"bye"[..]);
        assert!(conn.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_mid_header_is_bad_byte_count() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut conn = Connection::new(rx);

        tx.write_all(&[0xEE, 0xEE]).await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);

        assert!(matches!(
            conn.read_message().await,
            Err(AppError::BadHeaderByteCount(2))
        ));
    }

    #[tokio::test]
    async fn close_mid_body_is_io_error() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut conn = Connection::new(rx);

        let frame = encode_frame(b"truncated").unwrap();
        tx.write_all(&frame[..6]).await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);

        assert!(matches!(conn.read_message().await, Err(AppError::Io(_))));
    }

    #[test]
    fn body_overrun_is_invariant_breach() {
        assert!(check_body_count(3, 5).is_ok());
        assert!(check_body_count(5, 5).is_ok());
        assert!(matches!(
            check_body_count(6, 5),
            Err(AppError::BadDataByteCount { got: 6, expected: 5 })
        ));
    }
}
