use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::network::{decode_header, encode_frame, HEADER_SIZE};
use crate::server::ClientConfig;
use crate::{AppError, AppResult};

/// Bounds how long a blocking read can mask a cancellation request.
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct ReceiveSlot {
    /// Most recently completed message, held until the caller takes it.
    last_msg: Option<Bytes>,
    count: u64,
}

/// A blocking single-connection client session.
///
/// Send and receive run under independent locks, so one sender thread and
/// one receiver thread can operate concurrently without serializing against
/// each other; two concurrent sends (or two concurrent receives) serialize.
/// Cancellation is cooperative: [`cancel`](ClientSession::cancel) sets a flag
/// that receive observes between bounded-block read retries, never
/// interrupting an in-flight read.
#[derive(Debug)]
pub struct ClientSession {
    stream: TcpStream,
    terminated: AtomicBool,
    send_lock: Mutex<()>,
    receive_slot: Mutex<ReceiveSlot>,
}

impl ClientSession {
    /// Connects and applies the socket timeouts.
    ///
    /// The optional send timeout covers the whole connection; the receive
    /// timeout is fixed and short so cancellation stays responsive. Any OS
    /// failure aborts with its platform error code intact, leaving no
    /// session behind.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        send_timeout: Option<Duration>,
    ) -> AppResult<ClientSession> {
        let stream = TcpStream::connect(addr)?;
        if send_timeout.is_some() {
            stream.set_write_timeout(send_timeout)?;
        }
        stream.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        Ok(ClientSession {
            stream,
            terminated: AtomicBool::new(false),
            send_lock: Mutex::new(()),
            receive_slot: Mutex::new(ReceiveSlot::default()),
        })
    }

    pub fn from_config(config: &ClientConfig) -> AppResult<ClientSession> {
        ClientSession::connect(
            (config.ip.as_str(), config.port),
            config.send_timeout_ms.map(Duration::from_millis),
        )
    }

    /// Encodes and sends one message with a single write.
    ///
    /// A write that moves fewer bytes than the encoded frame is an error with
    /// no retry; recovery is the caller's call. With `nonblocking` set, a
    /// send already in flight on another thread fails fast with `WouldBlock`.
    pub fn send(&self, payload: &[u8], nonblocking: bool) -> AppResult<()> {
        let _guard = if nonblocking {
            self.send_lock.try_lock().ok_or(AppError::WouldBlock)?
        } else {
            self.send_lock.lock()
        };
        let frame = encode_frame(payload)?;
        let sent = (&self.stream).write(&frame)?;
        if sent != frame.len() {
            return Err(AppError::ShortWrite {
                sent,
                expected: frame.len(),
            });
        }
        Ok(())
    }

    /// Blocks until one complete message is assembled, storing it in the
    /// session and returning its size.
    ///
    /// Returns `Terminated` once the cancellation flag is observed, and
    /// `SocketClosed` if the peer closed at a frame boundary.
    pub fn receive(&self) -> AppResult<usize> {
        let mut slot = self.receive_slot.lock();

        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = self.read_bounded(&mut header[filled..])?;
            if n == 0 {
                if filled == 0 {
                    debug!("receive: socket closed by sender");
                    return Err(AppError::SocketClosed);
                }
                return Err(AppError::BadHeaderByteCount(filled));
            }
            filled += n;
        }
        let expected = decode_header(&header)?;

        let mut buf = vec![0u8; expected];
        let mut received = 0;
        while received < expected {
            let n = self.read_bounded(&mut buf[received..])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    ErrorKind::ConnectionReset,
                    "connection reset by peer mid frame",
                )
                .into());
            }
            received += n;
        }

        slot.last_msg = Some(Bytes::from(buf));
        slot.count += 1;
        Ok(expected)
    }

    /// The last received message, surrendered to the caller.
    pub fn take_message(&self) -> Option<Bytes> {
        self.receive_slot.lock().last_msg.take()
    }

    pub fn received_count(&self) -> u64 {
        self.receive_slot.lock().count
    }

    /// Requests cooperative termination of blocked receives.
    pub fn cancel(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Cancels the session and gracefully shuts the socket down. Safe to call
    /// more than once; no further operations are expected afterwards.
    pub fn shutdown(&self) {
        self.cancel();
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                debug!("error shutting down client socket: {}", e);
            }
        }
    }

    /// One bounded-block read, re-checking the cancellation flag before every
    /// retry so a timed-out read never masks a termination request.
    fn read_bounded(&self, buf: &mut [u8]) -> AppResult<usize> {
        loop {
            if self.terminated.load(Ordering::Acquire) {
                return Err(AppError::Terminated);
            }
            match (&self.stream).read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
