use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::network::Connection;
use crate::server::registry::ConnectionRegistry;
use crate::server::{ConnectionId, ServerConfig};
use crate::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const LISTEN_BACKLOG: u32 = 50;
/// Poll interval of the listen loop; bounds how long cancellation and idle
/// accounting can go unchecked.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle events delivered to the application callback.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// One fully assembled message arrived on a connection.
    MessageReceived {
        conn: ConnectionId,
        payload: Bytes,
    },
    ConnectionAdded {
        conn: ConnectionId,
        peer_addr: SocketAddr,
    },
    ConnectionDropped {
        conn: ConnectionId,
    },
    /// No accept or receive activity for the configured interval.
    IdleNotify,
}

/// Application callback for message and lifecycle events.
///
/// Invoked synchronously from the task that owns the connection (or the
/// listen loop for idle notification), so it must not block significantly.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_event(&self, event: ServerEvent);
}

impl<F> MessageHandler for F
where
    F: Fn(ServerEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: ServerEvent) {
        self(event)
    }
}

/// Listen lifecycle. Terminal once shutting down; a server is never
/// restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenState {
    Idle,
    Listening,
    ShuttingDown,
}

/// A multiplexed message server: one listen loop, one lightweight read task
/// per accepted connection, all sharing a cancellation token.
pub struct Server {
    /// Taken by the listen loop when it claims the lifecycle; dropped at
    /// teardown so termination actually closes the socket.
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn MessageHandler>,
    listen_state: Arc<Mutex<ListenState>>,
    cancel: CancellationToken,
    /// Bumped on every accept and every received message; the listen loop
    /// samples it to detect idle intervals.
    activity: Arc<AtomicU64>,
}

impl Server {
    /// Binds and listens on the configured address.
    ///
    /// Setup failures surface the OS error verbatim and leave no listener
    /// behind. Must be called from within a tokio runtime.
    pub fn bind(config: ServerConfig, handler: Arc<dyn MessageHandler>) -> AppResult<Server> {
        let addr: SocketAddr = format!("{}:{}", config.ip, config.port)
            .parse()
            .map_err(|e| {
                AppError::IllegalState(format!(
                    "invalid listen address {}:{} - {}",
                    config.ip, config.port, e
                ))
            })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let local_addr = listener.local_addr()?;
        info!("server bound to {} for listening", local_addr);
        Ok(Server {
            listener: Mutex::new(Some(listener)),
            local_addr,
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            handler,
            listen_state: Arc::new(Mutex::new(ListenState::Idle)),
            cancel: CancellationToken::new(),
            activity: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A cloneable handle for send, close and shutdown requests from other
    /// tasks and threads.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            registry: self.registry.clone(),
            listen_state: self.listen_state.clone(),
            cancel: self.cancel.clone(),
            local_addr: self.local_addr,
        }
    }

    /// Runs the listen loop until cancelled, a keypress arrives (when
    /// configured), or accepting fails hard.
    ///
    /// Only one caller may ever run a given server; a second call fails with
    /// an illegal-state error. On exit the lifecycle is terminal: every
    /// remaining connection is torn down and the listener is dropped with the
    /// server.
    pub async fn run(&self) -> AppResult<()> {
        {
            let mut state = self.listen_state.lock();
            match *state {
                ListenState::Idle => *state = ListenState::Listening,
                ListenState::Listening => {
                    return Err(AppError::IllegalState(
                        "server already listening for messages".to_string(),
                    ))
                }
                ListenState::ShuttingDown => {
                    return Err(AppError::IllegalState(
                        "server shutting down".to_string(),
                    ))
                }
            }
        }
        let listener = self.listener.lock().take().ok_or_else(|| {
            AppError::IllegalState("listener already consumed".to_string())
        })?;
        info!("accepting inbound connections on {}", self.local_addr);

        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        if self.config.terminate_on_keypress {
            spawn_keypress_watcher(self.cancel.clone());
        }

        let mut poll_tick = time::interval_at(time::Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // two samples per second of configured idle time
        let idle_limit = self.config.idle_notify_secs * 2;
        let mut idle_streak = 0u64;
        let mut last_seen = self.activity.load(Ordering::Acquire);
        // lives outside the select so a cancelled accept attempt does not
        // reset the escalation
        let mut backoff = 1u64;

        let result = loop {
            tokio::select! {
                res = Self::accept(&listener, &mut backoff) => {
                    match res {
                        Ok((socket, peer_addr)) => {
                            self.add_connection(socket, peer_addr, shutdown_complete_tx.clone());
                        }
                        Err(e) => {
                            error!(cause = %e, "failed to accept");
                            break Err(e);
                        }
                    }
                }
                _ = poll_tick.tick() => {
                    if idle_limit != 0 {
                        let seen = self.activity.load(Ordering::Acquire);
                        if seen == last_seen {
                            idle_streak += 1;
                            if idle_streak >= idle_limit {
                                self.handler.on_event(ServerEvent::IdleNotify);
                                idle_streak = 0;
                            }
                        } else {
                            last_seen = seen;
                            idle_streak = 0;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("server received termination signal");
                    break Ok(());
                }
            }
        };

        *self.listen_state.lock() = ListenState::ShuttingDown;
        drop(listener);
        self.cancel.cancel();
        self.registry.close_all();
        drop(shutdown_complete_tx);
        let _ = shutdown_complete_rx.recv().await;
        info!("server shutdown complete");
        result
    }

    async fn accept(
        listener: &TcpListener,
        backoff: &mut u64,
    ) -> AppResult<(TcpStream, SocketAddr)> {
        loop {
            match listener.accept().await {
                Ok(accepted) => {
                    *backoff = 1;
                    return Ok(accepted);
                }
                Err(err) => match accept_backoff_delay(backoff) {
                    Some(delay) => {
                        debug!("accept failed, retrying in {:?}: {}", delay, err);
                        time::sleep(delay).await;
                    }
                    None => return Err(err.into()),
                },
            }
        }
    }

    fn add_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        let id = ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        let (reader, writer) = socket.into_split();
        let close_token = self.cancel.child_token();
        self.registry.add(id, peer_addr, writer, close_token.clone());
        self.activity.fetch_add(1, Ordering::Release);
        info!("accepted {} from {}", id, peer_addr);
        self.handler.on_event(ServerEvent::ConnectionAdded {
            conn: id,
            peer_addr,
        });

        let registry = self.registry.clone();
        let handler = self.handler.clone();
        let activity = self.activity.clone();
        tokio::spawn(async move {
            let mut connection = Connection::new(reader);
            loop {
                // biased so a pending close request wins over further reads
                tokio::select! {
                    biased;
                    _ = close_token.cancelled() => {
                        debug!("{} exiting read loop after close request", id);
                        break;
                    }
                    res = connection.read_message() => match res {
                        Ok(Some(payload)) => {
                            activity.fetch_add(1, Ordering::Release);
                            handler.on_event(ServerEvent::MessageReceived { conn: id, payload });
                        }
                        Ok(None) => {
                            debug!("{} closed by peer", id);
                            break;
                        }
                        Err(e) => {
                            if e.is_protocol_error() {
                                error!("protocol violation on {}: {}", id, e);
                            } else {
                                error!("receive error on {}: {}", id, e);
                            }
                            break;
                        }
                    }
                }
            }
            registry.remove_and_close(id).await;
            handler.on_event(ServerEvent::ConnectionDropped { conn: id });
            drop(shutdown_complete_tx);
        });
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("message server dropped");
    }
}

/// Shared control surface over a running server.
#[derive(Clone)]
pub struct ServerHandle {
    registry: Arc<ConnectionRegistry>,
    listen_state: Arc<Mutex<ListenState>>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Sends one message to a registered connection.
    ///
    /// `nonblocking` fails fast with `WouldBlock` when another send is in
    /// flight on the same connection instead of waiting for the writer.
    pub async fn send_to(
        &self,
        conn: ConnectionId,
        payload: &[u8],
        nonblocking: bool,
    ) -> AppResult<()> {
        self.ensure_listening()?;
        self.registry.send_to(conn, payload, nonblocking).await
    }

    /// Requests teardown of one connection; honored on its read task's next
    /// dispatch evaluation, never mid-read.
    pub fn request_close(&self, conn: ConnectionId) -> AppResult<()> {
        self.ensure_listening()?;
        self.registry.request_close(conn)
    }

    /// Cooperatively terminates the listen loop and every connection task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_connected(&self, conn: ConnectionId) -> bool {
        self.registry.contains(conn)
    }

    fn ensure_listening(&self) -> AppResult<()> {
        match *self.listen_state.lock() {
            ListenState::Listening => Ok(()),
            ListenState::Idle => Err(AppError::IllegalState(
                "server not started".to_string(),
            )),
            ListenState::ShuttingDown => Err(AppError::IllegalState(
                "server shutting down".to_string(),
            )),
        }
    }
}

/// One more retry delay after a failed accept, or `None` once the escalation
/// passes 64 seconds and the loop should give up.
fn accept_backoff_delay(backoff: &mut u64) -> Option<Duration> {
    if *backoff > 64 {
        return None;
    }
    let delay = Duration::from_secs(*backoff);
    *backoff *= 2;
    Some(delay)
}

fn spawn_keypress_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 16];
        tokio::select! {
            _ = cancel.cancelled() => {}
            res = stdin.read(&mut buf) => {
                if res.is_ok() {
                    info!("keypress detected, terminating server");
                    cancel.cancel();
                }
            }
        }
    });
}
