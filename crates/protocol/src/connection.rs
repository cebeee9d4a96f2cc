//! Connections and the listener interface the I/O layer drives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::{debug, error, trace};

use crate::{codec, codes, ErrorReply, Message, ProtocolError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which close handling a connection's owner has armed.
///
/// The owner swaps the watch as the connection moves between the idle pool
/// and an in-flight operation, instead of re-registering callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseWatch {
    /// No close handling; a close stays silent.
    Detached,
    /// The connection sits in the idle pool.
    Idle,
    /// The connection carries an in-flight operation.
    InFlight,
}

/// Callbacks delivered by a connection's reader task.
///
/// For a single connection all calls are serialized, and `on_close` is always
/// the final one. Implementations must not block the reader.
pub trait ResponseListener: Send + Sync {
    /// A well-formed message arrived.
    fn on_message(&self, conn: &Arc<Connection>, msg: Message);

    /// The server answered with its error reply (code 0).
    fn on_error_reply(&self, conn: &Arc<Connection>, reply: ErrorReply);

    /// The transport failed mid-stream. A close follows.
    fn on_exception(&self, conn: &Arc<Connection>, error: ProtocolError);

    /// The connection closed. `watch` is the mode armed at close time;
    /// `cause` is the transport's reason when it gave one.
    fn on_close(&self, conn: &Arc<Connection>, watch: CloseWatch, cause: Option<ProtocolError>);
}

struct WatchState {
    watch: CloseWatch,
    closed: bool,
}

/// One live transport to a remote endpoint.
///
/// Writes are serialized through an async mutex; a dedicated reader task
/// parses frames and drives the [`ResponseListener`].
pub struct Connection {
    id: u64,
    peer: String,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    open: AtomicBool,
    watch: Mutex<WatchState>,
    closed_notify: Notify,
}

impl Connection {
    /// Wrap a connected transport and start its reader task.
    pub fn spawn<S>(
        io: S,
        peer: impl Into<String>,
        listener: Arc<dyn ResponseListener>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            open: AtomicBool::new(true),
            watch: Mutex::new(WatchState {
                watch: CloseWatch::Detached,
                closed: false,
            }),
            closed_notify: Notify::new(),
        });
        tokio::spawn(read_loop(Arc::clone(&conn), Box::new(reader), listener));
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Write one framed message. Fails once the connection has closed.
    pub async fn write_message(&self, msg: &Message) -> Result<(), ProtocolError> {
        if !self.is_open() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        codec::write_frame(&mut **writer, msg).await
    }

    /// Arm close handling. Returns `false` when the connection already
    /// closed: no event will fire, so the caller must run its own close
    /// handling.
    pub fn set_close_watch(&self, watch: CloseWatch) -> bool {
        let mut state = self.watch.lock();
        if state.closed {
            return false;
        }
        state.watch = watch;
        true
    }

    /// Close the connection and stop its reader. Whether anyone hears about
    /// it depends on the armed watch.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            trace!(conn = self.id, peer = %self.peer, "closing connection");
        }
        self.closed_notify.notify_one();
    }
}

/// Rebuild an error so it can reach both `on_exception` and the close cause;
/// `io::Error` is not `Clone`.
fn duplicate_error(error: &ProtocolError) -> ProtocolError {
    match error {
        ProtocolError::ConnectionFailed(msg) => ProtocolError::ConnectionFailed(msg.clone()),
        ProtocolError::ConnectTimeout(limit) => ProtocolError::ConnectTimeout(*limit),
        ProtocolError::MessageTooLarge { size, max } => ProtocolError::MessageTooLarge {
            size: *size,
            max: *max,
        },
        ProtocolError::InvalidMessage(msg) => ProtocolError::InvalidMessage(msg.clone()),
        ProtocolError::ConnectionClosed => ProtocolError::ConnectionClosed,
        ProtocolError::Io(e) => ProtocolError::Io(std::io::Error::new(e.kind(), e.to_string())),
    }
}

async fn read_loop(
    conn: Arc<Connection>,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    listener: Arc<dyn ResponseListener>,
) {
    let mut close_cause = None;
    loop {
        tokio::select! {
            _ = conn.closed_notify.notified() => break,
            res = codec::read_frame(&mut reader) => match res {
                Ok(Some(msg)) if msg.code == codes::ERROR_REPLY => {
                    match ErrorReply::decode(&msg.body) {
                        Ok(reply) => listener.on_error_reply(&conn, reply),
                        Err(err) => {
                            error!(conn = conn.id, peer = %conn.peer, error = %err,
                                   "undecodable error reply");
                            conn.open.store(false, Ordering::Release);
                            close_cause = Some(duplicate_error(&err));
                            listener.on_exception(&conn, err);
                            break;
                        }
                    }
                }
                Ok(Some(msg)) => {
                    trace!(conn = conn.id, code = msg.code, len = msg.body.len(),
                           "message received");
                    listener.on_message(&conn, msg);
                }
                Ok(None) => {
                    debug!(conn = conn.id, peer = %conn.peer, "peer closed connection");
                    break;
                }
                Err(err) => {
                    error!(conn = conn.id, peer = %conn.peer, error = %err, "transport error");
                    conn.open.store(false, Ordering::Release);
                    close_cause = Some(duplicate_error(&err));
                    listener.on_exception(&conn, err);
                    break;
                }
            }
        }
    }

    conn.open.store(false, Ordering::Release);
    let watch = {
        let mut state = conn.watch.lock();
        state.closed = true;
        state.watch
    };
    listener.on_close(&conn, watch, close_cause);
}
