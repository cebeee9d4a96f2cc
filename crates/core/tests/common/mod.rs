//! Shared fixtures: a frame-speaking server end (TCP or in-memory), a mock
//! connector, and recording operations/listeners.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use cellar_core::{Node, NodeError, NodeOperation, NodeStateListener, State};
use cellar_protocol::{
    codec, codes, Connection, Connector, ErrorReply, Message, ProtocolError, ResponseListener,
};

/// Poll `cond` until it holds, yielding to the runtime in between.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

// ----------------------------------------------------------------------
// Operations
// ----------------------------------------------------------------------

/// An operation that records everything the node feeds it.
pub struct TestOperation {
    request: Message,
    expected_responses: usize,
    responses: Mutex<Vec<Message>>,
    error: Mutex<Option<NodeError>>,
    last_node: Mutex<Option<(String, u16)>>,
    done: AtomicBool,
    terminal: Notify,
}

impl TestOperation {
    pub fn new(request: Message, expected_responses: usize) -> Arc<Self> {
        Arc::new(Self {
            request,
            expected_responses,
            responses: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            last_node: Mutex::new(None),
            done: AtomicBool::new(false),
            terminal: Notify::new(),
        })
    }

    pub fn get(key: &str) -> Arc<Self> {
        Self::new(Message::new(codes::GET, key.as_bytes().to_vec()), 1)
    }

    pub fn ping() -> Arc<Self> {
        Self::new(Message::new(codes::PING, Vec::new()), 1)
    }

    /// A streaming operation that stays in flight until `expected_responses`
    /// messages arrive.
    pub fn streaming(key: &str, expected_responses: usize) -> Arc<Self> {
        Self::new(
            Message::new(codes::GET, key.as_bytes().to_vec()),
            expected_responses,
        )
    }

    pub fn responses(&self) -> Vec<Message> {
        self.responses.lock().clone()
    }

    pub fn take_error(&self) -> Option<NodeError> {
        self.error.lock().take()
    }

    pub fn last_node(&self) -> Option<(String, u16)> {
        self.last_node.lock().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.error.lock().is_some()
    }

    pub async fn wait_terminal(&self) {
        loop {
            if self.is_terminal() {
                return;
            }
            let notified = self.terminal.notified();
            if self.is_terminal() {
                return;
            }
            notified.await;
        }
    }
}

impl NodeOperation for TestOperation {
    fn request(&self) -> Message {
        self.request.clone()
    }

    fn set_response(&self, msg: Message) {
        let mut responses = self.responses.lock();
        responses.push(msg);
        if responses.len() >= self.expected_responses {
            self.done.store(true, Ordering::Release);
        }
        self.terminal.notify_waiters();
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn set_error(&self, error: NodeError) {
        *self.error.lock() = Some(error);
        self.terminal.notify_waiters();
    }

    fn set_last_node(&self, node: &Node) {
        *self.last_node.lock() = Some((node.remote_address().to_string(), node.port()));
    }
}

// ----------------------------------------------------------------------
// State listener
// ----------------------------------------------------------------------

pub struct RecordingListener {
    states: Mutex<Vec<State>>,
    notify: Notify,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn states(&self) -> Vec<State> {
        self.states.lock().clone()
    }

    pub async fn wait_for_state(&self, state: State) {
        loop {
            if self.states.lock().contains(&state) {
                return;
            }
            let notified = self.notify.notified();
            if self.states.lock().contains(&state) {
                return;
            }
            notified.await;
        }
    }
}

impl NodeStateListener for RecordingListener {
    fn node_state_changed(&self, _node: &Node, state: State) {
        self.states.lock().push(state);
        self.notify.notify_waiters();
    }
}

// ----------------------------------------------------------------------
// Server end
// ----------------------------------------------------------------------

/// The server side of one connection, TCP or in-memory. Reads frames,
/// optionally auto-replies with `code + 1`, and lets tests inject replies or
/// kill the transport.
pub struct ServerEnd {
    requests: Mutex<Vec<Message>>,
    request_notify: Notify,
    reply_tx: mpsc::UnboundedSender<Message>,
    kill: Notify,
}

impl ServerEnd {
    pub fn spawn<S>(io: S, auto_reply: Arc<AtomicBool>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Message>();
        let end = Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            request_notify: Notify::new(),
            reply_tx,
            kill: Notify::new(),
        });

        let this = Arc::clone(&end);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(io);
            loop {
                tokio::select! {
                    _ = this.kill.notified() => break,
                    reply = reply_rx.recv() => match reply {
                        Some(msg) => {
                            if codec::write_frame(&mut writer, &msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    frame = codec::read_frame(&mut reader) => match frame {
                        Ok(Some(msg)) => {
                            let reply = auto_reply
                                .load(Ordering::Relaxed)
                                .then(|| Message::new(msg.code + 1, msg.body.clone()));
                            this.requests.lock().push(msg);
                            this.request_notify.notify_waiters();
                            if let Some(reply) = reply {
                                if codec::write_frame(&mut writer, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) | Err(_) => break,
                    },
                }
            }
            // Dropping the halves closes the transport.
        });
        end
    }

    pub fn send(&self, msg: Message) {
        let _ = self.reply_tx.send(msg);
    }

    pub fn send_error_reply(&self, code: u32, message: &str) {
        self.send(ErrorReply::new(code, message).to_message());
    }

    /// Drop the transport, closing the peer's connection.
    pub fn close(&self) {
        self.kill.notify_one();
    }

    pub fn requests(&self) -> Vec<Message> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub async fn wait_for_requests(&self, count: usize) {
        loop {
            if self.requests.lock().len() >= count {
                return;
            }
            let notified = self.request_notify.notified();
            if self.requests.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

// ----------------------------------------------------------------------
// TCP fixture server
// ----------------------------------------------------------------------

pub struct TestServer {
    pub host: String,
    pub port: u16,
    conns: Arc<Mutex<Vec<Arc<ServerEnd>>>>,
    accept_notify: Arc<Notify>,
    auto_reply: Arc<AtomicBool>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(auto_reply: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fixture server");
        let addr = listener.local_addr().expect("fixture server address");
        let conns: Arc<Mutex<Vec<Arc<ServerEnd>>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_notify = Arc::new(Notify::new());
        let auto_reply = Arc::new(AtomicBool::new(auto_reply));

        let accept_task = {
            let conns = Arc::clone(&conns);
            let accept_notify = Arc::clone(&accept_notify);
            let auto_reply = Arc::clone(&auto_reply);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((socket, _)) => {
                            let end = ServerEnd::spawn(socket, Arc::clone(&auto_reply));
                            conns.lock().push(end);
                            accept_notify.notify_waiters();
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            conns,
            accept_notify,
            auto_reply,
            accept_task,
        }
    }

    pub fn set_auto_reply(&self, auto_reply: bool) {
        self.auto_reply.store(auto_reply, Ordering::Relaxed);
    }

    pub fn conn(&self, index: usize) -> Arc<ServerEnd> {
        Arc::clone(&self.conns.lock()[index])
    }

    pub fn connection_count(&self) -> usize {
        self.conns.lock().len()
    }

    pub async fn wait_for_connections(&self, count: usize) {
        loop {
            if self.conns.lock().len() >= count {
                return;
            }
            let notified = self.accept_notify.notified();
            if self.conns.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ----------------------------------------------------------------------
// In-memory connector
// ----------------------------------------------------------------------

/// A [`Connector`] that hands out in-memory duplex transports, with a
/// server end per connection. Connect failures can be toggled to drive the
/// health monitor.
pub struct MockConnector {
    auto_reply: Arc<AtomicBool>,
    fail: AtomicBool,
    conns: Mutex<Vec<Arc<ServerEnd>>>,
    accept_notify: Notify,
}

impl MockConnector {
    pub fn new(auto_reply: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_reply: Arc::new(AtomicBool::new(auto_reply)),
            fail: AtomicBool::new(false),
            conns: Mutex::new(Vec::new()),
            accept_notify: Notify::new(),
        })
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn conn(&self, index: usize) -> Arc<ServerEnd> {
        Arc::clone(&self.conns.lock()[index])
    }

    pub fn connection_count(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn close_all(&self) {
        for end in self.conns.lock().iter() {
            end.close();
        }
    }

    pub async fn wait_for_connections(&self, count: usize) {
        loop {
            if self.conns.lock().len() >= count {
                return;
            }
            let notified = self.accept_notify.notified();
            if self.conns.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _timeout: Option<Duration>,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<Arc<Connection>, ProtocolError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(ProtocolError::ConnectionFailed(
                "mock connect refused".to_string(),
            ));
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        let end = ServerEnd::spawn(server, Arc::clone(&self.auto_reply));
        self.conns.lock().push(end);
        self.accept_notify.notify_waiters();
        Ok(Connection::spawn(client, "mock", listener))
    }
}
