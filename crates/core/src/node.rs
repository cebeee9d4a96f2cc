//! The node: a per-endpoint connection pool and request dispatcher.
//!
//! A [`Node`] owns a bounded pool of long-lived connections to one remote
//! endpoint. Admission is gated by one permit per checked-out connection, an
//! idle reaper trims the pool back toward the keep-alive floor, and a health
//! monitor watches the node's own disconnect rate to decide when the endpoint
//! needs probing. Requests are submitted with [`Node::execute`]; responses
//! come back asynchronously through the connection reader into the
//! operation's completion handle.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use cellar_protocol::{
    CloseWatch, Connection, Connector, ErrorReply, Message, ProtocolError, ResponseListener,
    TcpConnector,
};

use crate::error::NodeError;
use crate::health;
use crate::operation::NodeOperation;
use crate::permits::PermitGate;
use crate::pool::{IdlePool, RecentCloseLog};

/// Default remote address.
pub const DEFAULT_REMOTE_ADDRESS: &str = "127.0.0.1";
/// Default remote port.
pub const DEFAULT_REMOTE_PORT: u16 = 8087;
/// Default keep-alive floor.
pub const DEFAULT_MIN_CONNECTIONS: usize = 1;
/// Default pool cap; zero means unbounded.
pub const DEFAULT_MAX_CONNECTIONS: usize = 0;
/// Default idle timeout. Deliberately aggressive: idle connections beyond
/// the floor are cheap to reopen and expensive to hold against a busy
/// cluster.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(1000);
/// Default connect timeout; zero means wait indefinitely.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::ZERO;

/// Delay before the first idle-reaper run.
const REAPER_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Fixed delay between idle-reaper runs.
const REAPER_INTERVAL: Duration = Duration::from_secs(5);
/// Fixed delay between drain checks while shutting down.
const DRAIN_INTERVAL: Duration = Duration::from_millis(500);

const EXECUTE_STATES: &[State] = &[State::Running, State::HealthChecking];
const CONFIG_STATES: &[State] = &[State::Created, State::Running, State::HealthChecking];

/// Node lifecycle states.
///
/// Transitions are monotonic except for `Running` ↔ `HealthChecking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Created = 0,
    Running = 1,
    HealthChecking = 2,
    ShuttingDown = 3,
    Shutdown = 4,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Created,
            1 => State::Running,
            2 => State::HealthChecking,
            3 => State::ShuttingDown,
            _ => State::Shutdown,
        }
    }
}

/// Observer of node state transitions.
///
/// Called synchronously on the transitioning task, under a lock that guards
/// only the listener set. Implementations must be quick and must not call
/// back into the node.
pub trait NodeStateListener: Send + Sync {
    fn node_state_changed(&self, node: &Node, state: State);
}

/// Point-in-time snapshot of a node's pool.
#[derive(Debug, Clone, Copy)]
pub struct NodeStats {
    pub state: State,
    pub in_flight: usize,
    pub idle: usize,
    pub available_permits: usize,
    pub max_connections: usize,
    pub recent_closes: usize,
}

struct NodeInner {
    remote_address: String,
    port: u16,
    connector: Arc<dyn Connector>,
    runtime: Option<Handle>,
    state: AtomicU8,
    /// Serializes `start` and `shutdown`.
    lifecycle: tokio::sync::Mutex<()>,
    permits: PermitGate,
    idle: IdlePool,
    recently_closed: RecentCloseLog,
    in_flight: DashMap<u64, Arc<dyn NodeOperation>>,
    listeners: Mutex<Vec<Arc<dyn NodeStateListener>>>,
    min_connections: AtomicUsize,
    idle_timeout_ms: AtomicU64,
    connect_timeout_ms: AtomicU64,
    block_on_max: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
    health: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Handle to one remote endpoint's connection pool. Cheap to clone; all
/// clones refer to the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

/// Completion handle returned by [`Node::shutdown`].
///
/// Shutdown is not cancellable once started; dropping the handle only stops
/// observing it.
pub struct ShutdownHandle {
    done: watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// Wait until the node reaches [`State::Shutdown`].
    pub async fn wait(&mut self) {
        while !*self.done.borrow_and_update() {
            if self.done.changed().await.is_err() {
                break;
            }
        }
    }

    /// Wait up to `timeout`; returns whether shutdown completed in time.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }
}

/// Builder for a [`Node`].
#[derive(Clone)]
pub struct Builder {
    remote_address: String,
    remote_port: u16,
    min_connections: usize,
    max_connections: usize,
    idle_timeout: Duration,
    connection_timeout: Duration,
    block_on_max_connections: bool,
    connector: Option<Arc<dyn Connector>>,
    runtime: Option<Handle>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            remote_address: DEFAULT_REMOTE_ADDRESS.to_string(),
            remote_port: DEFAULT_REMOTE_PORT,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            block_on_max_connections: false,
            connector: None,
            runtime: None,
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target host, FQDN or IP address.
    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = address.into();
        self
    }

    pub fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = port;
        self
    }

    /// Keep-alive floor; these connections are exempt from the idle reaper.
    pub fn with_min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    /// Pool cap; zero means unbounded.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Age past which an idle connection beyond the floor is reaped.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// TCP connect timeout; zero waits indefinitely.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// When the pool is saturated, block in [`Node::execute`] (FIFO) instead
    /// of failing fast with `false`.
    pub fn with_block_on_max_connections(mut self, block: bool) -> Self {
        self.block_on_max_connections = block;
        self
    }

    /// Supply the connector instead of the default TCP one. Externally
    /// supplied connectors are shared, not owned.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Runtime handle for the node's maintenance tasks. Without one the
    /// ambient runtime is used.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Build the node. Fails when `min_connections` exceeds a bounded
    /// `max_connections`.
    pub fn build(self) -> Result<Node, NodeError> {
        if self.max_connections > 0 && self.min_connections > self.max_connections {
            return Err(NodeError::InvalidConfig(format!(
                "min connections {} greater than max connections {}",
                self.min_connections, self.max_connections
            )));
        }
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(TcpConnector::new(
                self.remote_address.clone(),
                self.remote_port,
            ))
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Node {
            inner: Arc::new(NodeInner {
                remote_address: self.remote_address,
                port: self.remote_port,
                connector,
                runtime: self.runtime,
                state: AtomicU8::new(State::Created as u8),
                lifecycle: tokio::sync::Mutex::new(()),
                permits: PermitGate::new(self.max_connections),
                idle: IdlePool::new(),
                recently_closed: RecentCloseLog::new(),
                in_flight: DashMap::new(),
                listeners: Mutex::new(Vec::new()),
                min_connections: AtomicUsize::new(self.min_connections),
                idle_timeout_ms: AtomicU64::new(self.idle_timeout.as_millis() as u64),
                connect_timeout_ms: AtomicU64::new(self.connection_timeout.as_millis() as u64),
                block_on_max: AtomicBool::new(self.block_on_max_connections),
                reaper: Mutex::new(None),
                health: Mutex::new(None),
                shutdown_tx,
                shutdown_rx,
            }),
        })
    }

    /// Build one node per address with shared settings.
    pub fn build_nodes(
        self,
        addresses: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Vec<Node>, NodeError> {
        addresses
            .into_iter()
            .map(|address| self.clone().with_remote_address(address).build())
            .collect()
    }
}

impl Node {
    pub fn builder() -> Builder {
        Builder::default()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn remote_address(&self) -> &str {
        &self.inner.remote_address
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn min_connections(&self) -> usize {
        self.inner.min_connections.load(Ordering::Relaxed)
    }

    /// Current pool cap; [`crate::permits::UNBOUNDED`] when none is set.
    pub fn max_connections(&self) -> usize {
        self.inner.permits.max()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.idle_timeout_ms.load(Ordering::Relaxed))
    }

    /// Connect timeout; `Duration::ZERO` means wait indefinitely.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.connect_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn block_on_max_connections(&self) -> bool {
        self.inner.block_on_max.load(Ordering::Relaxed)
    }

    /// How many more connections can be checked out without waiting.
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.len()
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            state: self.state(),
            in_flight: self.inner.in_flight.len(),
            idle: self.inner.idle.len(),
            available_permits: self.inner.permits.available(),
            max_connections: self.inner.permits.max(),
            recent_closes: self.inner.recently_closed.len(),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn set_min_connections(&self, min: usize) -> Result<(), NodeError> {
        self.state_check(CONFIG_STATES, "CREATED, RUNNING or HEALTH_CHECKING")?;
        if min > self.inner.permits.max() {
            return Err(NodeError::InvalidConfig(format!(
                "min connections {min} greater than max connections"
            )));
        }
        self.inner.min_connections.store(min, Ordering::Relaxed);
        Ok(())
    }

    /// Resize the pool cap; zero means unbounded. Shrinking below the number
    /// of checked-out connections neither reaps nor rejects: the overage
    /// drains as operations finish.
    pub fn set_max_connections(&self, max: usize) -> Result<(), NodeError> {
        self.state_check(CONFIG_STATES, "CREATED, RUNNING or HEALTH_CHECKING")?;
        if max != 0 && max < self.min_connections() {
            return Err(NodeError::InvalidConfig(format!(
                "max connections {max} less than min connections"
            )));
        }
        self.inner.permits.set_max(max);
        Ok(())
    }

    pub fn set_idle_timeout(&self, timeout: Duration) -> Result<(), NodeError> {
        self.state_check(CONFIG_STATES, "CREATED, RUNNING or HEALTH_CHECKING")?;
        self.inner
            .idle_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_connection_timeout(&self, timeout: Duration) -> Result<(), NodeError> {
        self.state_check(CONFIG_STATES, "CREATED, RUNNING or HEALTH_CHECKING")?;
        self.inner
            .connect_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_block_on_max_connections(&self, block: bool) {
        self.inner.block_on_max.store(block, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // State listeners
    // ------------------------------------------------------------------

    pub fn add_state_listener(&self, listener: Arc<dyn NodeStateListener>) {
        self.inner.listeners.lock().push(listener);
    }

    /// Remove a previously added listener by identity.
    pub fn remove_state_listener(&self, listener: &Arc<dyn NodeStateListener>) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|candidate| !Arc::ptr_eq(candidate, listener));
        listeners.len() != before
    }

    fn notify_state_listeners(&self) {
        let state = self.state();
        let listeners = self.inner.listeners.lock();
        for listener in listeners.iter() {
            listener.node_state_changed(self, state);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open up to `min_connections` connections (failures are tolerated) and
    /// start the idle reaper and health monitor.
    pub async fn start(&self) -> Result<(), NodeError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.state_check(&[State::Created], "CREATED")?;

        let min = self.min_connections();
        let mut warmed = Vec::with_capacity(min);
        for _ in 0..min {
            match self.do_get_connection().await {
                Ok(conn) => warmed.push(conn),
                Err(error) => {
                    debug!(addr = %self.inner.remote_address, port = self.inner.port,
                           error = %error, "could not pre-open connection");
                }
            }
        }
        for conn in warmed {
            let conn_id = conn.id();
            self.inner.idle.push_front(Arc::clone(&conn));
            if !conn.set_close_watch(CloseWatch::Idle) {
                self.inner.recently_closed.record(conn_id);
            }
        }

        *self.inner.reaper.lock() = Some(self.spawn_task(run_reaper(self.clone())));
        *self.inner.health.lock() = Some(self.spawn_task(health::run_monitor(self.clone())));

        self.set_state(State::Running);
        info!(addr = %self.inner.remote_address, port = self.inner.port, "node started");
        self.notify_state_listeners();
        Ok(())
    }

    /// Begin a graceful shutdown: stop the maintenance tasks, close idle
    /// connections, and drain in-flight operations. The returned handle
    /// completes once the node reaches [`State::Shutdown`].
    pub async fn shutdown(&self) -> Result<ShutdownHandle, NodeError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.state_check(EXECUTE_STATES, "RUNNING or HEALTH_CHECKING")?;

        self.set_state(State::ShuttingDown);
        info!(addr = %self.inner.remote_address, port = self.inner.port, "node shutting down");
        self.notify_state_listeners();

        if let Some(task) = self.inner.reaper.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.health.lock().take() {
            task.abort();
        }

        for entry in self.inner.idle.drain() {
            self.close_connection(&entry.conn);
        }

        let _ = self.spawn_task(run_drain(self.clone()));

        Ok(ShutdownHandle {
            done: self.inner.shutdown_rx.clone(),
        })
    }

    fn set_state(&self, state: State) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Compare-and-swap state transition with listener notification; used by
    /// the health monitor so a concurrent shutdown cannot be overwritten.
    pub(crate) fn transition(&self, from: State, to: State) -> bool {
        let swapped = self
            .inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.notify_state_listeners();
        }
        swapped
    }

    fn state_check(&self, allowed: &[State], required: &'static str) -> Result<(), NodeError> {
        let current = self.state();
        if allowed.contains(&current) {
            Ok(())
        } else {
            debug!(addr = %self.inner.remote_address, port = self.inner.port,
                   current = ?current, required, "operation refused by state check");
            Err(NodeError::IllegalState { required, current })
        }
    }

    fn spawn_task<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.inner.runtime {
            Some(handle) => handle.spawn(future),
            None => tokio::spawn(future),
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Submit an operation.
    ///
    /// Returns `Ok(false)` when no connection could be had: the operation
    /// was not accepted and the caller may retry elsewhere, and no permit is
    /// held. Once this returns `Ok(true)` the operation will see exactly one
    /// of a final response or an error.
    pub async fn execute(&self, op: Arc<dyn NodeOperation>) -> Result<bool, NodeError> {
        self.state_check(EXECUTE_STATES, "RUNNING or HEALTH_CHECKING")?;
        op.set_last_node(self);

        let Some(conn) = self.get_connection().await? else {
            debug!(addr = %self.inner.remote_address, port = self.inner.port,
                   "operation not accepted; no connection available");
            return Ok(false);
        };

        let conn_id = conn.id();
        self.inner.in_flight.insert(conn_id, Arc::clone(&op));

        let request = op.request();
        match conn.write_message(&request).await {
            Ok(()) => {
                if !conn.set_close_watch(CloseWatch::InFlight) {
                    // Closed before the watch went up; no event will fire,
                    // so run the close handling here.
                    self.handle_in_flight_close(&conn, None);
                } else {
                    debug!(addr = %self.inner.remote_address, port = self.inner.port,
                           conn = conn_id, "operation dispatched");
                }
            }
            Err(write_error) => {
                error!(addr = %self.inner.remote_address, port = self.inner.port,
                       conn = conn_id, error = %write_error, "write failed");
                if let Some((_, op)) = self.inner.in_flight.remove(&conn_id) {
                    conn.close();
                    self.return_connection(&conn);
                    self.inner.recently_closed.record(conn_id);
                    op.set_error(NodeError::WriteFailed(write_error));
                }
            }
        }
        Ok(true)
    }

    /// Acquire a permit (blocking or fail-fast per configuration), then a
    /// connection. On every exit path either a permit is held and a live
    /// connection is returned, or neither is.
    async fn get_connection(&self) -> Result<Option<Arc<Connection>>, NodeError> {
        self.state_check(EXECUTE_STATES, "RUNNING or HEALTH_CHECKING")?;

        let acquired = if self.block_on_max_connections() {
            if !self.inner.permits.try_acquire() {
                info!(addr = %self.inner.remote_address, port = self.inner.port,
                      "all connections in use; waiting for a permit");
                self.inner.permits.acquire().await;
            }
            true
        } else {
            self.inner.permits.try_acquire()
        };
        if !acquired {
            return Ok(None);
        }

        // The hold pairs the acquire with a release on failure, including
        // cancellation while the connect is pending.
        let permit = PermitHold::new(&self.inner.permits);
        match self.do_get_connection().await {
            Ok(conn) => {
                permit.keep();
                Ok(Some(conn))
            }
            Err(error) => {
                debug!(addr = %self.inner.remote_address, port = self.inner.port,
                       error = %error, "connection acquisition failed");
                Ok(None)
            }
        }
    }

    /// Pull an open connection from the idle pool or open a fresh one.
    ///
    /// Closed entries pulled along the way are silently discarded, which
    /// doubles as the purge path during health checks. Permits are not this
    /// method's concern.
    pub(crate) async fn do_get_connection(&self) -> Result<Arc<Connection>, NodeError> {
        while let Some(entry) = self.inner.idle.pop_front() {
            if entry.conn.is_open() && entry.conn.set_close_watch(CloseWatch::Detached) {
                trace!(conn = entry.conn.id(), "reusing idle connection");
                return Ok(entry.conn);
            }
            trace!(conn = entry.conn.id(), "discarding closed idle connection");
        }

        let timeout = match self.connection_timeout() {
            Duration::ZERO => None,
            limit => Some(limit),
        };
        let listener: Arc<dyn ResponseListener> = Arc::new(self.clone());
        self.inner
            .connector
            .connect(timeout, listener)
            .await
            .map_err(|error| {
                error!(addr = %self.inner.remote_address, port = self.inner.port,
                       error = %error, "connection attempt failed");
                NodeError::ConnectionFailed(error)
            })
    }

    /// Hand a checked-out connection back. Every terminal path for an
    /// in-flight operation funnels through here, and the permit is released
    /// exactly once whether the connection survived or not.
    fn return_connection(&self, conn: &Arc<Connection>) {
        match self.state() {
            State::ShuttingDown | State::Shutdown => {
                self.close_connection(conn);
                self.inner.permits.release();
            }
            _ => {
                if self.inner.in_flight.contains_key(&conn.id()) {
                    error!(conn = conn.id(), "connection returned to pool while still in use");
                } else {
                    if conn.is_open() && conn.set_close_watch(CloseWatch::Idle) {
                        trace!(conn = conn.id(), "connection returned to pool");
                        self.inner.idle.push_front(Arc::clone(conn));
                    } else {
                        trace!(conn = conn.id(), "closed connection returned; discarding");
                    }
                    self.inner.permits.release();
                }
            }
        }
    }

    /// Close a connection without polluting the recent-close log: the watch
    /// is detached first, so the close stays silent.
    pub(crate) fn close_connection(&self, conn: &Arc<Connection>) {
        conn.set_close_watch(CloseWatch::Detached);
        conn.close();
    }

    fn handle_in_flight_close(&self, conn: &Arc<Connection>, cause: Option<ProtocolError>) {
        if let Some((_, op)) = self.inner.in_flight.remove(&conn.id()) {
            warn!(addr = %self.inner.remote_address, port = self.inner.port,
                  conn = conn.id(), "connection closed while operation in progress");
            self.return_connection(conn);
            self.inner.recently_closed.record(conn.id());
            op.set_error(NodeError::UnexpectedClose { cause });
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Trim idle connections past the age threshold, oldest first, never
    /// taking the pool below the keep-alive floor.
    fn reap_idle_connections(&self) {
        let min = self.min_connections();
        let mut current = self.inner.in_flight.len() + self.inner.idle.len();
        if current <= min {
            return;
        }
        let idle_timeout = self.idle_timeout();
        let now = Instant::now();
        let stale = self.inner.idle.take_stale(|entry| {
            if current > min && now.duration_since(entry.idle_since) > idle_timeout {
                current -= 1;
                true
            } else {
                false
            }
        });
        for entry in stale {
            debug!(addr = %self.inner.remote_address, port = self.inner.port,
                   conn = entry.conn.id(), "idle connection reaped");
            self.close_connection(&entry.conn);
        }
    }

    pub(crate) fn recent_close_count(&self) -> usize {
        self.inner.recently_closed.len()
    }

    pub(crate) fn purge_recent_closes(&self, window: Duration) {
        self.inner.recently_closed.purge(window);
    }
}

/// Releases an acquired permit on drop unless the checkout completed.
struct PermitHold<'a> {
    permits: &'a PermitGate,
    armed: bool,
}

impl<'a> PermitHold<'a> {
    fn new(permits: &'a PermitGate) -> Self {
        Self {
            permits,
            armed: true,
        }
    }

    /// The permit now belongs to the checked-out connection.
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PermitHold<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.permits.release();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("remote_address", &self.inner.remote_address)
            .field("port", &self.inner.port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------
// Reactor: callbacks from the I/O layer
// ----------------------------------------------------------------------

impl ResponseListener for Node {
    fn on_message(&self, conn: &Arc<Connection>, msg: Message) {
        let Some(op) = self
            .inner
            .in_flight
            .get(&conn.id())
            .map(|entry| Arc::clone(entry.value()))
        else {
            // Lost the race with a close on the same connection; drop it.
            trace!(conn = conn.id(), "response for untracked connection dropped");
            return;
        };

        op.set_response(msg);
        if op.is_done() {
            // Streaming operations stay in the map across messages; only
            // whoever actually removes the entry returns the connection.
            if self.inner.in_flight.remove(&conn.id()).is_some() {
                self.return_connection(conn);
            }
        }
    }

    fn on_error_reply(&self, conn: &Arc<Connection>, reply: ErrorReply) {
        debug!(addr = %self.inner.remote_address, port = self.inner.port,
               conn = conn.id(), code = reply.code, message = %reply.message,
               "server error reply");
        if let Some((_, op)) = self.inner.in_flight.remove(&conn.id()) {
            op.set_error(NodeError::ErrorReply {
                code: reply.code,
                message: reply.message,
            });
            // An error reply is still an answer; the connection stays usable.
            self.return_connection(conn);
        }
    }

    fn on_exception(&self, conn: &Arc<Connection>, error: ProtocolError) {
        error!(addr = %self.inner.remote_address, port = self.inner.port,
               conn = conn.id(), error = %error, "transport exception");
        // A repeat for an already-handled connection finds no entry here.
        if let Some((_, op)) = self.inner.in_flight.remove(&conn.id()) {
            op.set_error(NodeError::Transport(error));
            self.return_connection(conn);
        }
    }

    fn on_close(&self, conn: &Arc<Connection>, watch: CloseWatch, cause: Option<ProtocolError>) {
        match watch {
            CloseWatch::Detached => {}
            CloseWatch::Idle => {
                // The entry stays in the pool; the next poll discards it.
                warn!(addr = %self.inner.remote_address, port = self.inner.port,
                      conn = conn.id(), "idle connection closed");
                self.inner.recently_closed.record(conn.id());
            }
            CloseWatch::InFlight => self.handle_in_flight_close(conn, cause),
        }
    }
}

// ----------------------------------------------------------------------
// Maintenance tasks
// ----------------------------------------------------------------------

async fn run_reaper(node: Node) {
    let mut tick = tokio::time::interval_at(Instant::now() + REAPER_INITIAL_DELAY, REAPER_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if matches!(node.state(), State::ShuttingDown | State::Shutdown) {
            break;
        }
        node.reap_idle_connections();
    }
}

async fn run_drain(node: Node) {
    let mut tick = tokio::time::interval(DRAIN_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if node.inner.in_flight.is_empty() {
            node.set_state(State::Shutdown);
            node.notify_state_listeners();
            debug!(addr = %node.inner.remote_address, port = node.inner.port, "node shut down");
            let _ = node.inner.shutdown_tx.send(true);
            break;
        }
        trace!(in_flight = node.inner.in_flight.len(),
               "waiting for in-flight operations to drain");
    }
}
