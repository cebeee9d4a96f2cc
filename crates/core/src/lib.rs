//! Per-endpoint connection pool and request dispatcher for the Cellar
//! distributed key-value store.
//!
//! A [`Node`] represents one remote endpoint and owns a bounded pool of
//! long-lived connections to it. Concurrent operations are admitted with one
//! permit per checked-out connection; each connection carries at most one
//! in-flight operation. An idle reaper trims the pool back toward the
//! keep-alive floor, and a passive failure detector moves the node between
//! serving and health-checking based on its own disconnect rate.
//!
//! Nodes are meant to be instantiated per endpoint and composed by a cluster
//! layer; there is no process-wide state. Wire knowledge stays in
//! [`cellar_protocol`]: the node writes pre-serialized messages and hands
//! responses to the submitted operation unopened.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cellar_core::Node;
//!
//! # async fn example(op: Arc<dyn cellar_core::NodeOperation>) -> Result<(), cellar_core::NodeError> {
//! let node = Node::builder()
//!     .with_remote_address("10.0.0.5")
//!     .with_min_connections(2)
//!     .with_max_connections(16)
//!     .build()?;
//! node.start().await?;
//!
//! if !node.execute(op).await? {
//!     // Saturated; the cluster layer may try another node.
//! }
//!
//! let mut handle = node.shutdown().await?;
//! handle.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
mod health;
pub mod node;
pub mod operation;
pub mod permits;
pub mod pool;

pub use error::NodeError;
pub use node::{Builder, Node, NodeStateListener, NodeStats, ShutdownHandle, State};
pub use operation::NodeOperation;
