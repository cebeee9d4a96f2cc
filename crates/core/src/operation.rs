//! The operation contract between the node and the command layer.

use cellar_protocol::Message;

use crate::error::NodeError;
use crate::node::Node;

/// A future-like operation submitted to a node.
///
/// The node treats operations opaquely: it writes [`request`], feeds
/// responses and failures back through [`set_response`] and [`set_error`],
/// and records which node carried the attempt. A streaming operation may
/// receive several responses before [`is_done`] reports true; exactly one of
/// "done" or "failed" is observed at terminal state.
///
/// [`request`]: NodeOperation::request
/// [`set_response`]: NodeOperation::set_response
/// [`set_error`]: NodeOperation::set_error
/// [`is_done`]: NodeOperation::is_done
pub trait NodeOperation: Send + Sync {
    /// The pre-serialized request message.
    fn request(&self) -> Message;

    /// Deliver one response message. May be called more than once for
    /// streaming operations.
    fn set_response(&self, msg: Message);

    /// Whether the operation has seen its final response.
    fn is_done(&self) -> bool;

    /// Terminate the operation with a failure.
    fn set_error(&self, error: NodeError);

    /// Record the node that carried this attempt.
    fn set_last_node(&self, node: &Node);
}
