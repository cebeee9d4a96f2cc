//! Passive failure detection and the health-check probe.
//!
//! The node counts unexpected disconnects in a short sliding window. Too
//! many in too little time means the endpoint is suspect: the monitor probes
//! it with a real connect, demotes the node to health-checking while probes
//! fail, and promotes it back once one succeeds. The threshold tolerates
//! isolated closures without flapping; the probe is a real TCP connect
//! because that is the only authoritative liveness signal.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::node::{Node, State};

/// Delay before the first monitor tick.
const MONITOR_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Fixed delay between monitor ticks.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);
/// Sliding window over the recent-close log. Must exceed the tick delay.
const CLOSE_WINDOW: Duration = Duration::from_secs(3);
/// Unexpected closes within the window that trigger a probe.
const CLOSE_THRESHOLD: usize = 5;

pub(crate) async fn run_monitor(node: Node) {
    let mut tick =
        tokio::time::interval_at(Instant::now() + MONITOR_INITIAL_DELAY, MONITOR_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let state = node.state();
        if matches!(state, State::ShuttingDown | State::Shutdown) {
            break;
        }

        node.purge_recent_closes(CLOSE_WINDOW);

        let suspect = state == State::Running && node.recent_close_count() >= CLOSE_THRESHOLD;
        if suspect || state == State::HealthChecking {
            check_health(&node).await;
        }
    }
}

/// Probe the endpoint through the same path the dispatcher uses for new
/// connections, outside the permit gate, and close the result immediately.
/// Draining the idle pool on the way doubles as a purge of dead entries.
async fn check_health(node: &Node) {
    match node.do_get_connection().await {
        Ok(conn) => {
            node.close_connection(&conn);
            if node.transition(State::HealthChecking, State::Running) {
                info!(addr = %node.remote_address(), port = node.port(), "node recovered");
            }
        }
        Err(probe_error) => {
            if node.transition(State::Running, State::HealthChecking) {
                error!(addr = %node.remote_address(), port = node.port(),
                       error = %probe_error, "node offline; health checking");
            } else {
                error!(addr = %node.remote_address(), port = node.port(),
                       error = %probe_error, "node failed health check");
            }
        }
    }
}
