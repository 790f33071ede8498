use std::time::Duration;

use podium_common::messages::PING;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::connection::{ConnectionId, Outbound, OutboundSender};

/// Sends `ping` on an open connection until dropped
///
/// The first probe goes out one interval after start. Dropping the monitor
/// aborts its task, so it can never outlive the connection that owns it.
pub struct HeartbeatMonitor {
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    pub fn start(conn: ConnectionId, outbound: OutboundSender, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if outbound.send(Outbound::Text(PING.to_string())).is_err() {
                    debug!(%conn, "Transport gone, heartbeat stopped");
                    break;
                }
                trace!(%conn, "Heartbeat sent");
            }
        });
        Self { task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
