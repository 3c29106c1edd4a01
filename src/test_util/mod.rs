//! Test doubles and helpers, for unit tests in this crate and for code embedding it

use std::time::Duration;

use tokio::time;

mod connection;
mod control;
mod destination;

pub use connection::{channel_connection, ChannelConnection, ConnectionPeer};
pub use control::TrackingControlChannel;
pub use destination::{Sent, TrackingDestination};

/// Polls `condition` until it holds, panicking after a (tokio time) timeout
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let reached = time::timeout(Duration::from_secs(5), async {
        while !condition() {
            time::sleep(Duration::from_millis(1)).await;
        }
    }).await;
    assert!(reached.is_ok(), "condition was not reached in time");
}
