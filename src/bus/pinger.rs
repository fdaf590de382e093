use std::time::Duration;

use bytes::Bytes;
use codec::Command;
use tokio::time::{Instant, interval_at};

use crate::Gateway;

/// The healthcheck system.
///
/// Every `ping_freq` seconds (first fire after one second) sweep the dealer
/// pool: dealers silent past one interval get a probe, dealers silent past
/// three are demoted by the sweep itself. Only inbound traffic revives a
/// demoted dealer.
pub async fn start(gateway: Gateway, ping_freq: f64) {
    let mut interval = interval_at(
        Instant::now() + Duration::from_secs(1),
        Duration::from_secs_f64(ping_freq.max(0.1)),
    );

    loop {
        interval.tick().await;

        for identity in gateway.service.ping_sweep() {
            gateway
                .bus
                .send(identity, None, Command::Ping, Bytes::new());
        }
    }
}
