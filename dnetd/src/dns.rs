//! Periodic re-resolution of the peer hostnames behind bridge and DDCMP
//! circuits, so a far end on a dynamic address keeps working.

use embassy_time::{Duration, Instant};

use edge_nal::{AddrType, Dns};
use edge_nal_std::Stack;

use log::{debug, info, warn};

use crate::lines::Line;

pub struct DnsPoller {
    server: String,
    period: Duration,
    next: Instant,
}

impl DnsPoller {
    pub fn new(server: &str, poll_secs: u64, now: Instant) -> Self {
        info!("re-resolving peer addresses via {} every {}s", server, poll_secs);

        Self {
            server: server.to_string(),
            period: Duration::from_secs(poll_secs),
            next: now,
        }
    }

    pub fn next_due(&self) -> Instant {
        self.next
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next <= now
    }

    /// Resolves every tracked hostname once, updating the lines in
    /// place. Lookups go through the host resolver; the configured
    /// server is what that resolver is expected to point at.
    pub async fn poll(&mut self, stack: &Stack, lines: &mut [Line], now: Instant) {
        self.next = now + self.period;

        for line in lines {
            let Some(host) = line.tracked_host() else {
                continue;
            };
            let host = host.to_string();

            match stack.get_host_by_name(&host, AddrType::IPv4).await {
                Ok(addr) => {
                    debug!("resolved {} to {} (server {})", host, addr, self.server);
                    line.set_peer(addr);
                }
                Err(err) => {
                    warn!("could not resolve {}: {:?}", host, err);
                }
            }
        }
    }
}

/// One up-front resolution pass so circuits have peer addresses before
/// the first poll period elapses.
pub async fn resolve_initial(stack: &Stack, lines: &mut [Line]) {
    for line in lines {
        let Some(host) = line.tracked_host() else {
            continue;
        };
        let host = host.to_string();

        match stack.get_host_by_name(&host, AddrType::IPv4).await {
            Ok(addr) => {
                debug!("resolved {} to {}", host, addr);
                line.set_peer(addr);
            }
            Err(err) => {
                warn!("could not resolve {}: {:?}", host, err);
            }
        }
    }
}
