// Copyright (C) 2024 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Tracks the set of upstream OSC senders (controllers, feedback listeners)
//! so outbound status/feedback can be broadcast back to everyone currently
//! talking to the hub, the way `lumencanvas-signalflow`'s `OscSession`
//! tracks a `last_seen` timestamp per peer address.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

const EXPIRY: Duration = Duration::from_secs(60);

pub struct UpstreamClients {
    seen: DashMap<SocketAddr, Instant>,
}

impl UpstreamClients {
    pub fn new() -> Self {
        Self {
            seen: DashMap::new(),
        }
    }

    /// Records (or refreshes) a client's last-seen time.
    pub fn touch(&self, addr: SocketAddr) {
        self.seen.insert(addr, Instant::now());
    }

    /// Returns all clients seen within the expiry window.
    pub fn active(&self) -> Vec<SocketAddr> {
        let now = Instant::now();
        self.seen
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) < EXPIRY)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Drops entries older than the expiry window. Call periodically so the
    /// map doesn't grow unbounded with transient senders.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.seen
            .retain(|_, last_seen| now.duration_since(*last_seen) < EXPIRY);
    }
}

impl Default for UpstreamClients {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn touch_then_active_reports_the_client() {
        let clients = UpstreamClients::new();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        clients.touch(addr);
        assert_eq!(clients.active(), vec![addr]);
    }

    #[test]
    fn sweep_drops_nothing_within_the_window() {
        let clients = UpstreamClients::new();
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        clients.touch(addr);
        clients.sweep();
        assert_eq!(clients.active(), vec![addr]);
    }
}
