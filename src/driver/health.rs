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

//! Connection state and exponential backoff, shared by every driver's
//! connect/reconnect loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// Doubling backoff with a ceiling. Each driver owns one instance across its
/// lifetime and calls `reset()` on a successful connect.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Mutex<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: Mutex::new(initial),
        }
    }

    /// Returns the delay to wait before the next attempt, then doubles it
    /// (capped at `max`) for the attempt after that.
    pub fn next(&self) -> Duration {
        let mut current = self.current.lock();
        let this = *current;
        *current = std::cmp::min(*current * 2, self.max);
        this
    }

    pub fn reset(&self) {
        *self.current.lock() = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

/// Tracks the last time inbound data arrived on a driver's transport and,
/// once armed, forces a disconnect if that goes quiet for longer than the
/// configured interval. Disabled entirely for drivers whose devices never
/// send unsolicited data (VISCA cameras, the TouchDesigner relay) — arming
/// one of those would just force a pointless reconnect loop against a
/// device that was never going to speak first.
pub struct Heartbeat {
    last_seen: Mutex<Instant>,
    armed: AtomicBool,
}

impl Heartbeat {
    pub fn new() -> Arc<Heartbeat> {
        Arc::new(Heartbeat {
            last_seen: Mutex::new(Instant::now()),
            armed: AtomicBool::new(false),
        })
    }

    /// Records that data just arrived. Called from a driver's read loop.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Spawns the watchdog loop for one connection lifetime: wakes every
    /// `interval / 4` (bounded below by 250ms) and calls `on_timeout` the
    /// first time `interval` has passed with no `touch()`. `on_timeout`
    /// should force the driver's transport closed so the normal
    /// disconnect/reconnect path takes over; the watchdog disarms itself
    /// after firing once, since the reconnect will spawn a fresh one.
    pub fn spawn(self: &Arc<Self>, interval: Duration, on_timeout: impl Fn() + Send + 'static) {
        self.armed.store(true, Ordering::SeqCst);
        *self.last_seen.lock() = Instant::now();
        let heartbeat = self.clone();
        let poll = (interval / 4).max(Duration::from_millis(250));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll).await;
                if !heartbeat.armed.load(Ordering::SeqCst) {
                    return;
                }
                let idle = heartbeat.last_seen.lock().elapsed();
                if idle >= interval {
                    heartbeat.disarm();
                    on_timeout();
                    return;
                }
            }
        });
    }

    pub fn stop(&self) {
        self.disarm();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn doubles_up_to_the_ceiling() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(350));
        assert_eq!(backoff.next(), Duration::from_millis(350));
    }

    #[test]
    fn reset_returns_to_the_initial_delay() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn heartbeat_fires_once_after_the_interval_with_no_touch() {
        let heartbeat = Heartbeat::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        heartbeat.spawn(Duration::from_millis(40), move || {
            let _ = tx.try_send(());
        });
        let fired = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(fired.is_ok(), "heartbeat never timed out");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn heartbeat_does_not_fire_while_touched_regularly() {
        let heartbeat = Heartbeat::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
        heartbeat.spawn(Duration::from_millis(60), move || {
            let _ = tx.try_send(());
        });
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            heartbeat.touch();
        }
        assert!(rx.try_recv().is_err(), "heartbeat fired despite regular touches");
        heartbeat.stop();
    }
}
