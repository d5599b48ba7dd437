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

//! The ChamSys lighting desk driver: a transparent OSC-to-OSC UDP relay that
//! additionally claims unprefixed playback telemetry (`/pb/{n}`,
//! `/pb/{n}/isactive`, `/pb/{n}/cue`, `/master`) via `HandleFeedback`. Shares
//! the reconnect/heartbeat/replay shape with the other stateful drivers even
//! though its "connection" is just a bound UDP socket, so the desk can be
//! power-cycled mid-show without losing queued commands.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::config::{HeartbeatConfig, ReconnectConfig};
use crate::driver::{Backoff, ConnectionState, DriverEvent, DriverStats, Heartbeat, ReplayBuffer};
use crate::error::HubError;
use crate::osc::{OscArg, OscMessage};

struct Shared {
    name: String,
    prefix: String,
    host: String,
    port: u16,
    events_tx: mpsc::Sender<(String, DriverEvent)>,
    replay: ReplayBuffer,
    backoff: Backoff,
    heartbeat_interval: Option<Duration>,
    heartbeat: Arc<Heartbeat>,
    state: SyncMutex<ConnectionState>,
    stats: SyncMutex<DriverStats>,
    socket: AsyncMutex<Option<Arc<UdpSocket>>>,
}

pub struct Driver(Arc<Shared>);

impl Driver {
    pub fn new(
        prefix: String,
        host: String,
        port: u16,
        reconnect: ReconnectConfig,
        heartbeat: HeartbeatConfig,
        events_tx: mpsc::Sender<(String, DriverEvent)>,
    ) -> Self {
        Driver(Arc::new(Shared {
            name: format!("chamsys{prefix}"),
            prefix,
            host,
            port,
            events_tx,
            replay: ReplayBuffer::default(),
            backoff: Backoff::new(
                Duration::from_millis(reconnect.initial_backoff_ms),
                Duration::from_millis(reconnect.max_backoff_ms),
            ),
            heartbeat_interval: heartbeat.enabled.then(|| Duration::from_millis(heartbeat.interval_ms)),
            heartbeat: Heartbeat::new(),
            state: SyncMutex::new(ConnectionState::Disconnected),
            stats: SyncMutex::new(DriverStats::default()),
            socket: AsyncMutex::new(None),
        }))
    }
}

impl Shared {
    fn record_error(&self, message: String) {
        self.stats.lock().last_error = Some((message, SystemTime::now()));
    }

    async fn connect(shared: Arc<Shared>) -> Result<(), HubError> {
        *shared.state.lock() = ConnectionState::Connecting;
        match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => match socket.connect((shared.host.as_str(), shared.port)).await {
                Ok(()) => {
                    let socket = Arc::new(socket);
                    *shared.socket.lock().await = Some(socket.clone());
                    *shared.state.lock() = ConnectionState::Connected;
                    shared.stats.lock().last_connected = Some(SystemTime::now());
                    shared.backoff.reset();
                    let _ = shared
                        .events_tx
                        .send((shared.prefix.clone(), DriverEvent::Connected))
                        .await;
                    Self::drain_replay(&shared).await;
                    if let Some(interval) = shared.heartbeat_interval {
                        let armed = shared.clone();
                        shared.heartbeat.spawn(interval, move || {
                            let armed = armed.clone();
                            tokio::spawn(async move {
                                warn!(driver = %armed.name, "chamsys heartbeat timed out, forcing reconnect");
                                *armed.socket.lock().await = None;
                                *armed.state.lock() = ConnectionState::Disconnected;
                                let _ = armed.events_tx.send((armed.prefix.clone(), DriverEvent::Disconnected)).await;
                                Self::schedule_reconnect(armed);
                            });
                        });
                    }
                    tokio::spawn(Self::read_loop(shared.clone(), socket));
                    Ok(())
                }
                Err(e) => {
                    *shared.state.lock() = ConnectionState::Error;
                    shared.record_error(e.to_string());
                    let _ = shared
                        .events_tx
                        .send((shared.prefix.clone(), DriverEvent::Error(e.to_string())))
                        .await;
                    Self::schedule_reconnect(shared.clone());
                    Err(HubError::Transport(e.to_string()))
                }
            },
            Err(e) => {
                *shared.state.lock() = ConnectionState::Error;
                shared.record_error(e.to_string());
                Self::schedule_reconnect(shared.clone());
                Err(HubError::Transport(e.to_string()))
            }
        }
    }

    fn schedule_reconnect(shared: Arc<Shared>) {
        let delay = shared.backoff.next();
        shared.stats.lock().reconnect_count += 1;
        *shared.state.lock() = ConnectionState::Reconnecting;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = Self::connect(shared).await;
        });
    }

    async fn drain_replay(shared: &Arc<Shared>) {
        for (address, args) in shared.replay.drain() {
            Self::send(shared, &address, &args).await;
        }
    }

    async fn read_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; 65_507];
        loop {
            match socket.recv(&mut buf).await {
                Ok(n) => {
                    shared.heartbeat.touch();
                    if let Ok(messages) = OscMessage::decode(&buf[..n]) {
                        for message in messages {
                            if let Some((relative, args)) = parse_telemetry(&message.addr, &message.args) {
                                let _ = shared
                                    .events_tx
                                    .send((shared.prefix.clone(), DriverEvent::Feedback(relative, args)))
                                    .await;
                            }
                        }
                    }
                }
                Err(_) => break,
            }
        }
    }

    async fn send(shared: &Arc<Shared>, address: &str, args: &[OscArg]) {
        let guard = shared.socket.lock().await;
        let Some(socket) = guard.as_ref() else {
            return;
        };
        let message = OscMessage::new(address, args.to_vec());
        match message.encode() {
            Ok(bytes) => {
                if let Err(e) = socket.send(&bytes).await {
                    shared.record_error(e.to_string());
                    warn!(driver = %shared.name, err = %e, "chamsys relay send failed");
                }
            }
            Err(e) => warn!(driver = %shared.name, err = %e, "chamsys: failed to encode relay message"),
        }
    }
}

/// Matches the unprefixed playback telemetry a ChamSys desk sends
/// unsolicited: `/pb/{n}`, `/pb/{n}/isactive`, `/pb/{n}/cue`, `/master`.
fn parse_telemetry(addr: &str, args: &[OscArg]) -> Option<(String, Vec<OscArg>)> {
    let segments: Vec<&str> = addr.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["pb", n] => Some((format!("/pb/{n}"), args.to_vec())),
        ["pb", n, "isactive"] => Some((format!("/pb/{n}/isactive"), args.to_vec())),
        ["pb", n, "cue"] => Some((format!("/pb/{n}/cue"), args.to_vec())),
        ["master"] => Some(("/master".to_string(), args.to_vec())),
        _ => None,
    }
}

#[async_trait]
impl crate::driver::Driver for Driver {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn prefix(&self) -> &str {
        &self.0.prefix
    }

    async fn connect(&self) -> Result<(), HubError> {
        Shared::connect(self.0.clone()).await
    }

    async fn disconnect(&self) {
        self.0.heartbeat.stop();
        *self.0.socket.lock().await = None;
        *self.0.state.lock() = ConnectionState::Disconnected;
    }

    fn is_connected(&self) -> bool {
        matches!(*self.0.state.lock(), ConnectionState::Connected)
    }

    async fn handle_osc(&self, address: &str, args: &[OscArg]) {
        if !self.is_connected() {
            self.0.replay.push(address.to_string(), args.to_vec());
            debug!(driver = %self.0.name, address, "chamsys disconnected, queued for replay");
            return;
        }
        Shared::send(&self.0, address, args).await;
    }

    async fn handle_fade_tick(&self, _local_key: &str, _value: f32) {}

    async fn handle_feedback(&self, raw_address: &str, args: &[OscArg]) -> bool {
        match parse_telemetry(raw_address, args) {
            Some((relative, args)) => {
                let _ = self
                    .0
                    .events_tx
                    .send((self.0.prefix.clone(), DriverEvent::Feedback(relative, args)))
                    .await;
                true
            }
            None => false,
        }
    }

    fn stats(&self) -> DriverStats {
        self.0.stats.lock().clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_driver() -> (Driver, mpsc::Receiver<(String, DriverEvent)>) {
        let (events_tx, events_rx) = mpsc::channel(16);
        let driver = Driver::new(
            "/lights".into(),
            "127.0.0.1".into(),
            0,
            ReconnectConfig::default(),
            HeartbeatConfig::default(),
            events_tx,
        );
        (driver, events_rx)
    }

    #[test]
    fn parses_playback_telemetry() {
        assert_eq!(
            parse_telemetry("/pb/3", &[OscArg::Float(0.5)]),
            Some(("/pb/3".to_string(), vec![OscArg::Float(0.5)]))
        );
        assert_eq!(
            parse_telemetry("/pb/3/isactive", &[OscArg::Bool(true)]),
            Some(("/pb/3/isactive".to_string(), vec![OscArg::Bool(true)]))
        );
        assert_eq!(
            parse_telemetry("/master", &[OscArg::Float(1.0)]),
            Some(("/master".to_string(), vec![OscArg::Float(1.0)]))
        );
        assert_eq!(parse_telemetry("/scene/recall", &[]), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handle_feedback_claims_playback_telemetry_and_relays_it() {
        let (driver, mut events_rx) = test_driver();
        use crate::driver::Driver as _;
        let claimed = driver.handle_feedback("/pb/1/cue", &[OscArg::Int(4)]).await;
        assert!(claimed);
        let (_prefix, event) = events_rx.recv().await.unwrap();
        assert!(matches!(event, DriverEvent::Feedback(addr, _) if addr == "/pb/1/cue"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handle_feedback_declines_addresses_it_does_not_own() {
        let (driver, _events_rx) = test_driver();
        use crate::driver::Driver as _;
        assert!(!driver.handle_feedback("/ch/1/mix/fader", &[]).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queues_outbound_commands_while_disconnected() {
        let (driver, _events_rx) = test_driver();
        use crate::driver::Driver as _;
        driver.handle_osc("/pb/1/go", &[]).await;
        assert!(!driver.0.replay.is_empty());
    }
}
