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

//! The QLab driver: an OSC/UDP relay like ChamSys and TouchDesigner, plus a
//! connect handshake (`/connect`, `/updates 1`), 1 Hz playhead/running-cues
//! polling, and `/reply/<original-address>` JSON parsing. Grounded on the
//! same UDP relay shape as `drivers::chamsys`, with the polling loop
//! following `mdwn-mtrack/src/controller/osc.rs`'s periodic-send pattern.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::config::{HeartbeatConfig, ReconnectConfig};
use crate::driver::{Backoff, ConnectionState, DriverEvent, DriverStats, Heartbeat, ReplayBuffer};
use crate::error::HubError;
use crate::osc::{OscArg, OscMessage};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

struct Shared {
    name: String,
    prefix: String,
    host: String,
    port: u16,
    passcode: Option<String>,
    events_tx: mpsc::Sender<(String, DriverEvent)>,
    replay: ReplayBuffer,
    backoff: Backoff,
    heartbeat_interval: Option<Duration>,
    heartbeat: Arc<Heartbeat>,
    state: SyncMutex<ConnectionState>,
    stats: SyncMutex<DriverStats>,
    socket: AsyncMutex<Option<Arc<UdpSocket>>>,
    last_playhead: SyncMutex<Option<String>>,
    last_running_cues: SyncMutex<Option<String>>,
}

pub struct Driver(Arc<Shared>);

impl Driver {
    pub fn new(
        prefix: String,
        host: String,
        port: u16,
        passcode: Option<String>,
        reconnect: ReconnectConfig,
        heartbeat: HeartbeatConfig,
        events_tx: mpsc::Sender<(String, DriverEvent)>,
    ) -> Self {
        Driver(Arc::new(Shared {
            name: format!("qlab{prefix}"),
            prefix,
            host,
            port,
            passcode,
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
            last_playhead: SyncMutex::new(None),
            last_running_cues: SyncMutex::new(None),
        }))
    }
}

impl Shared {
    fn record_error(&self, message: String) {
        self.stats.lock().last_error = Some((message, SystemTime::now()));
    }

    async fn connect(shared: Arc<Shared>) -> Result<(), HubError> {
        *shared.state.lock() = ConnectionState::Connecting;
        let bind = async {
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| HubError::Transport(e.to_string()))?;
            socket
                .connect((shared.host.as_str(), shared.port))
                .await
                .map_err(|e| HubError::Transport(e.to_string()))?;
            Ok::<_, HubError>(socket)
        };
        match bind.await {
            Ok(socket) => {
                let socket = Arc::new(socket);
                *shared.socket.lock().await = Some(socket.clone());
                *shared.state.lock() = ConnectionState::Connected;
                shared.stats.lock().last_connected = Some(SystemTime::now());
                shared.backoff.reset();
                let _ = shared
                    .events_tx
                    .send((shared.prefix.clone(), DriverEvent::Connected))
                    .await;
                Self::handshake(&shared).await;
                Self::drain_replay(&shared).await;
                if let Some(interval) = shared.heartbeat_interval {
                    let armed = shared.clone();
                    shared.heartbeat.spawn(interval, move || {
                        let armed = armed.clone();
                        tokio::spawn(async move {
                            warn!(driver = %armed.name, "qlab heartbeat timed out, forcing reconnect");
                            *armed.socket.lock().await = None;
                            *armed.state.lock() = ConnectionState::Disconnected;
                            let _ = armed.events_tx.send((armed.prefix.clone(), DriverEvent::Disconnected)).await;
                            Self::schedule_reconnect(armed);
                        });
                    });
                }
                tokio::spawn(Self::read_loop(shared.clone(), socket.clone()));
                tokio::spawn(Self::poll_loop(shared));
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
                Err(e)
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

    async fn handshake(shared: &Arc<Shared>) {
        let connect_args = match &shared.passcode {
            Some(passcode) => vec![OscArg::String(passcode.clone())],
            None => vec![],
        };
        Self::send(shared, "/connect", &connect_args).await;
        Self::send(shared, "/updates", &[OscArg::Int(1)]).await;
    }

    async fn poll_loop(shared: Arc<Shared>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if !matches!(*shared.state.lock(), ConnectionState::Connected) {
                return;
            }
            Self::send(&shared, "/cue/playhead/text", &[]).await;
            Self::send(&shared, "/runningCues", &[]).await;
        }
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
                            Self::handle_reply(&shared, &message).await;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_reply(shared: &Arc<Shared>, message: &OscMessage) {
        let Some(original) = message.addr.strip_prefix("/reply/") else {
            return;
        };
        let Some(body) = message.args.first().and_then(|a| a.as_str()) else {
            return;
        };
        let parsed: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(e) => {
                warn!(err = %e, driver = %shared.name, "qlab: malformed JSON reply");
                return;
            }
        };
        let data = parsed.get("data").cloned().unwrap_or(Value::Null);

        match original {
            "cue/playhead/text" => {
                let text = data.as_str().unwrap_or_default().to_string();
                let mut last = shared.last_playhead.lock();
                if last.as_deref() != Some(text.as_str()) {
                    *last = Some(text.clone());
                    drop(last);
                    let _ = shared
                        .events_tx
                        .send((shared.prefix.clone(), DriverEvent::Feedback("/playhead".to_string(), vec![OscArg::String(text)])))
                        .await;
                }
            }
            "runningCues" => {
                let rendered = data.to_string();
                let mut last = shared.last_running_cues.lock();
                if last.as_deref() != Some(rendered.as_str()) {
                    *last = Some(rendered.clone());
                    drop(last);
                    let _ = shared
                        .events_tx
                        .send((shared.prefix.clone(), DriverEvent::Feedback("/runningcues".to_string(), vec![OscArg::String(rendered)])))
                        .await;
                }
            }
            _ => {}
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
                    warn!(driver = %shared.name, err = %e, "qlab relay send failed");
                }
            }
            Err(e) => warn!(driver = %shared.name, err = %e, "qlab: failed to encode relay message"),
        }
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
            debug!(driver = %self.0.name, address, "qlab disconnected, queued for replay");
            return;
        }
        Shared::send(&self.0, address, args).await;
    }

    async fn handle_fade_tick(&self, _local_key: &str, _value: f32) {}

    fn stats(&self) -> DriverStats {
        self.0.stats.lock().clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_driver() -> Driver {
        let (events_tx, _rx) = mpsc::channel(16);
        Driver::new(
            "/sfx".into(),
            "127.0.0.1".into(),
            0,
            Some("secret".into()),
            ReconnectConfig::default(),
            HeartbeatConfig::default(),
            events_tx,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handle_reply_emits_feedback_only_on_playhead_change() {
        let driver = test_driver();
        let shared = &driver.0;
        let msg = OscMessage::new(
            "/reply/cue/playhead/text",
            vec![OscArg::String(r#"{"status":"ok","data":"1.0 Intro"}"#.to_string())],
        );
        Shared::handle_reply(shared, &msg).await;
        assert_eq!(shared.last_playhead.lock().as_deref(), Some("1.0 Intro"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handle_reply_ignores_unreplied_addresses() {
        let driver = test_driver();
        let shared = &driver.0;
        let msg = OscMessage::new("/cue/playhead/text", vec![OscArg::String("not a reply".to_string())]);
        Shared::handle_reply(shared, &msg).await;
        assert!(shared.last_playhead.lock().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queues_outbound_commands_while_disconnected() {
        let driver = test_driver();
        use crate::driver::Driver as _;
        driver.handle_osc("/go", &[]).await;
        assert!(!driver.0.replay.is_empty());
    }
}
