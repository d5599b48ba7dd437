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

//! A transparent OSC-to-OSC UDP relay for TouchDesigner and similar
//! generic receivers: no reconnect state machine, no heartbeat (an
//! unconnected UDP socket never errors on send), and no feedback parsing.
//! The simplest driver in the registry, grounded on
//! `mdwn-mtrack/src/controller/osc.rs`'s send-side `UdpSocket::send_to`.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;

use crate::driver::{ConnectionState, DriverEvent, DriverStats};
use crate::error::HubError;
use crate::osc::{OscArg, OscMessage};

struct Shared {
    name: String,
    prefix: String,
    host: String,
    port: u16,
    events_tx: mpsc::Sender<(String, DriverEvent)>,
    state: SyncMutex<ConnectionState>,
    stats: SyncMutex<DriverStats>,
    socket: AsyncMutex<Option<UdpSocket>>,
}

pub struct Driver(Arc<Shared>);

impl Driver {
    pub fn new(prefix: String, host: String, port: u16, events_tx: mpsc::Sender<(String, DriverEvent)>) -> Self {
        Driver(Arc::new(Shared {
            name: format!("touchdesigner{prefix}"),
            prefix,
            host,
            port,
            events_tx,
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
        *self.0.state.lock() = ConnectionState::Connecting;
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| HubError::Transport(e.to_string()))?;
        socket
            .connect((self.0.host.as_str(), self.0.port))
            .await
            .map_err(|e| HubError::Transport(e.to_string()))?;
        *self.0.socket.lock().await = Some(socket);
        *self.0.state.lock() = ConnectionState::Connected;
        self.0.stats.lock().last_connected = Some(SystemTime::now());
        let _ = self
            .0
            .events_tx
            .send((self.0.prefix.clone(), DriverEvent::Connected))
            .await;
        Ok(())
    }

    async fn disconnect(&self) {
        *self.0.socket.lock().await = None;
        *self.0.state.lock() = ConnectionState::Disconnected;
    }

    fn is_connected(&self) -> bool {
        matches!(*self.0.state.lock(), ConnectionState::Connected)
    }

    async fn handle_osc(&self, address: &str, args: &[OscArg]) {
        let guard = self.0.socket.lock().await;
        let Some(socket) = guard.as_ref() else {
            return;
        };
        let message = OscMessage::new(address, args.to_vec());
        match message.encode() {
            Ok(bytes) => {
                if let Err(e) = socket.send(&bytes).await {
                    self.0.record_error(e.to_string());
                    warn!(driver = %self.0.name, err = %e, "touchdesigner relay send failed");
                }
            }
            Err(e) => warn!(driver = %self.0.name, err = %e, "touchdesigner: failed to encode relay message"),
        }
    }

    async fn handle_fade_tick(&self, _local_key: &str, _value: f32) {}

    fn stats(&self) -> DriverStats {
        self.0.stats.lock().clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::Driver as _;

    #[tokio::test(flavor = "multi_thread")]
    async fn relays_osc_verbatim_to_the_configured_target() {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let (events_tx, _rx) = mpsc::channel(16);
        let driver = Driver::new("/td".into(), target_addr.ip().to_string(), target_addr.port(), events_tx);
        driver.connect().await.unwrap();
        driver.handle_osc("/cook", &[OscArg::Int(1)]).await;

        let mut buf = [0u8; 1024];
        let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(1), target.recv_from(&mut buf))
            .await
            .expect("no datagram received")
            .unwrap();
        let decoded = OscMessage::decode(&buf[..n]).unwrap();
        assert_eq!(decoded, vec![OscMessage::new("/cook", vec![OscArg::Int(1)])]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drops_outbound_messages_silently_while_disconnected() {
        let (events_tx, _rx) = mpsc::channel(16);
        let driver = Driver::new("/td".into(), "127.0.0.1".into(), 65000, events_tx);
        driver.handle_osc("/cook", &[]).await;
        assert!(!driver.is_connected());
    }
}
