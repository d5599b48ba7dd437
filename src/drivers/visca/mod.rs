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

//! The PTZ camera driver: VISCA command bytes over either a raw TCP socket
//! or VISCA-over-IP UDP framing. Shares the `Arc<Shared>` shape with the
//! Avantis driver so the TCP variant's connect/reconnect loop can spawn
//! background tasks without needing `Arc<Self>` on the trait object.

pub mod codec;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;

use crate::config::ViscaTransport;
use crate::driver::{Backoff, ConnectionState, DriverEvent, DriverStats, ReplayBuffer};
use crate::error::HubError;
use crate::osc::OscArg;

enum Transport {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    Udp(UdpSocket, AtomicU32),
}

struct PanTiltRegister {
    pan: f32,
    tilt: f32,
}

struct Shared {
    name: String,
    prefix: String,
    host: String,
    port: u16,
    camera_address: u8,
    events_tx: mpsc::Sender<(String, DriverEvent)>,
    replay: ReplayBuffer,
    backoff: Backoff,
    state: SyncMutex<ConnectionState>,
    stats: SyncMutex<DriverStats>,
    transport_kind: ViscaTransport,
    transport: AsyncMutex<Option<Transport>>,
    pan_tilt: RwLock<PanTiltRegister>,
}

pub struct Driver(Arc<Shared>);

impl Driver {
    pub fn new(
        prefix: String,
        host: String,
        port: u16,
        transport: ViscaTransport,
        camera_address: u8,
        events_tx: mpsc::Sender<(String, DriverEvent)>,
    ) -> Self {
        Driver(Arc::new(Shared {
            name: format!("visca{prefix}"),
            prefix,
            host,
            port,
            camera_address,
            events_tx,
            replay: ReplayBuffer::default(),
            backoff: Backoff::default(),
            state: SyncMutex::new(ConnectionState::Disconnected),
            stats: SyncMutex::new(DriverStats::default()),
            transport_kind: transport,
            transport: AsyncMutex::new(None),
            pan_tilt: RwLock::new(PanTiltRegister { pan: 0.0, tilt: 0.0 }),
        }))
    }
}

impl Shared {
    fn record_error(&self, message: String) {
        self.stats.lock().last_error = Some((message, SystemTime::now()));
    }

    async fn connect(shared: Arc<Shared>) -> Result<(), HubError> {
        *shared.state.lock() = ConnectionState::Connecting;
        let addr = format!("{}:{}", shared.host, shared.port);
        let result: Result<Transport, HubError> = match shared.transport_kind {
            ViscaTransport::Tcp => TcpStream::connect(&addr)
                .await
                .map(|stream| {
                    let (_read, write) = stream.into_split();
                    Transport::Tcp(write)
                })
                .map_err(|e| HubError::Transport(e.to_string())),
            ViscaTransport::Udp => async {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .map_err(|e| HubError::Transport(e.to_string()))?;
                socket
                    .connect(&addr)
                    .await
                    .map_err(|e| HubError::Transport(e.to_string()))?;
                Ok(Transport::Udp(socket, AtomicU32::new(0)))
            }
            .await,
        };

        match result {
            Ok(transport) => {
                *shared.transport.lock().await = Some(transport);
                *shared.state.lock() = ConnectionState::Connected;
                shared.stats.lock().last_connected = Some(SystemTime::now());
                shared.backoff.reset();
                let _ = shared
                    .events_tx
                    .send((shared.prefix.clone(), DriverEvent::Connected))
                    .await;
                Self::drain_replay(&shared).await;
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

    async fn drain_replay(shared: &Arc<Shared>) {
        for (address, args) in shared.replay.drain() {
            Self::apply_osc(shared, &address, &args).await;
        }
    }

    async fn write_command(&self, bytes: Vec<u8>) {
        let mut guard = self.transport.lock().await;
        let Some(transport) = guard.as_mut() else {
            return;
        };
        match transport {
            Transport::Tcp(write) => {
                if let Err(e) = write.write_all(&bytes).await {
                    warn!(err = %e, driver = %self.name, "visca tcp write failed");
                }
            }
            Transport::Udp(socket, sequence) => {
                let seq = sequence.fetch_add(1, Ordering::SeqCst);
                let mut framed = Vec::with_capacity(8 + bytes.len());
                framed.extend_from_slice(&[0x01, 0x00]);
                framed.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                framed.extend_from_slice(&seq.to_be_bytes());
                framed.extend_from_slice(&bytes);
                if let Err(e) = socket.send(&framed).await {
                    warn!(err = %e, driver = %self.name, "visca udp send failed");
                }
            }
        }
    }

    async fn apply_osc(shared: &Arc<Shared>, address: &str, args: &[OscArg]) {
        if let Err(e) = Self::apply_osc_inner(shared, address, args).await {
            warn!(err = %e, driver = %shared.name, address, "visca: rejected command");
        }
    }

    async fn apply_osc_inner(shared: &Arc<Shared>, address: &str, args: &[OscArg]) -> Result<(), HubError> {
        let address = address.trim_end_matches('/').to_ascii_lowercase();
        let segments: Vec<&str> = address.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect();
        let cam = shared.camera_address;

        let bytes = match segments.as_slice() {
            ["home"] => codec::home(cam),
            ["preset", "recall", n] => {
                let preset: i32 = n.parse().map_err(|_| HubError::OutOfRange(format!("invalid preset {n}")))?;
                codec::preset_recall(cam, preset)?
            }
            ["preset", "store", n] => {
                let preset: i32 = n.parse().map_err(|_| HubError::OutOfRange(format!("invalid preset {n}")))?;
                codec::preset_store(cam, preset)?
            }
            ["power", "on"] => codec::power(cam, true),
            ["power", "off"] => codec::power(cam, false),
            ["focus", "auto"] => codec::focus(cam, true),
            ["focus", "manual"] => codec::focus(cam, false),
            ["pantilt", "stop"] => {
                let mut reg = shared.pan_tilt.write();
                reg.pan = 0.0;
                reg.tilt = 0.0;
                codec::pantilt_stop(cam)
            }
            ["pantilt", "speed"] => {
                let pan = args.first().and_then(|a| a.as_f32()).unwrap_or(0.0);
                let tilt = args.get(1).and_then(|a| a.as_f32()).unwrap_or(0.0);
                let mut reg = shared.pan_tilt.write();
                reg.pan = pan;
                reg.tilt = tilt;
                codec::pantilt_speed(cam, pan, tilt)
            }
            ["pan", "speed"] => {
                let pan = args.first().and_then(|a| a.as_f32()).unwrap_or(0.0);
                let mut reg = shared.pan_tilt.write();
                reg.pan = pan;
                codec::pantilt_speed(cam, reg.pan, reg.tilt)
            }
            ["tilt", "speed"] => {
                let tilt = args.first().and_then(|a| a.as_f32()).unwrap_or(0.0);
                let mut reg = shared.pan_tilt.write();
                reg.tilt = tilt;
                codec::pantilt_speed(cam, reg.pan, reg.tilt)
            }
            ["zoom", "speed"] => {
                let speed = args
                    .first()
                    .and_then(|a| a.as_f32())
                    .ok_or_else(|| HubError::OutOfRange("zoom/speed requires a numeric arg".into()))?;
                codec::zoom_speed(cam, speed)
            }
            ["zoom", "direct"] => {
                let position = args
                    .first()
                    .and_then(|a| a.as_f32())
                    .ok_or_else(|| HubError::OutOfRange("zoom/direct requires a numeric arg".into()))?;
                codec::zoom_direct(cam, position)
            }
            _ => return Err(HubError::UnknownPrefix(address.to_string())),
        };

        shared.write_command(bytes).await;
        Ok(())
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
        *self.0.transport.lock().await = None;
        *self.0.state.lock() = ConnectionState::Disconnected;
    }

    fn is_connected(&self) -> bool {
        matches!(*self.0.state.lock(), ConnectionState::Connected)
    }

    async fn handle_osc(&self, address: &str, args: &[OscArg]) {
        if !self.is_connected() {
            self.0.replay.push(address.to_string(), args.to_vec());
            return;
        }
        Shared::apply_osc(&self.0, address, args).await;
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
            "/ptz1".into(),
            "127.0.0.1".into(),
            0,
            ViscaTransport::Tcp,
            1,
            events_tx,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_a_preset_number_outside_valid_range_without_transmitting() {
        let driver = test_driver();
        let err = Shared::apply_osc_inner(&driver.0, "/preset/recall/200", &[]).await;
        assert!(err.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn address_matching_is_case_insensitive_and_ignores_trailing_slashes() {
        let driver = test_driver();
        assert!(Shared::apply_osc_inner(&driver.0, "/HOME/", &[]).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn individual_pan_speed_keeps_the_last_known_tilt_speed() {
        let driver = test_driver();
        Shared::apply_osc_inner(&driver.0, "/pantilt/speed", &[OscArg::Float(0.5), OscArg::Float(-0.5)])
            .await
            .unwrap();
        Shared::apply_osc_inner(&driver.0, "/pan/speed", &[OscArg::Float(1.0)])
            .await
            .unwrap();
        let reg = driver.0.pan_tilt.read();
        assert_eq!(reg.pan, 1.0);
        assert_eq!(reg.tilt, -0.5);
    }
}
