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

//! The Allen & Heath Avantis driver: raw MIDI over a TCP socket. Shared
//! mutable state lives behind a single `Arc<Shared>` so spawned read/
//! reconnect tasks can hold their own clone without needing `Arc<Self>` on
//! the trait object itself — the same shape as `controller::osc::Driver`
//! cloning `self.player` into its spawned tasks.

pub mod midi_codec;
pub mod parser;
pub mod strip;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use self::midi_codec::{build_fader, build_mute, build_pan, build_scene_recall, float_to_midi7, midi7_to_float};
use self::parser::{MidiEvent, MidiStreamParser};
use self::strip::{reverse_resolve_strip, resolve_strip, StripType};

use crate::config::{FeedbackConfig, HeartbeatConfig, ReconnectConfig};
use crate::driver::{Backoff, ConnectionState, DriverEvent, DriverStats, Heartbeat, ReplayBuffer};
use crate::error::HubError;
use crate::fade::{Easing, FadeEngine};
use crate::osc::OscArg;

struct Shared {
    name: String,
    prefix: String,
    host: String,
    port: u16,
    base_channel: u8,
    echo_suppression: Duration,
    fade_engine: Arc<FadeEngine>,
    events_tx: mpsc::Sender<(String, DriverEvent)>,
    replay: ReplayBuffer,
    backoff: Backoff,
    heartbeat_interval: Option<Duration>,
    heartbeat: Arc<Heartbeat>,
    state: Mutex<ConnectionState>,
    stats: Mutex<DriverStats>,
    write_half: AsyncMutex<Option<OwnedWriteHalf>>,
    echo_times: DashMap<String, Instant>,
    last_sent_7bit: DashMap<String, u8>,
}

pub struct Driver(Arc<Shared>);

impl Driver {
    pub fn new(
        prefix: String,
        host: String,
        port: u16,
        base_channel: u8,
        feedback: FeedbackConfig,
        reconnect: ReconnectConfig,
        heartbeat: HeartbeatConfig,
        fade_engine: Arc<FadeEngine>,
        events_tx: mpsc::Sender<(String, DriverEvent)>,
    ) -> Self {
        Driver(Arc::new(Shared {
            name: format!("avantis{prefix}"),
            prefix,
            host,
            port,
            base_channel,
            echo_suppression: Duration::from_millis(feedback.echo_suppression_ms),
            fade_engine,
            events_tx,
            replay: ReplayBuffer::default(),
            backoff: Backoff::new(
                Duration::from_millis(reconnect.initial_backoff_ms),
                Duration::from_millis(reconnect.max_backoff_ms),
            ),
            heartbeat_interval: heartbeat.enabled.then(|| Duration::from_millis(heartbeat.interval_ms)),
            heartbeat: Heartbeat::new(),
            state: Mutex::new(ConnectionState::Disconnected),
            stats: Mutex::new(DriverStats::default()),
            write_half: AsyncMutex::new(None),
            echo_times: DashMap::new(),
            last_sent_7bit: DashMap::new(),
        }))
    }
}

impl Shared {
    fn note_echo(&self, key: &str) {
        self.echo_times.insert(key.to_string(), Instant::now());
    }

    fn is_echo(&self, key: &str) -> bool {
        self.echo_times
            .get(key)
            .map(|t| t.elapsed() < self.echo_suppression)
            .unwrap_or(false)
    }

    async fn write(&self, bytes: &[u8]) {
        let mut guard = self.write_half.lock().await;
        if let Some(write_half) = guard.as_mut() {
            if let Err(e) = write_half.write_all(bytes).await {
                warn!(err = %e, driver = %self.name, "avantis write failed");
            }
        }
    }

    fn record_error(&self, message: String) {
        let mut stats = self.stats.lock();
        stats.last_error = Some((message, SystemTime::now()));
    }

    async fn connect(shared: Arc<Shared>) -> Result<(), HubError> {
        *shared.state.lock() = ConnectionState::Connecting;
        let addr = format!("{}:{}", shared.host, shared.port);
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                *shared.write_half.lock().await = Some(write_half);
                *shared.state.lock() = ConnectionState::Connected;
                shared.stats.lock().last_connected = Some(SystemTime::now());
                shared.backoff.reset();
                let _ = shared
                    .events_tx
                    .send((shared.prefix.clone(), DriverEvent::Connected))
                    .await;
                info!(driver = %shared.name, %addr, "avantis connected");
                Self::drain_replay(&shared).await;
                if let Some(interval) = shared.heartbeat_interval {
                    let armed = shared.clone();
                    shared.heartbeat.spawn(interval, move || {
                        let armed = armed.clone();
                        tokio::spawn(async move {
                            warn!(driver = %armed.name, "avantis heartbeat timed out, forcing reconnect");
                            *armed.write_half.lock().await = None;
                            *armed.state.lock() = ConnectionState::Disconnected;
                            let _ = armed.events_tx.send((armed.prefix.clone(), DriverEvent::Disconnected)).await;
                            Self::schedule_reconnect(armed);
                        });
                    });
                }
                tokio::spawn(Self::read_loop(shared.clone(), read_half));
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

    async fn read_loop(shared: Arc<Shared>, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let mut parser = MidiStreamParser::new();
        let mut buf = [0u8; 1024];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    shared.heartbeat.touch();
                    for event in parser.feed(&buf[..n]) {
                        Self::handle_inbound(&shared, event).await;
                    }
                }
                Err(e) => {
                    shared.record_error(e.to_string());
                    break;
                }
            }
        }
        shared.heartbeat.stop();
        *shared.state.lock() = ConnectionState::Disconnected;
        let _ = shared
            .events_tx
            .send((shared.prefix.clone(), DriverEvent::Disconnected))
            .await;
        Self::schedule_reconnect(shared);
    }

    async fn handle_inbound(shared: &Arc<Shared>, event: MidiEvent) {
        match event {
            MidiEvent::Nrpn {
                channel,
                param_msb,
                param_lsb,
                value,
            } => Self::handle_inbound_nrpn(shared, channel, param_msb, param_lsb, value).await,
            MidiEvent::NoteOn { channel, note, velocity } => {
                Self::handle_inbound_mute(shared, channel, note, velocity).await
            }
            MidiEvent::ProgramChange { scene, .. } => Self::handle_inbound_scene(shared, scene).await,
        }
    }

    async fn handle_inbound_nrpn(shared: &Arc<Shared>, channel: u8, param_msb: u8, param_lsb: u8, value: u16) {
        let Some((strip, number)) = reverse_resolve_strip(channel, param_msb, shared.base_channel) else {
            return;
        };
        let param = match param_lsb {
            0x17 => "fader",
            0x18 => "pan",
            _ => return,
        };
        // The console only ever drives the data-entry MSB (see
        // `midi_codec::build_nrpn`), so feedback carries the same 7 bits of
        // resolution: recover them from the top of the assembled 14-bit value.
        let quant = (value >> 7) as u8;
        let value_f32 = midi7_to_float(quant);
        let key = format!("{}/{}/{}", strip.key_str(), number, param);
        if shared.is_echo(&key) {
            return;
        }
        if shared.last_sent_7bit.get(&key).map(|v| *v) == Some(quant) {
            return;
        }
        shared.fade_engine.set_current_value(&format!("{}:{}", shared.name, key), value_f32);
        let address = feedback_address(strip, number, param);
        let _ = shared
            .events_tx
            .send((
                shared.prefix.clone(),
                DriverEvent::Feedback(address, vec![OscArg::Float(value_f32)]),
            ))
            .await;
    }

    /// A Note-On's velocity carries mute state (`>= 0x40` muted, per spec
    /// §4.4); the trailing zero-velocity Note-On the console also emits as
    /// part of the same gesture is ignored here (it never resolves to a
    /// distinct mute state).
    async fn handle_inbound_mute(shared: &Arc<Shared>, channel: u8, note: u8, velocity: u8) {
        if velocity == 0 {
            return;
        }
        let Some((strip, number)) = reverse_resolve_strip(channel, note, shared.base_channel) else {
            return;
        };
        let muted = velocity >= 0x40;
        let key = format!("{}/{}/mute", strip.key_str(), number);
        if shared.is_echo(&key) {
            return;
        }
        let address = feedback_address(strip, number, "mute");
        let _ = shared
            .events_tx
            .send((shared.prefix.clone(), DriverEvent::Feedback(address, vec![OscArg::Bool(muted)])))
            .await;
    }

    async fn handle_inbound_scene(shared: &Arc<Shared>, scene: u32) {
        let key = "scene/current".to_string();
        if shared.is_echo(&key) {
            return;
        }
        let _ = shared
            .events_tx
            .send((
                shared.prefix.clone(),
                DriverEvent::Feedback("/scene/current".to_string(), vec![OscArg::Int(scene as i32)]),
            ))
            .await;
    }

    async fn apply_osc(shared: &Arc<Shared>, address: &str, args: &[OscArg]) {
        if let Err(e) = Self::apply_osc_inner(shared, address, args).await {
            warn!(err = %e, driver = %shared.name, address, "avantis: rejected command");
        }
    }

    async fn apply_osc_inner(shared: &Arc<Shared>, address: &str, args: &[OscArg]) -> Result<(), HubError> {
        let address = address.trim_end_matches('/');
        if address == "/scene/recall" {
            let scene = args
                .first()
                .and_then(|a| a.as_i32())
                .ok_or_else(|| HubError::OutOfRange("scene/recall requires a numeric arg".into()))?;
            let bytes = build_scene_recall(shared.base_channel, scene)?;
            shared.write(&bytes).await;
            shared.note_echo("scene/current");
            return Ok(());
        }

        let Some((strip, number, param)) = parse_strip_address(address) else {
            return Err(HubError::UnknownPrefix(address.to_string()));
        };
        let (channel, hex) = resolve_strip(strip, number, shared.base_channel)?;
        let key = format!("{}/{}/{}", strip.key_str(), number, param);

        match param.as_str() {
            "fader" => {
                let value = args
                    .first()
                    .and_then(|a| a.as_f32())
                    .ok_or_else(|| HubError::OutOfRange("fader requires a numeric arg".into()))?;
                Self::send_dedup(shared, &key, build_fader(channel, hex, value)).await;
                shared.note_echo(&key);
                shared.fade_engine.set_current_value(&format!("{}:{}", shared.name, key), value);
            }
            "pan" => {
                let value = args
                    .first()
                    .and_then(|a| a.as_f32())
                    .ok_or_else(|| HubError::OutOfRange("pan requires a numeric arg".into()))?;
                Self::send_dedup(shared, &key, build_pan(channel, hex, value)).await;
                shared.note_echo(&key);
                shared.fade_engine.set_current_value(&format!("{}:{}", shared.name, key), value);
            }
            "mute" => {
                let muted = args.first().and_then(|a| a.as_bool()).unwrap_or(false);
                shared.write(&build_mute(channel, hex, muted)).await;
                shared.note_echo(&key);
            }
            "fade" => {
                let target = args
                    .first()
                    .and_then(|a| a.as_f32())
                    .ok_or_else(|| HubError::OutOfRange("fade requires a target value".into()))?;
                let duration_s = args
                    .get(1)
                    .and_then(|a| a.as_f32())
                    .ok_or_else(|| HubError::OutOfRange("fade requires a duration in seconds".into()))?;
                let easing: Easing = args
                    .get(2)
                    .and_then(|a| a.as_str())
                    .map(|s| s.parse())
                    .transpose()?
                    .unwrap_or(Easing::Linear);
                let fade_key = format!("{}:{}", shared.name, key);
                let fallback = shared.fade_engine.get_current_value(&fade_key).unwrap_or(0.0);
                shared
                    .fade_engine
                    .start_fade(fade_key, target, Duration::from_secs_f32(duration_s), easing, fallback)
                    .await;
            }
            other => return Err(HubError::OutOfRange(format!("unsupported avantis param {other}"))),
        }
        Ok(())
    }

    async fn send_dedup(shared: &Arc<Shared>, key: &str, bytes: Vec<u8>) {
        shared.write(&bytes).await;
        if let Some(&last) = bytes.last() {
            shared.last_sent_7bit.insert(key.to_string(), last);
        }
    }

    async fn apply_tick(shared: &Arc<Shared>, local_key: &str, value: f32) {
        let parts: Vec<&str> = local_key.split('/').collect();
        let [strip_s, number_s, param] = parts[..] else {
            return;
        };
        let Some(strip) = StripType::from_key_str(strip_s) else {
            return;
        };
        let Ok(number) = number_s.parse::<u32>() else {
            return;
        };
        let Ok((channel, hex)) = resolve_strip(strip, number, shared.base_channel) else {
            return;
        };
        let quant = float_to_midi7(value);
        if shared.last_sent_7bit.get(local_key).map(|v| *v) == Some(quant) {
            return;
        }
        shared.last_sent_7bit.insert(local_key.to_string(), quant);
        let bytes = match param {
            "fader" => build_fader(channel, hex, value),
            "pan" => build_pan(channel, hex, value),
            _ => return,
        };
        shared.write(&bytes).await;
        shared.note_echo(local_key);
    }
}

fn strip_address_prefix(strip: StripType) -> &'static str {
    match strip {
        StripType::Input => "/ch",
        StripType::Group => "/group",
        StripType::Mix => "/mix",
        StripType::Matrix => "/matrix",
        StripType::FXSend => "/fxsend",
        StripType::FXReturn => "/fxreturn",
        StripType::Main => "/main",
        StripType::DCA => "/dca",
    }
}

/// Mirrors `parse_strip_address`'s grammar in reverse: `Main` carries no
/// strip number (`/main/mix/fader`) and `DCA` carries no `/mix/` segment
/// (`/dca/{n}/fader`), while every other strip type is `/{kind}/{n}/mix/{param}`.
fn feedback_address(strip: StripType, number: u32, param: &str) -> String {
    match strip {
        StripType::Main => format!("/main/mix/{param}"),
        StripType::DCA => format!("/dca/{number}/{param}"),
        _ => format!("{}/{number}/mix/{param}", strip_address_prefix(strip)),
    }
}

fn strip_type_from_osc_kind(kind: &str) -> Option<StripType> {
    match kind {
        "ch" => Some(StripType::Input),
        "group" => Some(StripType::Group),
        "mix" => Some(StripType::Mix),
        "matrix" => Some(StripType::Matrix),
        "fxsend" => Some(StripType::FXSend),
        "fxreturn" => Some(StripType::FXReturn),
        _ => None,
    }
}

fn parse_strip_address(address: &str) -> Option<(StripType, u32, String)> {
    let parts: Vec<&str> = address.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    match parts.as_slice() {
        ["main", "mix", param] => Some((StripType::Main, 1, param.to_string())),
        [kind, n, "mix", param] => {
            let strip = strip_type_from_osc_kind(kind)?;
            let number = n.parse().ok()?;
            Some((strip, number, param.to_string()))
        }
        ["dca", n, param] => {
            let number = n.parse().ok()?;
            Some((StripType::DCA, number, param.to_string()))
        }
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
        *self.0.write_half.lock().await = None;
        *self.0.state.lock() = ConnectionState::Disconnected;
    }

    fn is_connected(&self) -> bool {
        matches!(*self.0.state.lock(), ConnectionState::Connected)
    }

    async fn handle_osc(&self, address: &str, args: &[OscArg]) {
        if !self.is_connected() {
            self.0.replay.push(address.to_string(), args.to_vec());
            debug!(driver = %self.0.name, address, "avantis disconnected, queued for replay");
            return;
        }
        Shared::apply_osc(&self.0, address, args).await;
    }

    async fn handle_fade_tick(&self, local_key: &str, value: f32) {
        Shared::apply_tick(&self.0, local_key, value).await;
    }

    fn stats(&self) -> DriverStats {
        self.0.stats.lock().clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_driver() -> (Driver, mpsc::Receiver<(String, DriverEvent)>) {
        let (fade_engine, _ticks) = FadeEngine::start(50);
        let (events_tx, events_rx) = mpsc::channel(16);
        let driver = Driver::new(
            "/avantis".into(),
            "127.0.0.1".into(),
            0,
            0,
            FeedbackConfig::default(),
            ReconnectConfig::default(),
            HeartbeatConfig::default(),
            fade_engine,
            events_tx,
        );
        (driver, events_rx)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queues_commands_while_disconnected_for_replay() {
        let (driver, _events_rx) = test_driver();
        use crate::driver::Driver as _;
        driver
            .handle_osc("/ch/1/mix/fader", &[OscArg::Float(0.5)])
            .await;
        assert_eq!(self_replay_len(&driver), 1);
    }

    fn self_replay_len(driver: &Driver) -> usize {
        driver.0.replay.len()
    }

    #[test]
    fn parses_every_documented_address_shape() {
        assert_eq!(
            parse_strip_address("/ch/12/mix/fader"),
            Some((StripType::Input, 12, "fader".to_string()))
        );
        assert_eq!(
            parse_strip_address("/dca/3/fader"),
            Some((StripType::DCA, 3, "fader".to_string()))
        );
        assert_eq!(
            parse_strip_address("/main/mix/pan"),
            Some((StripType::Main, 1, "pan".to_string()))
        );
        assert_eq!(parse_strip_address("/nonsense"), None);
    }

    #[test]
    fn feedback_addresses_match_the_documented_shapes() {
        assert_eq!(feedback_address(StripType::Input, 1, "fader"), "/ch/1/mix/fader");
        assert_eq!(feedback_address(StripType::DCA, 3, "fader"), "/dca/3/fader");
        assert_eq!(feedback_address(StripType::Main, 1, "pan"), "/main/mix/pan");
    }
}
