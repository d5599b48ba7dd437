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

//! The OBS Studio driver: obs-websocket v5 over `tokio-tungstenite`, with the
//! Hello/Identify/Identified handshake, async request/response correlation
//! keyed by request id, and event-to-OSC-feedback translation. Shaped after
//! `obws`'s `Client` (split writer/reader, a background read task, a
//! `HashMap` of outstanding oneshot resolvers) generalized from its v4
//! message-id frames to v5 opcodes.

pub mod protocol;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use self::protocol::{EventData, Frame, HelloData, RequestResponseData, OP_EVENT, OP_HELLO, OP_IDENTIFIED, OP_REQUEST_RESPONSE};

use crate::config::{HeartbeatConfig, ReconnectConfig};
use crate::driver::{Backoff, ConnectionState, DriverEvent, DriverStats, Heartbeat, ReplayBuffer};
use crate::error::HubError;
use crate::osc::OscArg;

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct Shared {
    name: String,
    prefix: String,
    host: String,
    port: u16,
    password: Option<String>,
    events_tx: mpsc::Sender<(String, DriverEvent)>,
    replay: ReplayBuffer,
    backoff: Backoff,
    heartbeat_interval: Option<Duration>,
    heartbeat: Arc<Heartbeat>,
    state: SyncMutex<ConnectionState>,
    stats: SyncMutex<DriverStats>,
    write: AsyncMutex<Option<WsWriter>>,
    id_counter: AtomicU64,
    pending: DashMap<String, oneshot::Sender<Value>>,
}

pub struct Driver(Arc<Shared>);

impl Driver {
    pub fn new(
        prefix: String,
        host: String,
        port: u16,
        password: Option<String>,
        reconnect: ReconnectConfig,
        heartbeat: HeartbeatConfig,
        events_tx: mpsc::Sender<(String, DriverEvent)>,
    ) -> Self {
        Driver(Arc::new(Shared {
            name: format!("obs{prefix}"),
            prefix,
            host,
            port,
            password,
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
            write: AsyncMutex::new(None),
            id_counter: AtomicU64::new(1),
            pending: DashMap::new(),
        }))
    }
}

impl Shared {
    fn record_error(&self, message: String) {
        self.stats.lock().last_error = Some((message, SystemTime::now()));
    }

    async fn write_raw(&self, text: String) -> Result<(), HubError> {
        let mut guard = self.write.lock().await;
        match guard.as_mut() {
            Some(write) => write
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| HubError::Transport(e.to_string())),
            None => Err(HubError::Transport("obs socket not connected".into())),
        }
    }

    async fn connect(shared: Arc<Shared>) -> Result<(), HubError> {
        *shared.state.lock() = ConnectionState::Connecting;
        let url = format!("ws://{}:{}", shared.host, shared.port);
        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _response)) => {
                let (write, read) = stream.split();
                *shared.write.lock().await = Some(write);
                let (ready_tx, ready_rx) = oneshot::channel();
                tokio::spawn(Self::read_loop(shared.clone(), read, Some(ready_tx)));
                match tokio::time::timeout(Duration::from_secs(5), ready_rx).await {
                    Ok(Ok(Ok(()))) => Ok(()),
                    Ok(Ok(Err(e))) => Err(e),
                    _ => Err(HubError::Transport("obs identify handshake timed out".into())),
                }
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

    async fn read_loop(shared: Arc<Shared>, mut read: WsReader, mut ready: Option<oneshot::Sender<Result<(), HubError>>>) {
        while let Some(msg) = read.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    shared.record_error(e.to_string());
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            if !msg.is_text() {
                continue;
            }
            let text = match msg.into_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!(err = %e, driver = %shared.name, "obs: non-utf8 frame");
                    continue;
                }
            };
            let frame: Frame = match serde_json::from_str(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(err = %e, driver = %shared.name, "obs: malformed frame");
                    continue;
                }
            };
            shared.heartbeat.touch();
            Self::handle_frame(&shared, frame, &mut ready).await;
        }
        shared.heartbeat.stop();
        *shared.state.lock() = ConnectionState::Disconnected;
        if let Some(tx) = ready.take() {
            let _ = tx.send(Err(HubError::Transport("obs socket closed before identify".into())));
        }
        let _ = shared
            .events_tx
            .send((shared.prefix.clone(), DriverEvent::Disconnected))
            .await;
        Self::schedule_reconnect(shared);
    }

    async fn handle_frame(shared: &Arc<Shared>, frame: Frame, ready: &mut Option<oneshot::Sender<Result<(), HubError>>>) {
        match frame.op {
            OP_HELLO => {
                let hello: HelloData = match serde_json::from_value(frame.d) {
                    Ok(hello) => hello,
                    Err(e) => {
                        warn!(err = %e, driver = %shared.name, "obs: malformed Hello");
                        return;
                    }
                };
                let identify = protocol::encode_identify(shared.password.as_deref(), &hello);
                if let Err(e) = shared.write_raw(identify).await {
                    warn!(err = %e, driver = %shared.name, "obs: failed to send Identify");
                }
            }
            OP_IDENTIFIED => {
                *shared.state.lock() = ConnectionState::Connected;
                shared.stats.lock().last_connected = Some(SystemTime::now());
                shared.backoff.reset();
                let _ = shared
                    .events_tx
                    .send((shared.prefix.clone(), DriverEvent::Connected))
                    .await;
                Self::drain_replay(shared).await;
                if let Some(interval) = shared.heartbeat_interval {
                    let armed = shared.clone();
                    shared.heartbeat.spawn(interval, move || {
                        let armed = armed.clone();
                        tokio::spawn(async move {
                            warn!(driver = %armed.name, "obs heartbeat timed out, forcing reconnect");
                            *armed.write.lock().await = None;
                            *armed.state.lock() = ConnectionState::Disconnected;
                            let _ = armed.events_tx.send((armed.prefix.clone(), DriverEvent::Disconnected)).await;
                            Self::schedule_reconnect(armed);
                        });
                    });
                }
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            OP_EVENT => {
                if let Ok(event) = serde_json::from_value::<EventData>(frame.d) {
                    if let Some((address, args)) = translate_event(&event) {
                        let _ = shared
                            .events_tx
                            .send((shared.prefix.clone(), DriverEvent::Feedback(address, args)))
                            .await;
                    }
                }
            }
            OP_REQUEST_RESPONSE => {
                if let Ok(resp) = serde_json::from_value::<RequestResponseData>(frame.d) {
                    if let Some((_, tx)) = shared.pending.remove(&resp.request_id) {
                        let _ = tx.send(resp.response_data.unwrap_or(Value::Null));
                    }
                }
            }
            _ => {}
        }
    }

    async fn request(shared: &Arc<Shared>, request_type: &str, data: Option<Value>) -> Result<Value, HubError> {
        let id = shared.id_counter.fetch_add(1, Ordering::SeqCst);
        let key = id.to_string();
        let (tx, rx) = oneshot::channel();
        shared.pending.insert(key.clone(), tx);
        let json = protocol::encode_request(request_type, id, data);
        if let Err(e) = shared.write_raw(json).await {
            shared.pending.remove(&key);
            return Err(e);
        }
        match tokio::time::timeout(Duration::from_secs(5), rx).await {
            Ok(Ok(value)) => Ok(value),
            _ => {
                shared.pending.remove(&key);
                Err(HubError::Transport(format!("obs request {request_type} timed out")))
            }
        }
    }

    async fn apply_osc(shared: &Arc<Shared>, address: &str, args: &[OscArg]) {
        if let Err(e) = Self::apply_osc_inner(shared, address, args).await {
            warn!(err = %e, driver = %shared.name, address, "obs: rejected command");
        }
    }

    async fn apply_osc_inner(shared: &Arc<Shared>, address: &str, args: &[OscArg]) -> Result<(), HubError> {
        let segments: Vec<String> = address
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
            .collect();
        let refs: Vec<&str> = segments.iter().map(String::as_str).collect();

        match refs.as_slice() {
            ["scene", name] => {
                Self::request(shared, "SetCurrentProgramScene", Some(json!({ "sceneName": name }))).await?;
            }
            ["scene", "preview", name] => {
                Self::request(shared, "SetCurrentPreviewScene", Some(json!({ "sceneName": name }))).await?;
            }
            ["stream", op @ ("start" | "stop" | "toggle")] => {
                Self::request(shared, &format!("{}Stream", capitalize(op)), None).await?;
            }
            ["record", op @ ("start" | "stop" | "toggle")] => {
                Self::request(shared, &format!("{}Record", capitalize(op)), None).await?;
            }
            ["virtualcam", op @ ("start" | "stop")] => {
                Self::request(shared, &format!("{}VirtualCam", capitalize(op)), None).await?;
            }
            ["transition", "duration"] => {
                let ms = args
                    .first()
                    .and_then(|a| a.as_i32())
                    .ok_or_else(|| HubError::OutOfRange("transition/duration requires a numeric arg".into()))?;
                Self::request(
                    shared,
                    "SetCurrentSceneTransitionDuration",
                    Some(json!({ "transitionDuration": ms })),
                )
                .await?;
            }
            ["transition", name] => {
                Self::request(shared, "SetCurrentSceneTransition", Some(json!({ "transitionName": name }))).await?;
            }
            ["source", name, "visible"] => {
                let visible = args.first().and_then(|a| a.as_bool()).unwrap_or(true);
                Self::set_source_visible(shared, name, visible).await?;
            }
            _ => return Err(HubError::UnknownPrefix(address.to_string())),
        }
        Ok(())
    }

    async fn set_source_visible(shared: &Arc<Shared>, source_name: &str, visible: bool) -> Result<(), HubError> {
        let scene = Self::request(shared, "GetCurrentProgramScene", None).await?;
        let scene_name = scene
            .get("sceneName")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::Transport("GetCurrentProgramScene returned no sceneName".into()))?
            .to_string();
        let item = Self::request(
            shared,
            "GetSceneItemId",
            Some(json!({ "sceneName": scene_name, "sourceName": source_name })),
        )
        .await?;
        let scene_item_id = item
            .get("sceneItemId")
            .and_then(Value::as_i64)
            .ok_or_else(|| HubError::Transport("GetSceneItemId returned no sceneItemId".into()))?;
        Self::request(
            shared,
            "SetSceneItemEnabled",
            Some(json!({
                "sceneName": scene_name,
                "sceneItemId": scene_item_id,
                "sceneItemEnabled": visible,
            })),
        )
        .await?;
        Ok(())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

fn translate_event(event: &EventData) -> Option<(String, Vec<OscArg>)> {
    let data = event.event_data.as_ref();
    match event.event_type.as_str() {
        "CurrentProgramSceneChanged" => {
            let name = data?.get("sceneName")?.as_str()?.to_string();
            Some(("/scene/current".to_string(), vec![OscArg::String(name)]))
        }
        "StreamStateChanged" => {
            let active = data?.get("outputActive")?.as_bool()?;
            Some(("/stream/status".to_string(), vec![OscArg::Int(active as i32)]))
        }
        "RecordStateChanged" => {
            let active = data?.get("outputActive")?.as_bool()?;
            Some(("/record/status".to_string(), vec![OscArg::Int(active as i32)]))
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
        *self.0.write.lock().await = None;
        *self.0.state.lock() = ConnectionState::Disconnected;
    }

    fn is_connected(&self) -> bool {
        matches!(*self.0.state.lock(), ConnectionState::Connected)
    }

    async fn handle_osc(&self, address: &str, args: &[OscArg]) {
        if !self.is_connected() {
            self.0.replay.push(address.to_string(), args.to_vec());
            debug!(driver = %self.0.name, address, "obs disconnected, queued for replay");
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

    #[test]
    fn translate_event_maps_scene_changes_to_feedback() {
        let event = EventData {
            event_type: "CurrentProgramSceneChanged".to_string(),
            event_data: Some(json!({ "sceneName": "Intro" })),
        };
        let (address, args) = translate_event(&event).unwrap();
        assert_eq!(address, "/scene/current");
        assert_eq!(args, vec![OscArg::String("Intro".to_string())]);
    }

    #[test]
    fn translate_event_ignores_unmapped_events() {
        let event = EventData {
            event_type: "InputVolumeMeters".to_string(),
            event_data: None,
        };
        assert!(translate_event(&event).is_none());
    }

    #[test]
    fn capitalize_uppercases_only_the_first_letter() {
        assert_eq!(capitalize("start"), "Start");
        assert_eq!(capitalize("toggle"), "Toggle");
    }
}
