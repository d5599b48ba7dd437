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

//! Wires the OSC listener, dispatcher, driver registry, fade engine, and cue
//! sequencer together into one running process, generalizing
//! `controller::Controller` (spawn a task, hand events to a single owner,
//! `join()` to block until exit) from a single-driver player controller into
//! a hub fanning events out across many concurrently running drivers.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::HubConfig;
use crate::cue::Sequencer;
use crate::dispatch::Dispatcher;
use crate::driver::{DriverEvent, Registry};
use crate::drivers::build_driver;
use crate::error::HubError;
use crate::fade::FadeEngine;
use crate::osc::listener::Listener;
use crate::osc::OscMessage;

const FADE_TICK_HZ: u32 = 50;

/// Owns every long-running task the hub starts: the OSC listener, the fade
/// tick forwarder, the cue-action forwarder, and the per-driver event relay.
/// `shutdown()` tears them down in the order the fade/cue state depends on:
/// stop firing new cues first, then cancel in-flight fades, then disconnect
/// the drivers those fades and cues were talking to.
pub struct Hub {
    registry: Arc<Registry>,
    fade_engine: Arc<FadeEngine>,
    sequencer: Arc<Sequencer>,
    tasks: Vec<JoinHandle<()>>,
}

impl Hub {
    pub async fn start(config: HubConfig) -> Result<Self, HubError> {
        let registry = Arc::new(Registry::new());
        let (fade_engine, fade_ticks) = FadeEngine::start(FADE_TICK_HZ);
        let (driver_events_tx, driver_events_rx) = mpsc::channel(256);

        for device in &config.devices {
            let driver = build_driver(device, fade_engine.clone(), driver_events_tx.clone());
            registry.add(driver)?;
        }

        let (action_tx, action_rx) = mpsc::channel::<OscMessage>(256);
        let sequencer = Sequencer::new(action_tx);
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), fade_engine.clone(), sequencer.clone()));

        let listener = Listener::new(config.listen, config.reply_port);
        let (listener_handle, mut inbound_rx, outbound_tx) = listener
            .start()
            .await
            .map_err(|e| HubError::Transport(e.to_string()))?;

        registry.connect_all().await;

        let mut tasks = vec![listener_handle];

        let listen_dispatcher = dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            while let Some((message, sender)) = inbound_rx.recv().await {
                info!(address = %message.addr, %sender, "osc inbound");
                listen_dispatcher.dispatch(message).await;
            }
        }));

        let cue_dispatcher = dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            let mut action_rx = action_rx;
            while let Some(message) = action_rx.recv().await {
                cue_dispatcher.dispatch(message).await;
            }
        }));

        let fade_registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            let mut fade_ticks = fade_ticks;
            while let Some((key, value)) = fade_ticks.recv().await {
                fade_registry.route_fade_tick(&key, value).await;
            }
        }));

        tasks.push(tokio::spawn(Self::relay_driver_events(driver_events_rx, outbound_tx)));

        Ok(Self {
            registry,
            fade_engine,
            sequencer,
            tasks,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    /// Relays a driver's connection lifecycle to the logs and its feedback
    /// events back out to upstream clients, prefixing each feedback address
    /// with the owning driver's prefix (the `§4.11` contract).
    async fn relay_driver_events(
        mut driver_events_rx: mpsc::Receiver<(String, DriverEvent)>,
        outbound_tx: mpsc::Sender<OscMessage>,
    ) {
        while let Some((prefix, event)) = driver_events_rx.recv().await {
            match event {
                DriverEvent::Connected => info!(driver_prefix = %prefix, "driver connected"),
                DriverEvent::Disconnected => warn!(driver_prefix = %prefix, "driver disconnected"),
                DriverEvent::Error(message) => warn!(driver_prefix = %prefix, error = %message, "driver error"),
                DriverEvent::Feedback(address, args) => {
                    let full_address = format!("{}{}", prefix, address);
                    if outbound_tx.send(OscMessage::new(full_address, args)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Stops the sequencer (no more cues fire), cancels every in-flight
    /// fade, then disconnects every driver, in that order, so nothing keeps
    /// issuing commands to a driver that's already gone.
    pub async fn shutdown(&self) {
        self.sequencer.shutdown();
        self.fade_engine.cancel_all().await;
        self.registry.disconnect_all().await;
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Blocks until every background task this hub owns has exited, e.g.
    /// after `shutdown()` has aborted them.
    pub async fn join(mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(err = %e, "hub task panicked");
                }
            }
        }
    }
}
