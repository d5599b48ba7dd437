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

//! One submodule per device backend. Each implements `crate::driver::Driver`
//! and is constructed from its `config::DeviceConfig` variant by
//! `build_driver` below, generalizing `config::controller::Controller::driver`'s
//! config-to-driver match into this hub's device list.

pub mod avantis;
pub mod chamsys;
pub mod obs;
pub mod qlab;
pub mod touchdesigner;
pub mod visca;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::DeviceConfig;
use crate::driver::{Driver, DriverEvent};
use crate::fade::FadeEngine;

pub fn build_driver(
    config: &DeviceConfig,
    fade_engine: Arc<FadeEngine>,
    events_tx: mpsc::Sender<(String, DriverEvent)>,
) -> Arc<dyn Driver> {
    match config {
        DeviceConfig::Avantis {
            prefix,
            host,
            port,
            midi_base_channel,
            feedback,
            reconnect,
            heartbeat,
        } => Arc::new(avantis::Driver::new(
            prefix.clone(),
            host.clone(),
            *port,
            *midi_base_channel,
            *feedback,
            *reconnect,
            *heartbeat,
            fade_engine,
            events_tx,
        )),
        DeviceConfig::Chamsys {
            prefix,
            host,
            port,
            reconnect,
            heartbeat,
        } => Arc::new(chamsys::Driver::new(
            prefix.clone(),
            host.clone(),
            *port,
            *reconnect,
            *heartbeat,
            events_tx,
        )),
        DeviceConfig::Obs {
            prefix,
            host,
            port,
            password,
            reconnect,
            heartbeat,
        } => Arc::new(obs::Driver::new(
            prefix.clone(),
            host.clone(),
            *port,
            password.clone(),
            *reconnect,
            *heartbeat,
            events_tx,
        )),
        DeviceConfig::Visca {
            prefix,
            host,
            port,
            transport,
            camera_address,
        } => Arc::new(visca::Driver::new(
            prefix.clone(),
            host.clone(),
            *port,
            *transport,
            *camera_address,
            events_tx,
        )),
        DeviceConfig::Touchdesigner { prefix, host, port } => {
            Arc::new(touchdesigner::Driver::new(prefix.clone(), host.clone(), *port, events_tx))
        }
        DeviceConfig::Qlab {
            prefix,
            host,
            port,
            passcode,
            reconnect,
            heartbeat,
        } => Arc::new(qlab::Driver::new(
            prefix.clone(),
            host.clone(),
            *port,
            passcode.clone(),
            *reconnect,
            *heartbeat,
            events_tx,
        )),
    }
}
