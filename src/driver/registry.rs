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

//! Owns the set of configured drivers and keeps the dispatcher's prefix
//! table in sync with it. Generalizes `config::controller::Controller::driver`
//! (a single config-to-driver match) into a homogeneous collection scanned
//! by the dispatcher.

use std::sync::Arc;

use parking_lot::RwLock;

use super::{Driver, DriverStats};
use crate::dispatch::prefix_table::PrefixTable;
use crate::error::HubError;

pub struct Registry {
    drivers: RwLock<Vec<Arc<dyn Driver>>>,
    prefix_table: PrefixTable,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(Vec::new()),
            prefix_table: PrefixTable::new(),
        }
    }

    pub fn add(&self, driver: Arc<dyn Driver>) -> Result<(), HubError> {
        let lower = driver.prefix().to_lowercase();
        let mut drivers = self.drivers.write();
        if drivers.iter().any(|d| d.prefix().to_lowercase() == lower) {
            return Err(HubError::DuplicatePrefix(driver.prefix().to_string()));
        }
        drivers.push(driver);
        self.prefix_table.rebuild(&drivers);
        Ok(())
    }

    pub fn remove(&self, name: &str) {
        let mut drivers = self.drivers.write();
        drivers.retain(|d| d.name() != name);
        self.prefix_table.rebuild(&drivers);
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.read().iter().find(|d| d.name() == name).cloned()
    }

    pub fn drivers(&self) -> Vec<Arc<dyn Driver>> {
        self.drivers.read().clone()
    }

    pub fn prefix_table(&self) -> &PrefixTable {
        &self.prefix_table
    }

    pub async fn connect_all(&self) {
        for driver in self.drivers() {
            if let Err(e) = driver.connect().await {
                tracing::warn!(driver = driver.name(), err = %e, "initial connect failed, will retry in background");
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for driver in self.drivers() {
            driver.disconnect().await;
        }
    }

    /// Routes a fade-engine tick to the owning driver, splitting the
    /// `"<driver-name>:<local-key>"` fade key the engine hands back.
    pub async fn route_fade_tick(&self, key: &str, value: f32) {
        let Some((driver_name, local_key)) = key.split_once(':') else {
            tracing::warn!(key, "malformed fade key, expected '<driver>:<local-key>'");
            return;
        };
        match self.lookup_by_name(driver_name) {
            Some(driver) => driver.handle_fade_tick(local_key, value).await,
            None => tracing::debug!(driver_name, "fade tick for an unknown or removed driver"),
        }
    }

    pub fn snapshot(&self) -> Vec<(String, String, DriverStats)> {
        self.drivers()
            .iter()
            .map(|d| (d.name().to_string(), d.prefix().to_string(), d.stats()))
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
