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

//! The driver contract every device backend implements, generalized from
//! `controller::Driver` (`monitor_events(&self, events_tx) -> JoinHandle`)
//! into a bidirectional contract: drivers both accept commands (OSC, fade
//! ticks) and emit events (connect/disconnect/error/feedback) on a shared
//! channel owned by the hub.

pub mod health;
pub mod reconnect;
pub mod registry;

use async_trait::async_trait;
use std::time::SystemTime;

use crate::error::HubError;
use crate::osc::OscArg;

pub use health::{Backoff, ConnectionState, Heartbeat};
pub use reconnect::ReplayBuffer;
pub use registry::Registry;

/// A snapshot of a driver's connection health, the fields §3 assigns to a
/// driver's statistics, exposed via `Registry::snapshot()`.
#[derive(Debug, Clone)]
pub struct DriverStats {
    pub state: ConnectionState,
    pub reconnect_count: u32,
    pub last_connected: Option<SystemTime>,
    pub last_error: Option<(String, SystemTime)>,
}

impl Default for DriverStats {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_count: 0,
            last_connected: None,
            last_error: None,
        }
    }
}

/// Event notifications a driver raises for the hub to relay (feedback) or
/// record (connection lifecycle).
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Connected,
    Disconnected,
    Error(String),
    /// An address relative to the driver's own prefix, plus its arguments.
    /// The feedback relay (owned by the hub) prefixes it before it goes back
    /// out to upstream clients.
    Feedback(String, Vec<OscArg>),
}

/// The contract every device backend implements. Trait object safe so the
/// registry can hold a homogeneous `Vec<Arc<dyn Driver>>` across wildly
/// different wire protocols, the way `controller::multi::Driver` holds a
/// heterogeneous `Vec<SubDriver>`.
#[async_trait]
pub trait Driver: Send + Sync {
    /// A stable, human-readable identifier (used in fade keys, logs, and
    /// the registry's name lookup).
    fn name(&self) -> &str;

    /// The OSC address prefix this driver owns, e.g. `/avantis`.
    fn prefix(&self) -> &str;

    async fn connect(&self) -> Result<(), HubError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;

    /// Handles an OSC message whose address has already had this driver's
    /// prefix stripped.
    async fn handle_osc(&self, address: &str, args: &[OscArg]);

    /// Handles a fade engine tick for one of this driver's own tracked
    /// parameter keys (the driver-local part of `"<name>:<local-key>"`).
    async fn handle_fade_tick(&self, local_key: &str, value: f32);

    /// Offered an unprefixed incoming OSC address as a feedback-parsing
    /// fallback (resolution step 4). Returns `true` if this driver claimed
    /// and handled it.
    async fn handle_feedback(&self, _raw_address: &str, _args: &[OscArg]) -> bool {
        false
    }

    fn stats(&self) -> DriverStats;
}
