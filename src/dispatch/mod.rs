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

//! The dispatcher: every inbound OSC message passes through here and is
//! resolved in order — global addresses, hub commands, longest-prefix driver
//! routing, the unprefixed feedback fallback, then dropped.

pub mod prefix_table;

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cue::ingest;
use crate::cue::Sequencer;
use crate::driver::Registry;
use crate::fade::FadeEngine;
use crate::osc::{OscArg, OscMessage};

pub struct Dispatcher {
    registry: Arc<Registry>,
    fade_engine: Arc<FadeEngine>,
    sequencer: Arc<Sequencer>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, fade_engine: Arc<FadeEngine>, sequencer: Arc<Sequencer>) -> Self {
        Self {
            registry,
            fade_engine,
            sequencer,
        }
    }

    pub async fn dispatch(&self, message: OscMessage) {
        let addr = message.addr.as_str();

        if addr == "/fade/stop" || addr.starts_with("/fade/stop/") {
            self.handle_fade_stop(addr, &message.args).await;
            return;
        }

        if addr == "/system/check" {
            debug!("systems check requested; handled by an external collaborator");
            return;
        }

        if let Some(rest) = addr.strip_prefix("/hub/") {
            self.dispatch_hub(rest, &message.args).await;
            return;
        }

        if let Some((driver, relative)) = self.registry.prefix_table().resolve(addr) {
            driver.handle_osc(&relative, &message.args).await;
            return;
        }

        for driver in self.registry.drivers() {
            if driver.handle_feedback(addr, &message.args).await {
                return;
            }
        }

        info!(address = addr, "unroutable OSC address, dropping");
    }

    async fn handle_fade_stop(&self, addr: &str, args: &[OscArg]) {
        let key = args
            .first()
            .and_then(|a| a.as_str())
            .map(|s| s.to_string())
            .or_else(|| addr.strip_prefix("/fade/stop/").map(|s| s.to_string()));
        match key {
            Some(key) => self.fade_engine.cancel_fade(key, true).await,
            None => self.fade_engine.cancel_all().await,
        }
    }

    async fn dispatch_hub(&self, rest: &str, args: &[OscArg]) {
        match rest {
            "go" => self.sequencer.go().await,
            "back" => self.sequencer.back(),
            "stop" => self.sequencer.stop(),
            "shutdown" => self.sequencer.shutdown(),
            "status" => {
                for (name, prefix, stats) in self.registry.snapshot() {
                    info!(driver = name, prefix, state = ?stats.state, reconnects = stats.reconnect_count, "hub status");
                }
            }
            rest if rest.starts_with("go/") => {
                self.sequencer.go_cue(&rest[3..]).await;
            }
            "cuelist/load" => match args.first().and_then(|a| a.as_str()) {
                Some(path) => match ingest::load_cue_list(std::path::Path::new(path)) {
                    Ok(list) => self.sequencer.load(list).await,
                    Err(e) => warn!(err = %e, path, "failed to load cue list"),
                },
                None => warn!("/hub/cuelist/load requires a path argument"),
            },
            other => info!(hub_command = other, "unknown hub command, dropping"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::{Driver, DriverStats};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingDriver {
        prefix: String,
        received: Mutex<Vec<(String, Vec<OscArg>)>>,
    }

    #[async_trait]
    impl Driver for RecordingDriver {
        fn name(&self) -> &str {
            &self.prefix
        }
        fn prefix(&self) -> &str {
            &self.prefix
        }
        async fn connect(&self) -> Result<(), crate::error::HubError> {
            Ok(())
        }
        async fn disconnect(&self) {}
        fn is_connected(&self) -> bool {
            true
        }
        async fn handle_osc(&self, address: &str, args: &[OscArg]) {
            self.received.lock().push((address.to_string(), args.to_vec()));
        }
        async fn handle_fade_tick(&self, _local_key: &str, _value: f32) {}
        fn stats(&self) -> DriverStats {
            DriverStats::default()
        }
    }

    fn dispatcher_with(driver: Arc<RecordingDriver>) -> (Dispatcher, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        registry.add(driver).unwrap();
        let (fade_engine, _ticks) = FadeEngine::start(50);
        let (action_tx, _action_rx) = tokio::sync::mpsc::channel(8);
        let sequencer = Sequencer::new(action_tx);
        (
            Dispatcher::new(registry.clone(), fade_engine, sequencer),
            registry,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn routes_to_the_longest_matching_prefix() {
        let short = Arc::new(RecordingDriver {
            prefix: "/avantis".into(),
            received: Mutex::new(vec![]),
        });
        let long = Arc::new(RecordingDriver {
            prefix: "/avantis/extra".into(),
            received: Mutex::new(vec![]),
        });
        let registry = Arc::new(Registry::new());
        registry.add(short.clone()).unwrap();
        registry.add(long.clone()).unwrap();
        let (fade_engine, _ticks) = FadeEngine::start(50);
        let (action_tx, _action_rx) = tokio::sync::mpsc::channel(8);
        let sequencer = Sequencer::new(action_tx);
        let dispatcher = Dispatcher::new(registry, fade_engine, sequencer);

        dispatcher
            .dispatch(OscMessage::new("/avantis/extra/thing", vec![]))
            .await;

        assert_eq!(long.received.lock().len(), 1);
        assert_eq!(short.received.lock().len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn does_not_match_a_prefix_without_a_path_separator() {
        let driver = Arc::new(RecordingDriver {
            prefix: "/avantis".into(),
            received: Mutex::new(vec![]),
        });
        let (dispatcher, _registry) = dispatcher_with(driver.clone());
        dispatcher
            .dispatch(OscMessage::new("/avantistest/foo", vec![]))
            .await;
        assert!(driver.received.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fade_stop_with_no_key_cancels_everything() {
        let (dispatcher, _registry) = dispatcher_with(Arc::new(RecordingDriver {
            prefix: "/avantis".into(),
            received: Mutex::new(vec![]),
        }));
        dispatcher.dispatch(OscMessage::new("/fade/stop", vec![])).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
