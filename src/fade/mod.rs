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

//! A single shared tick-loop scheduler that interpolates tracked parameter
//! values, generalized from the fixed-step `fade()` loop in the X32 fader
//! CLI (`target = start + (target - start) * fraction`, on a sleep-step
//! timer) into a persistent 50Hz scheduler driving any number of concurrent
//! fades keyed by an opaque string.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Easing {
    Linear,
    EaseIn,
    EaseOut,
    SCurve,
}

impl Easing {
    pub fn apply(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Easing::Linear => t,
            Easing::EaseIn => t * t,
            Easing::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
            Easing::SCurve => t * t * (3.0 - 2.0 * t),
        }
    }
}

impl std::str::FromStr for Easing {
    type Err = crate::error::HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Easing::Linear),
            "easein" => Ok(Easing::EaseIn),
            "easeout" => Ok(Easing::EaseOut),
            "scurve" => Ok(Easing::SCurve),
            other => Err(crate::error::HubError::OutOfRange(format!(
                "unknown easing curve: {other}"
            ))),
        }
    }
}

struct ActiveFade {
    start_value: f32,
    end_value: f32,
    start_time: Instant,
    duration: Duration,
    easing: Easing,
}

enum Command {
    Start {
        key: String,
        end_value: f32,
        duration: Duration,
        easing: Easing,
        fallback_start: f32,
    },
    Cancel {
        key: String,
        snap_to_target: bool,
    },
    CancelAll,
}

/// The fade engine's public handle. The tick loop itself runs on a spawned
/// task and owns the active-fade map exclusively; everything here just
/// sends it commands or reads the shared current-value map.
pub struct FadeEngine {
    current_values: Arc<DashMap<String, f32>>,
    cmd_tx: mpsc::Sender<Command>,
}

impl FadeEngine {
    /// Starts the tick loop at the given rate and returns the engine handle
    /// plus the tick stream the hub forwards to `Registry::route_fade_tick`.
    pub fn start(tick_hz: u32) -> (Arc<FadeEngine>, mpsc::Receiver<(String, f32)>) {
        let current_values = Arc::new(DashMap::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (tick_tx, tick_rx) = mpsc::channel(1024);
        tokio::spawn(Self::tick_loop(tick_hz, current_values.clone(), cmd_rx, tick_tx));
        (
            Arc::new(FadeEngine {
                current_values,
                cmd_tx,
            }),
            tick_rx,
        )
    }

    pub async fn start_fade(
        &self,
        key: impl Into<String>,
        end_value: f32,
        duration: Duration,
        easing: Easing,
        fallback_start: f32,
    ) {
        let _ = self
            .cmd_tx
            .send(Command::Start {
                key: key.into(),
                end_value,
                duration,
                easing,
                fallback_start,
            })
            .await;
    }

    pub async fn cancel_fade(&self, key: impl Into<String>, snap_to_target: bool) {
        let _ = self
            .cmd_tx
            .send(Command::Cancel {
                key: key.into(),
                snap_to_target,
            })
            .await;
    }

    pub async fn cancel_all(&self) {
        let _ = self.cmd_tx.send(Command::CancelAll).await;
    }

    pub fn set_current_value(&self, key: &str, value: f32) {
        self.current_values.insert(key.to_string(), value);
    }

    pub fn get_current_value(&self, key: &str) -> Option<f32> {
        self.current_values.get(key).map(|v| *v)
    }

    async fn tick_loop(
        tick_hz: u32,
        current_values: Arc<DashMap<String, f32>>,
        mut cmd_rx: mpsc::Receiver<Command>,
        tick_tx: mpsc::Sender<(String, f32)>,
    ) {
        let mut active: HashMap<String, ActiveFade> = HashMap::new();
        let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / tick_hz as f64));
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Start { key, end_value, duration, easing, fallback_start }) => {
                            let start_value = current_values.get(&key).map(|v| *v).unwrap_or(fallback_start);
                            current_values.insert(key.clone(), start_value);
                            active.insert(
                                key,
                                ActiveFade { start_value, end_value, start_time: Instant::now(), duration, easing },
                            );
                        }
                        Some(Command::Cancel { key, snap_to_target }) => {
                            if let Some(fade) = active.remove(&key) {
                                if snap_to_target {
                                    current_values.insert(key.clone(), fade.end_value);
                                    let _ = tick_tx.send((key, fade.end_value)).await;
                                }
                            }
                        }
                        Some(Command::CancelAll) => active.clear(),
                        None => return,
                    }
                }
                _ = interval.tick() => {
                    let now = Instant::now();
                    let mut finished = Vec::new();
                    for (key, fade) in active.iter() {
                        let t = if fade.duration.is_zero() {
                            1.0
                        } else {
                            (now - fade.start_time).as_secs_f32() / fade.duration.as_secs_f32()
                        };
                        let eased = fade.easing.apply(t);
                        let value = fade.start_value + (fade.end_value - fade.start_value) * eased;
                        current_values.insert(key.clone(), value);
                        let _ = tick_tx.send((key.clone(), value)).await;
                        if t >= 1.0 {
                            finished.push(key.clone());
                        }
                    }
                    for key in finished {
                        active.remove(&key);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::eventually;

    #[tokio::test(flavor = "multi_thread")]
    async fn fade_reaches_exactly_the_end_value() {
        let (engine, mut ticks) = FadeEngine::start(100);
        engine
            .start_fade("test:level", 1.0, Duration::from_millis(50), Easing::Linear, 0.0)
            .await;

        let mut last = None;
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if let Ok(Some((key, value))) =
                tokio::time::timeout(Duration::from_millis(200), ticks.recv()).await
            {
                assert_eq!(key, "test:level");
                last = Some(value);
                if value >= 1.0 {
                    break;
                }
            }
        }
        assert_eq!(last, Some(1.0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_with_snap_jumps_to_target() {
        let (engine, mut ticks) = FadeEngine::start(50);
        engine
            .start_fade("test:a", 1.0, Duration::from_secs(5), Easing::Linear, 0.0)
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.cancel_fade("test:a", true).await;

        eventually(
            || engine.get_current_value("test:a") == Some(1.0),
            "fade never snapped to its target value",
        )
        .await;
        // Drain whatever ticks arrived; the final one must be the snap.
        let mut last = None;
        while let Ok(Some((_, v))) = tokio::time::timeout(Duration::from_millis(50), ticks.recv()).await {
            last = Some(v);
        }
        assert_eq!(last, Some(1.0));
    }

    #[test]
    fn easing_curves_all_reach_their_endpoints() {
        for easing in [Easing::Linear, Easing::EaseIn, Easing::EaseOut, Easing::SCurve] {
            assert_eq!(easing.apply(0.0), 0.0);
            assert!((easing.apply(1.0) - 1.0).abs() < 1e-6);
        }
    }
}
