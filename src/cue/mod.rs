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

//! The cue sequencer: a deterministic state machine driving a loaded cue
//! list through Load/Go/GoCue/Back/Stop/Shutdown, firing each cue's actions
//! through the same dispatch path an external OSC message would take.

pub mod ingest;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::osc::{OscArg, OscMessage};

#[derive(Debug, Clone)]
pub struct CueAction {
    pub address: String,
    pub args: Vec<OscArg>,
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Cue {
    pub id: String,
    pub name: String,
    pub pre_wait_ms: Option<u64>,
    pub post_wait_ms: Option<u64>,
    pub auto_follow: bool,
    pub actions: Vec<CueAction>,
}

#[derive(Debug, Clone)]
pub struct CueList {
    pub name: String,
    pub cues: Vec<Cue>,
}

#[derive(Debug, Clone)]
pub struct SequencerState {
    pub loaded: bool,
    pub cue_list_name: Option<String>,
    pub cue_count: usize,
    pub playhead_index: i64,
    pub active_cue_id: Option<String>,
    pub is_running: bool,
}

impl SequencerState {
    fn empty() -> Self {
        Self {
            loaded: false,
            cue_list_name: None,
            cue_count: 0,
            playhead_index: -1,
            active_cue_id: None,
            is_running: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SequencerEvent {
    CueFired { index: usize, cue_id: String },
    CueComplete { index: usize, cue_id: String },
}

struct Inner {
    list: Option<Arc<CueList>>,
    state: SequencerState,
    pending: Vec<AbortHandle>,
}

/// Owns cue-list playback. Actions fire by handing an `OscMessage` to
/// `action_tx`, which the hub forwards through the same `Dispatcher` an
/// external OSC sender would use — cue-triggered and controller-triggered
/// device commands are indistinguishable past this point.
pub struct Sequencer {
    inner: Mutex<Inner>,
    action_tx: mpsc::Sender<OscMessage>,
    event_tx: broadcast::Sender<SequencerEvent>,
}

impl Sequencer {
    pub fn new(action_tx: mpsc::Sender<OscMessage>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(32);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                list: None,
                state: SequencerState::empty(),
                pending: Vec::new(),
            }),
            action_tx,
            event_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequencerEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> SequencerState {
        self.inner.lock().state.clone()
    }

    pub async fn load(self: &Arc<Self>, list: CueList) {
        self.stop_internal();
        let mut inner = self.inner.lock();
        inner.state = SequencerState {
            loaded: true,
            cue_list_name: Some(list.name.clone()),
            cue_count: list.cues.len(),
            playhead_index: -1,
            active_cue_id: None,
            is_running: false,
        };
        inner.list = Some(Arc::new(list));
    }

    pub async fn go(self: &Arc<Self>) {
        let next = {
            let inner = self.inner.lock();
            match &inner.list {
                None => return,
                Some(list) => {
                    let next = inner.state.playhead_index + 1;
                    if next < 0 || next as usize >= list.cues.len() {
                        return;
                    }
                    (list.clone(), next as usize)
                }
            }
        };
        self.fire_cue(next.0, next.1).await;
    }

    pub async fn go_cue(self: &Arc<Self>, id: &str) {
        let target = {
            let inner = self.inner.lock();
            match &inner.list {
                None => return,
                Some(list) => match list.cues.iter().position(|c| c.id == id) {
                    Some(index) => (list.clone(), index),
                    None => return,
                },
            }
        };
        self.fire_cue(target.0, target.1).await;
    }

    pub fn back(&self) {
        let mut inner = self.inner.lock();
        if inner.state.loaded {
            inner.state.playhead_index = (inner.state.playhead_index - 1).max(-1);
        }
    }

    pub fn stop(&self) {
        self.stop_internal();
    }

    pub fn shutdown(&self) {
        self.stop_internal();
        let mut inner = self.inner.lock();
        inner.list = None;
        inner.state = SequencerState::empty();
    }

    fn stop_internal(&self) {
        let mut inner = self.inner.lock();
        for handle in inner.pending.drain(..) {
            handle.abort();
        }
        inner.state.is_running = false;
    }

    async fn fire_cue(self: &Arc<Self>, list: Arc<CueList>, index: usize) {
        self.stop_internal();
        let cue = list.cues[index].clone();
        {
            let mut inner = self.inner.lock();
            inner.state.playhead_index = index as i64;
            inner.state.active_cue_id = Some(cue.id.clone());
            inner.state.is_running = true;
        }
        let _ = self.event_tx.send(SequencerEvent::CueFired {
            index,
            cue_id: cue.id.clone(),
        });
        debug!(cue_id = %cue.id, index, "cue fired");

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run_cue(list, index, cue).await;
        });
        self.inner.lock().pending.push(handle.abort_handle());
    }

    async fn run_cue(self: Arc<Self>, list: Arc<CueList>, index: usize, cue: Cue) {
        if let Some(pre) = cue.pre_wait_ms {
            if pre > 0 {
                tokio::time::sleep(Duration::from_millis(pre)).await;
            }
        }

        let mut action_handles = Vec::with_capacity(cue.actions.len());
        for action in cue.actions.iter().cloned() {
            let delay = action.delay_ms.unwrap_or(0);
            let action_tx = self.action_tx.clone();
            let handle = tokio::spawn(async move {
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                let _ = action_tx
                    .send(OscMessage::new(action.address, action.args))
                    .await;
            });
            action_handles.push(handle);
        }
        {
            let mut inner = self.inner.lock();
            inner.pending.extend(action_handles.iter().map(|h| h.abort_handle()));
        }
        for handle in action_handles {
            let _ = handle.await;
        }

        if let Some(post) = cue.post_wait_ms {
            if post > 0 {
                tokio::time::sleep(Duration::from_millis(post)).await;
            }
        }

        let _ = self.event_tx.send(SequencerEvent::CueComplete {
            index,
            cue_id: cue.id.clone(),
        });
        self.inner.lock().state.is_running = false;

        if cue.auto_follow && index + 1 < list.cues.len() {
            self.fire_cue(list.clone(), index + 1).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::eventually_async;

    fn sample_list() -> CueList {
        CueList {
            name: "test".into(),
            cues: vec![
                Cue {
                    id: "1".into(),
                    name: "First".into(),
                    pre_wait_ms: None,
                    post_wait_ms: Some(20),
                    auto_follow: true,
                    actions: vec![CueAction {
                        address: "/avantis/ch/1/mix/fader".into(),
                        args: vec![OscArg::Float(0.5)],
                        delay_ms: None,
                    }],
                },
                Cue {
                    id: "2".into(),
                    name: "Second".into(),
                    pre_wait_ms: None,
                    post_wait_ms: None,
                    auto_follow: false,
                    actions: vec![CueAction {
                        address: "/obs/scene/Intro".into(),
                        args: vec![],
                        delay_ms: None,
                    }],
                },
            ],
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn go_fires_the_next_cue_and_auto_follow_chains() {
        let (action_tx, mut action_rx) = mpsc::channel(8);
        let sequencer = Sequencer::new(action_tx);
        sequencer.load(sample_list()).await;

        sequencer.go().await;

        let first = action_rx.recv().await.unwrap();
        assert_eq!(first.addr, "/avantis/ch/1/mix/fader");

        let second = action_rx.recv().await.unwrap();
        assert_eq!(second.addr, "/obs/scene/Intro");

        eventually_async(
            || async { sequencer.state().active_cue_id.as_deref() == Some("2") },
            "auto-follow never advanced the playhead to cue 2",
        )
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn go_cue_jumps_directly_to_the_named_cue() {
        let (action_tx, mut action_rx) = mpsc::channel(8);
        let sequencer = Sequencer::new(action_tx);
        sequencer.load(sample_list()).await;

        sequencer.go_cue("2").await;
        let action = action_rx.recv().await.unwrap();
        assert_eq!(action.addr, "/obs/scene/Intro");
        assert_eq!(sequencer.state().active_cue_id.as_deref(), Some("2"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_cancels_pending_timers() {
        let (action_tx, mut action_rx) = mpsc::channel(8);
        let sequencer = Sequencer::new(action_tx);
        let mut list = sample_list();
        list.cues[0].actions[0].delay_ms = Some(500);
        sequencer.load(list).await;

        sequencer.go().await;
        sequencer.stop();

        let result = tokio::time::timeout(Duration::from_millis(100), action_rx.recv()).await;
        assert!(result.is_err(), "stop should have cancelled the delayed action");
    }
}
