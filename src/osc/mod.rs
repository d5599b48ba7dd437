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

//! The OSC codec: a small typed argument union plus encode/decode wrappers
//! around `rosc`, and the UDP listener/upstream-client bookkeeping that sits
//! on top of it.

pub mod clients;
pub mod listener;

use rosc::{OscMessage as RawMessage, OscPacket, OscType};

use crate::error::HubError;

/// A single OSC argument, normalized to the handful of types this hub's
/// drivers actually care about. Intermediate callers (cue actions, hub
/// commands) build these from plain numbers/strings; `encode` maps them back
/// onto `rosc::OscType` at the wire edge.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Float(f32),
    String(String),
    Bool(bool),
}

impl OscArg {
    /// Builds an `Int` or `Float` depending on whether the value has a
    /// fractional part, matching how YAML/JSON numeric literals are usually
    /// authored in cue files.
    pub fn from_number(n: f64) -> OscArg {
        if n.fract() == 0.0 && n.abs() < i32::MAX as f64 {
            OscArg::Int(n as i32)
        } else {
            OscArg::Float(n as f32)
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            OscArg::Int(i) => Some(*i as f32),
            OscArg::Float(f) => Some(*f),
            OscArg::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            OscArg::String(_) => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            OscArg::Int(i) => Some(*i),
            OscArg::Float(f) => Some(*f as i32),
            OscArg::Bool(b) => Some(if *b { 1 } else { 0 }),
            OscArg::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OscArg::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OscArg::Bool(b) => Some(*b),
            OscArg::Int(i) => Some(*i != 0),
            OscArg::Float(f) => Some(*f != 0.0),
            OscArg::String(_) => None,
        }
    }
}

impl From<&OscArg> for OscType {
    fn from(arg: &OscArg) -> Self {
        match arg {
            OscArg::Int(i) => OscType::Int(*i),
            OscArg::Float(f) => OscType::Float(*f),
            OscArg::String(s) => OscType::String(s.clone()),
            OscArg::Bool(b) => OscType::Bool(*b),
        }
    }
}

impl From<OscType> for OscArg {
    fn from(t: OscType) -> Self {
        match t {
            OscType::Int(i) => OscArg::Int(i),
            OscType::Float(f) => OscArg::Float(f),
            OscType::Double(d) => OscArg::Float(d as f32),
            OscType::String(s) => OscArg::String(s),
            OscType::Bool(b) => OscArg::Bool(b),
            OscType::Long(l) => OscArg::Int(l as i32),
            other => OscArg::String(format!("{other:?}")),
        }
    }
}

/// An OSC message with the address kept separate from its arguments, the way
/// every consumer in this crate (dispatcher, drivers, cue actions) wants it.
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub addr: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(addr: impl Into<String>, args: Vec<OscArg>) -> Self {
        Self {
            addr: addr.into(),
            args,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HubError> {
        let packet = OscPacket::Message(RawMessage {
            addr: self.addr.clone(),
            args: self.args.iter().map(OscType::from).collect(),
        });
        rosc::encoder::encode(&packet).map_err(|e| HubError::Transport(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Vec<OscMessage>, HubError> {
        let (_, packet) =
            rosc::decoder::decode_udp(bytes).map_err(|e| HubError::Transport(e.to_string()))?;
        Ok(flatten(packet))
    }
}

fn flatten(packet: OscPacket) -> Vec<OscMessage> {
    match packet {
        OscPacket::Message(m) => vec![OscMessage {
            addr: m.addr,
            args: m.args.into_iter().map(OscArg::from).collect(),
        }],
        OscPacket::Bundle(b) => b.content.into_iter().flat_map(flatten).collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_a_message() {
        let msg = OscMessage::new("/ch/1/mix/fader", vec![OscArg::Float(0.75)]);
        let bytes = msg.encode().expect("encode");
        let decoded = OscMessage::decode(&bytes).expect("decode");
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn from_number_picks_int_or_float() {
        assert_eq!(OscArg::from_number(3.0), OscArg::Int(3));
        assert_eq!(OscArg::from_number(3.5), OscArg::Float(3.5));
    }

    #[test]
    fn decode_flattens_bundles() {
        let inner = OscMessage::new("/a", vec![OscArg::Int(1)]);
        let bundle = OscPacket::Bundle(rosc::OscBundle {
            timetag: rosc::OscTime::from(std::time::SystemTime::now()),
            content: vec![OscPacket::Message(RawMessage {
                addr: inner.addr.clone(),
                args: inner.args.iter().map(OscType::from).collect(),
            })],
        });
        let bytes = rosc::encoder::encode(&bundle).expect("encode bundle");
        let decoded = OscMessage::decode(&bytes).expect("decode bundle");
        assert_eq!(decoded, vec![inner]);
    }
}
