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

//! Builds the raw MIDI byte sequences the Avantis speaks over its TCP
//! socket: NRPN fader/pan messages, Note-On mute toggles, and scene-recall
//! Program Changes (with a Bank Select for scenes >= 128).

use crate::error::HubError;

const NRPN_PARAM_MSB: u8 = 99;
const NRPN_PARAM_LSB: u8 = 98;
const NRPN_DATA_ENTRY_MSB: u8 = 6;
const FADER_PARAM_LSB: u8 = 0x17;
const PAN_PARAM_LSB: u8 = 0x18;

pub fn float_to_midi7(value: f32) -> u8 {
    ((value.clamp(0.0, 1.0) * 127.0).round() as i32).clamp(0, 127) as u8
}

pub fn midi7_to_float(value: u8) -> f32 {
    value.min(127) as f32 / 127.0
}

fn build_nrpn(channel: u8, strip_hex: u8, param_lsb: u8, level: f32) -> Vec<u8> {
    let status = 0xB0 | (channel & 0x0F);
    let strip_hex = strip_hex & 0x7F;
    let level7 = float_to_midi7(level);
    vec![
        status,
        NRPN_PARAM_MSB,
        strip_hex,
        status,
        NRPN_PARAM_LSB,
        param_lsb,
        status,
        NRPN_DATA_ENTRY_MSB,
        level7,
    ]
}

pub fn build_fader(channel: u8, strip_hex: u8, level: f32) -> Vec<u8> {
    build_nrpn(channel, strip_hex, FADER_PARAM_LSB, level)
}

pub fn build_pan(channel: u8, strip_hex: u8, level: f32) -> Vec<u8> {
    build_nrpn(channel, strip_hex, PAN_PARAM_LSB, level)
}

/// A mute toggle, sent as a Note-On at full velocity followed by a
/// zero-velocity Note-On for the same note/channel — the console's own
/// idiom for a momentary trigger rather than a sustained key.
pub fn build_mute(channel: u8, strip_hex: u8, muted: bool) -> Vec<u8> {
    let status = 0x90 | (channel & 0x0F);
    let strip_hex = strip_hex & 0x7F;
    let velocity = if muted { 0x7F } else { 0x3F };
    vec![status, strip_hex, velocity, status, strip_hex, 0x00]
}

pub fn build_scene_recall(channel: u8, scene: i32) -> Result<Vec<u8>, HubError> {
    if !(0..500).contains(&scene) {
        return Err(HubError::OutOfRange(format!(
            "scene {scene} out of range 0..500"
        )));
    }
    let pc_status = 0xC0 | (channel & 0x0F);
    if scene < 128 {
        Ok(vec![pc_status, scene as u8])
    } else {
        let cc_status = 0xB0 | (channel & 0x0F);
        let bank = (scene >> 7) as u8;
        let low = (scene & 0x7F) as u8;
        Ok(vec![cc_status, 0x00, bank, pc_status, low])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fader_message_matches_the_literal_example() {
        let bytes = build_fader(0, 0x00, 0.5);
        assert_eq!(bytes, vec![0xB0, 0x63, 0x00, 0xB0, 0x62, 0x17, 0xB0, 0x06, 0x40]);
    }

    #[test]
    fn scene_recall_below_128_is_a_bare_program_change() {
        assert_eq!(build_scene_recall(0, 127).unwrap(), vec![0xC0, 0x7F]);
    }

    #[test]
    fn scene_recall_at_or_above_128_prefixes_a_bank_select() {
        assert_eq!(
            build_scene_recall(0, 200).unwrap(),
            vec![0xB0, 0x00, 0x01, 0xC0, 0x48]
        );
    }

    #[test]
    fn scene_recall_rejects_out_of_range_scenes() {
        assert!(build_scene_recall(0, 500).is_err());
        assert!(build_scene_recall(0, -1).is_err());
    }

    #[test]
    fn mute_and_unmute_differ_only_in_velocity() {
        let muted = build_mute(0, 0x05, true);
        let unmuted = build_mute(0, 0x05, false);
        assert_eq!(muted[2], 0x7F);
        assert_eq!(unmuted[2], 0x3F);
    }

    #[test]
    fn midi7_round_trips_at_the_endpoints() {
        assert_eq!(float_to_midi7(0.0), 0);
        assert_eq!(float_to_midi7(1.0), 127);
        assert_eq!(midi7_to_float(0), 0.0);
        assert_eq!(midi7_to_float(127), 1.0);
    }
}
