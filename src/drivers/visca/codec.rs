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

//! Pure VISCA command byte builders, following the same small-builder-
//! function shape as `drivers::avantis::midi_codec` but for the PTZ camera
//! protocol's fixed byte tables (spec §4.6).

use crate::error::HubError;

const TERMINATOR: u8 = 0xFF;

fn camera_byte(camera_address: u8) -> u8 {
    0x80 + camera_address
}

pub fn home(camera_address: u8) -> Vec<u8> {
    vec![camera_byte(camera_address), 0x01, 0x06, 0x04, TERMINATOR]
}

pub fn preset_recall(camera_address: u8, preset: i32) -> Result<Vec<u8>, HubError> {
    let preset = validate_preset(preset)?;
    Ok(vec![
        camera_byte(camera_address),
        0x01,
        0x04,
        0x3F,
        0x02,
        preset,
        TERMINATOR,
    ])
}

pub fn preset_store(camera_address: u8, preset: i32) -> Result<Vec<u8>, HubError> {
    let preset = validate_preset(preset)?;
    Ok(vec![
        camera_byte(camera_address),
        0x01,
        0x04,
        0x3F,
        0x01,
        preset,
        TERMINATOR,
    ])
}

fn validate_preset(preset: i32) -> Result<u8, HubError> {
    if !(0..=127).contains(&preset) {
        return Err(HubError::OutOfRange(format!(
            "preset {preset} out of range 0..=127"
        )));
    }
    Ok(preset as u8)
}

pub fn power(camera_address: u8, on: bool) -> Vec<u8> {
    let state = if on { 0x02 } else { 0x03 };
    vec![camera_byte(camera_address), 0x01, 0x04, 0x00, state, TERMINATOR]
}

pub fn focus(camera_address: u8, auto: bool) -> Vec<u8> {
    let mode = if auto { 0x02 } else { 0x03 };
    vec![camera_byte(camera_address), 0x01, 0x04, 0x38, mode, TERMINATOR]
}

pub fn pantilt_stop(camera_address: u8) -> Vec<u8> {
    vec![
        camera_byte(camera_address),
        0x01,
        0x06,
        0x01,
        0x01,
        0x01,
        0x03,
        0x03,
        TERMINATOR,
    ]
}

/// `pan`/`tilt` are signed speeds in `[-1, 1]`; zero on an axis sends that
/// axis's stop direction while keeping the other axis's accumulated speed.
pub fn pantilt_speed(camera_address: u8, pan: f32, tilt: f32) -> Vec<u8> {
    let vv = speed_byte(pan, 0x18);
    let ww = speed_byte(tilt, 0x14);
    let pan_dir = direction_byte(pan, 0x02, 0x01);
    let tilt_dir = direction_byte(tilt, 0x01, 0x02);
    vec![
        camera_byte(camera_address),
        0x01,
        0x06,
        0x01,
        vv,
        ww,
        pan_dir,
        tilt_dir,
        TERMINATOR,
    ]
}

fn speed_byte(value: f32, scale: i32) -> u8 {
    ((value.abs() * scale as f32).round() as i32).clamp(1, scale) as u8
}

/// `positive_dir`/`negative_dir` are the direction bytes for a positive or
/// negative speed; zero always maps to the stop byte (`0x03`).
fn direction_byte(value: f32, positive_dir: u8, negative_dir: u8) -> u8 {
    if value > 0.0 {
        positive_dir
    } else if value < 0.0 {
        negative_dir
    } else {
        0x03
    }
}

pub fn zoom_speed(camera_address: u8, speed: f32) -> Vec<u8> {
    if speed == 0.0 {
        return vec![camera_byte(camera_address), 0x01, 0x04, 0x07, 0x00, TERMINATOR];
    }
    let p = ((speed.abs() * 7.0).round() as i32).min(7) as u8;
    let direction = if speed > 0.0 { 0x20 } else { 0x30 };
    vec![
        camera_byte(camera_address),
        0x01,
        0x04,
        0x07,
        direction | p,
        TERMINATOR,
    ]
}

pub fn zoom_direct(camera_address: u8, position: f32) -> Vec<u8> {
    let raw = ((position.clamp(0.0, 1.0) * 0x4000 as f32).round() as u32).min(0x4000);
    let p = ((raw >> 12) & 0xF) as u8;
    let q = ((raw >> 8) & 0xF) as u8;
    let r = ((raw >> 4) & 0xF) as u8;
    let s = (raw & 0xF) as u8;
    vec![camera_byte(camera_address), 0x01, 0x04, 0x47, p, q, r, s, TERMINATOR]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn home_matches_the_literal_example() {
        assert_eq!(home(1), vec![0x81, 0x01, 0x06, 0x04, 0xFF]);
    }

    #[test]
    fn preset_recall_matches_the_literal_example() {
        assert_eq!(
            preset_recall(1, 5).unwrap(),
            vec![0x81, 0x01, 0x04, 0x3F, 0x02, 0x05, 0xFF]
        );
    }

    #[test]
    fn preset_rejects_out_of_range_values() {
        assert!(preset_recall(1, -1).is_err());
        assert!(preset_recall(1, 128).is_err());
    }

    #[test]
    fn power_on_and_off_differ_only_in_the_state_byte() {
        assert_eq!(power(1, true), vec![0x81, 0x01, 0x04, 0x00, 0x02, 0xFF]);
        assert_eq!(power(1, false), vec![0x81, 0x01, 0x04, 0x00, 0x03, 0xFF]);
    }

    #[test]
    fn pantilt_stop_matches_the_literal_example() {
        assert_eq!(
            pantilt_stop(1),
            vec![0x81, 0x01, 0x06, 0x01, 0x01, 0x01, 0x03, 0x03, 0xFF]
        );
    }

    #[test]
    fn pantilt_speed_encodes_direction_and_clamped_magnitude() {
        let bytes = pantilt_speed(1, 1.0, -1.0);
        assert_eq!(bytes, vec![0x81, 0x01, 0x06, 0x01, 0x18, 0x14, 0x02, 0x02, 0xFF]);
    }

    #[test]
    fn zoom_speed_stops_at_zero_and_caps_at_seven() {
        assert_eq!(zoom_speed(1, 0.0), vec![0x81, 0x01, 0x04, 0x07, 0x00, 0xFF]);
        assert_eq!(zoom_speed(1, 2.0), vec![0x81, 0x01, 0x04, 0x07, 0x27, 0xFF]);
        assert_eq!(zoom_speed(1, -2.0), vec![0x81, 0x01, 0x04, 0x07, 0x37, 0xFF]);
    }

    #[test]
    fn zoom_direct_splits_into_four_nibbles() {
        let bytes = zoom_direct(1, 1.0);
        assert_eq!(bytes, vec![0x81, 0x01, 0x04, 0x47, 0x04, 0x00, 0x00, 0x00, 0xFF]);
    }
}
