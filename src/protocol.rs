//! Wire codec for the three scale families.
//!
//! Acaia frames are `EF DD <type> <payload..> <ck_even> <ck_odd>` where the two
//! trailing bytes are running sums over the even and odd payload positions.
//! Felicita-style scales stream ASCII and accept a single-byte tare.

use crate::types::ScaleType;
use log::trace;

pub const HEADER1: u8 = 0xEF;
pub const HEADER2: u8 = 0xDD;

pub const MSG_HEARTBEAT: u8 = 0x00;
pub const MSG_TARE: u8 = 0x04;
pub const MSG_BATTERY: u8 = 0x06;
pub const MSG_STATUS: u8 = 0x08;
pub const MSG_IDENTIFY: u8 = 0x0B;
pub const MSG_EVENT_CONFIG: u8 = 0x0C;
pub const MSG_TIMER: u8 = 0x0D;

// Event id the new-style scales put at byte[4] of a weight report
const EVENT_WEIGHT: u8 = 0x05;

pub const IDENTIFY_COMMAND: [u8; 20] = [
    0xEF, 0xDD, 0x0B, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x31,
    0x32, 0x33, 0x34, 0x9A, 0x6D,
];
pub const HEARTBEAT_COMMAND: [u8; 7] = [0xEF, 0xDD, 0x00, 0x02, 0x00, 0x02, 0x00];
pub const NOTIFICATION_REQUEST: [u8; 14] = [
    0xEF, 0xDD, 0x0C, 0x09, 0x00, 0x01, 0x01, 0x02, 0x02, 0x05, 0x03, 0x04, 0x15, 0x06,
];
pub const START_TIMER_COMMAND: [u8; 7] = [0xEF, 0xDD, 0x0D, 0x00, 0x00, 0x00, 0x00];
pub const STOP_TIMER_COMMAND: [u8; 7] = [0xEF, 0xDD, 0x0D, 0x00, 0x02, 0x00, 0x02];
pub const RESET_TIMER_COMMAND: [u8; 7] = [0xEF, 0xDD, 0x0D, 0x00, 0x01, 0x00, 0x01];
pub const TARE_ACAIA_COMMAND: [u8; 6] = [0xEF, 0xDD, 0x04, 0x00, 0x00, 0x00];
pub const TARE_GENERIC_COMMAND: [u8; 1] = [b'T'];

pub const BATTERY_PAYLOAD_LEN: usize = 16;
pub const BATTERY_REQUEST_LEN: usize = BATTERY_PAYLOAD_LEN + 5;

pub const OLD_WEIGHT_FRAME_LEN: usize = 10;
pub const NEW_WEIGHT_FRAME_MIN_LEN: usize = 13;
pub const GENERIC_WEIGHT_FRAME_MIN_LEN: usize = 13;

/// Sums the payload into two lanes: even positions and odd positions.
pub fn checksum_lanes(payload: &[u8]) -> (u8, u8) {
    payload
        .iter()
        .enumerate()
        .fold((0u8, 0u8), |(even, odd), (i, &byte)| {
            if i % 2 == 0 {
                (even.wrapping_add(byte), odd)
            } else {
                (even, odd.wrapping_add(byte))
            }
        })
}

/// Builds a complete Acaia frame around `payload`.
pub fn encode_message(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let (even, odd) = checksum_lanes(payload);
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.extend_from_slice(&[HEADER1, HEADER2, msg_type]);
    frame.extend_from_slice(payload);
    frame.push(even);
    frame.push(odd);
    frame
}

/// Battery query: a zero payload under the battery message type.
pub fn battery_request() -> Vec<u8> {
    encode_message(MSG_BATTERY, &[0u8; BATTERY_PAYLOAD_LEN])
}

pub fn tare_command(scale_type: ScaleType) -> &'static [u8] {
    match scale_type {
        ScaleType::Generic => &TARE_GENERIC_COMMAND,
        ScaleType::Old | ScaleType::New => &TARE_ACAIA_COMMAND,
    }
}

/// Decodes a weight report for the selected family. `None` means the frame did not
/// have the expected shape and must be ignored.
pub fn decode_weight(scale_type: ScaleType, data: &[u8]) -> Option<f32> {
    let weight = match scale_type {
        ScaleType::Old => decode_old_weight(data),
        ScaleType::New => decode_new_weight(data),
        ScaleType::Generic => decode_generic_weight(data),
    };
    if weight.is_none() {
        trace!("{} frame rejected: {:02X?}", scale_type.as_str(), data);
    }
    weight
}

pub fn decode_old_weight(data: &[u8]) -> Option<f32> {
    if data.len() != OLD_WEIGHT_FRAME_LEN {
        return None;
    }
    Some(scaled_weight(data[2], data[3], data[6], data[7]))
}

pub fn decode_new_weight(data: &[u8]) -> Option<f32> {
    if data.len() < NEW_WEIGHT_FRAME_MIN_LEN || data[2] != MSG_EVENT_CONFIG || data[4] != EVENT_WEIGHT
    {
        return None;
    }
    Some(scaled_weight(data[5], data[6], data[9], data[10]))
}

/// Felicita layout: sign at byte 2, then six digits from thousands down to hundredths.
pub fn decode_generic_weight(data: &[u8]) -> Option<f32> {
    if data.len() < GENERIC_WEIGHT_FRAME_MIN_LEN {
        return None;
    }
    let digits = &data[3..9];
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    // Accumulate in hundredths so 123.45 is exact before the final division
    let hundredths = digits
        .iter()
        .fold(0u32, |acc, &d| acc * 10 + u32::from(d - b'0'));
    let sign = if data[2] == b'+' { 1.0 } else { -1.0 };
    Some(sign * hundredths as f32 / 100.0)
}

fn scaled_weight(low: u8, high: u8, decimals: u8, flags: u8) -> f32 {
    let raw = u16::from_le_bytes([low, high]) as f32;
    let sign = if flags & 0x02 != 0 { -1.0 } else { 1.0 };
    raw / 10f32.powi(i32::from(decimals)) * sign
}

/// Battery percentage from an Acaia status frame, if `data` is one.
pub fn decode_battery(data: &[u8]) -> Option<u8> {
    if data.len() < 5 || data[0] != HEADER1 || data[1] != HEADER2 || data[2] != MSG_STATUS {
        return None;
    }
    let percent = data[4] & 0x7F;
    (percent <= 100).then_some(percent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_lanes_split_even_and_odd() {
        assert_eq!(checksum_lanes(&[0x09, 0x00, 0x01, 0x01, 0x02, 0x02, 0x05, 0x03, 0x04]), (0x15, 0x06));
        assert_eq!(checksum_lanes(&[]), (0, 0));
        assert_eq!(checksum_lanes(&[0xFF, 0x00, 0x02]), (0x01, 0x00));
    }

    #[test]
    fn test_fixed_frames_carry_valid_checksums() {
        assert_eq!(encode_message(MSG_IDENTIFY, &IDENTIFY_COMMAND[3..18]), IDENTIFY_COMMAND);
        assert_eq!(encode_message(MSG_HEARTBEAT, &[0x02, 0x00]), HEARTBEAT_COMMAND);
        assert_eq!(encode_message(MSG_EVENT_CONFIG, &NOTIFICATION_REQUEST[3..12]), NOTIFICATION_REQUEST);
        assert_eq!(encode_message(MSG_TIMER, &[0x00, 0x00]), START_TIMER_COMMAND);
        assert_eq!(encode_message(MSG_TIMER, &[0x00, 0x02]), STOP_TIMER_COMMAND);
        assert_eq!(encode_message(MSG_TIMER, &[0x00, 0x01]), RESET_TIMER_COMMAND);
        assert_eq!(encode_message(MSG_TARE, &[0x00]), TARE_ACAIA_COMMAND);
    }

    #[test]
    fn test_battery_request_layout() {
        let frame = battery_request();
        assert_eq!(frame.len(), BATTERY_REQUEST_LEN);
        assert_eq!(&frame[..3], &[HEADER1, HEADER2, MSG_BATTERY]);
        assert!(frame[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tare_command_per_type() {
        assert_eq!(tare_command(ScaleType::Generic), &[0x54]);
        assert_eq!(tare_command(ScaleType::Old).len(), 6);
        assert_eq!(tare_command(ScaleType::New), &TARE_ACAIA_COMMAND);
    }

    #[test]
    fn test_old_weight_decode() {
        let frame = [0xEF, 0xDD, 0x64, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
        assert_eq!(decode_weight(ScaleType::Old, &frame), Some(1.0));

        let mut negative = frame;
        negative[7] = 0x02;
        assert_eq!(decode_weight(ScaleType::Old, &negative), Some(-1.0));
    }

    #[test]
    fn test_old_weight_requires_exact_length() {
        let frame = [0u8; 11];
        assert_eq!(decode_old_weight(&frame), None);
        assert_eq!(decode_old_weight(&frame[..9]), None);
    }

    #[test]
    fn test_new_weight_decode_negative() {
        let frame = [
            0xEF, 0xDD, 0x0C, 0x0C, 0x05, 0xF4, 0x01, 0x00, 0x00, 0x02, 0x02, 0x00, 0x00,
        ];
        assert_eq!(decode_weight(ScaleType::New, &frame), Some(-5.0));
    }

    #[test]
    fn test_new_weight_rejects_other_events() {
        let mut frame = [
            0xEF, 0xDD, 0x0C, 0x0C, 0x05, 0xF4, 0x01, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00,
        ];
        assert_eq!(decode_new_weight(&frame), Some(5.0));
        frame[4] = 0x07;
        assert_eq!(decode_new_weight(&frame), None);
        frame[4] = 0x05;
        frame[2] = 0x08;
        assert_eq!(decode_new_weight(&frame), None);
        assert_eq!(decode_new_weight(&frame[..12]), None);
    }

    #[test]
    fn test_generic_weight_decode() {
        let frame = *b"ST+012345 g\r\n";
        assert_eq!(decode_weight(ScaleType::Generic, &frame), Some(123.45));

        let mut negative = frame;
        negative[2] = b'-';
        assert_eq!(decode_generic_weight(&negative), Some(-123.45));
    }

    #[test]
    fn test_generic_weight_rejects_short_or_non_digit() {
        assert_eq!(decode_generic_weight(b"ST+012345 g\r"), None);
        assert_eq!(decode_generic_weight(b"ST+01?345 g\r\n"), None);
    }

    #[test]
    fn test_decode_battery_status_frame() {
        let frame = [0xEF, 0xDD, 0x08, 0x0A, 0xD5, 0x02, 0x00];
        assert_eq!(decode_battery(&frame), Some(0x55));
        assert_eq!(decode_battery(&[0xEF, 0xDD, 0x0C, 0x0A, 0x50]), None);
        assert_eq!(decode_battery(&[0xEF, 0xDD, 0x08, 0x0A, 0x7F]), None);
        assert_eq!(decode_battery(&[0xEF, 0xDD, 0x08]), None);
    }
}
