//! Catalog of Tacx Bushido / Genius data pages
//!
//! Data pages ride in broadcast or acknowledged messages as a 9-byte info
//! block: channel number, page number, then seven page bytes. Unlike the
//! dongle control messages, multi-byte page fields are big-endian. The
//! layouts were reverse engineered from live traffic; several bytes are
//! observed-but-unmodeled and are reported at `debug!` when nonzero rather
//! than given invented meaning.

use crate::error::{BridgeError, Result};
use crate::types::{BrakeAlarm, ButtonEvent, CalibrationState, HeadUnitMode};
use tracing::debug;

/// Identity / serial page number (0xAD)
pub const PAGE_IDENTITY: u8 = 173;

/// Head-unit heartbeat / command page number (0xAC)
pub const PAGE_HEARTBEAT: u8 = 172;

/// Which device produced a data payload
///
/// Page 1 carries brake power when the brake sends it and a resistance
/// command when a head unit sends it; the page number alone cannot tell
/// them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrigin {
    /// Payload arrived from the brake (the bridge slave channel)
    Brake,
    /// Payload arrived from a head unit or TTS
    HeadUnit,
}

/// A decoded data page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPage {
    /// Page 0, seen from TTS at very low speed; content unmodeled
    Status {
        /// Sub-page byte
        sub: u8,
        /// The six remaining page bytes
        raw: [u8; 6],
    },
    /// Page 1 from the brake: measured power and two force components
    BrakePower {
        /// Power in watts
        power: u16,
        /// Left/right force component
        force_left: u16,
        /// Left/right force component
        force_right: u16,
    },
    /// Page 1 from a head unit: commanded brake resistance
    TargetResistance {
        /// Signed resistance (sign byte times magnitude byte)
        resistance: i16,
    },
    /// Page 2: wheel speed, cadence and pedalling balance
    SpeedCadenceBalance {
        /// Wheel speed in km/h x 10
        speed_dkmh: u16,
        /// Cadence in rpm
        cadence: u8,
        /// Left/right balance in percent
        balance: u8,
    },
    /// Page 4: virtual speed plus two unknown resistance fields
    VirtualSpeed {
        /// Virtual speed byte
        vspeed: u8,
        /// Unknown resistance field
        resistance_1: u16,
        /// Unknown resistance field
        resistance_2: u16,
    },
    /// Page 8: 24-bit counter, resets when pedalling stops
    DistanceCounter {
        /// Counter value
        count: u32,
    },
    /// Page 16: brake alarm bitmask and temperature
    BrakeStatus {
        /// Alarm bitmask
        alarm: BrakeAlarm,
        /// Brake temperature
        temperature: u8,
    },
    /// Page 34 (0x22): brake-side calibration progress
    BrakeCalibration {
        /// Sub-page / phase byte
        sub: u8,
        /// Powerback reading
        powerback: u8,
        /// Calibration code (0x42 marks a value report)
        code: u8,
        /// Calibration value in tenths
        value_tenths: u8,
    },
    /// Page 35 (0x23): head-unit calibration command
    HeadCalibration {
        /// Command byte (0x63 start, 0x58 status, 0x4D value request)
        command: u8,
    },
    /// Page 172 (0xAC): head-unit heartbeat / command
    Heartbeat {
        /// Command byte (0x03 requests a mode change)
        command: u8,
        /// Mode argument
        mode: u8,
    },
    /// Page 173 (0xAD) sub 1: serial identity and current mode
    SerialNumber {
        /// Reported head-unit mode
        mode: HeadUnitMode,
        /// Production year minus 2000
        year: u8,
        /// Device number
        device_number: u16,
    },
    /// Page 173 (0xAD) sub 2: software version
    SoftwareVersion {
        /// Major version
        major: u8,
        /// Minor version
        minor: u8,
        /// Revision
        revision: u16,
    },
    /// Page 220 (0xDC) sub 1: training target
    TrainingTarget {
        /// Brake mode (0 slope, 1 power, 2 heart rate)
        mode: u8,
        /// Target value; slope targets are in tenths of a percent
        target: i16,
        /// Rider plus bicycle weight in kg
        weight: u8,
    },
    /// Page 220 (0xDC) sub 2: wind simulation parameters
    WindSimulation {
        /// 0.5 x drag coefficient x 1000
        coefficient: u16,
        /// Wind speed in m/s x 250, head wind negative
        wind_speed: i16,
    },
    /// Page 220 (0xDC) sub 4: calibration action command
    CalibrationAction {
        /// 0 stop, 1 start, 2 request info
        action: u8,
    },
    /// Page 221 (0xDD) sub 1: speed, power, cadence, balance
    SpeedPowerCadence {
        /// Speed in km/h x 10
        speed_dkmh: u16,
        /// Power in watts
        power: u16,
        /// Cadence in rpm
        cadence: u8,
        /// Left/right balance in percent
        balance: u8,
    },
    /// Page 221 (0xDD) sub 2: distance and heart rate
    DistanceHeartRate {
        /// Distance in meters
        distance: u32,
        /// Heart rate in bpm
        heart_rate: u8,
    },
    /// Page 221 (0xDD) sub 3: alarm, temperature, powerback
    AlarmTemperature {
        /// Alarm bitmask
        alarm: BrakeAlarm,
        /// Brake temperature
        temperature: u8,
        /// Powerback in watts
        powerback: u16,
    },
    /// Page 221 (0xDD) sub 4: calibration state and value
    CalibrationStatus {
        /// Reported state
        state: CalibrationState,
        /// Calibration value in tenths
        value_tenths: u16,
    },
    /// Page 221 (0xDD) sub 0x10: head-unit button press
    ButtonPress(ButtonEvent),
    /// Any page this catalog does not model; still forwardable
    Unknown {
        /// Page number
        page: u8,
        /// Sub-page byte when the payload carries one
        sub: Option<u8>,
    },
}

fn be_u16(payload: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([payload[at], payload[at + 1]])
}

fn be_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([
        payload[at],
        payload[at + 1],
        payload[at + 2],
        payload[at + 3],
    ])
}

fn check_zero(page: u8, payload: &[u8], offsets: &[usize]) {
    for &at in offsets {
        if payload[at] != 0 {
            debug!(
                page,
                offset = at,
                value = format_args!("{:02X}", payload[at]),
                "reserved page byte not zero"
            );
        }
    }
}

impl DataPage {
    /// Decode a 9-byte data payload
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Frame`] for payloads shorter than the 9-byte
    /// info block. Unrecognized pages are not an error; they decode to
    /// [`DataPage::Unknown`].
    pub fn decode(payload: &[u8], origin: PageOrigin) -> Result<Self> {
        if payload.len() < 9 {
            return Err(BridgeError::Frame(format!(
                "data payload too short: {} bytes",
                payload.len()
            )));
        }
        let page = payload[1];
        let sub = payload[2];

        let decoded = match (page, sub) {
            (0, _) => {
                let mut raw = [0u8; 6];
                raw.copy_from_slice(&payload[3..9]);
                if raw.iter().any(|&b| b != 0) {
                    debug!(sub, ?raw, "status page content");
                }
                Self::Status { sub, raw }
            }
            (1, _) if origin == PageOrigin::Brake => {
                check_zero(page, payload, &[8]);
                Self::BrakePower {
                    force_left: be_u16(payload, 2),
                    power: be_u16(payload, 4),
                    force_right: be_u16(payload, 6),
                }
            }
            (1, _) => {
                check_zero(page, payload, &[4, 5, 6, 7, 8]);
                let sign = i16::from(payload[2] as i8);
                Self::TargetResistance {
                    resistance: sign * i16::from(payload[3]),
                }
            }
            (2, _) => {
                check_zero(page, payload, &[6, 7, 8]);
                Self::SpeedCadenceBalance {
                    speed_dkmh: be_u16(payload, 2),
                    cadence: payload[4],
                    balance: payload[5],
                }
            }
            (4, _) => {
                check_zero(page, payload, &[2, 8]);
                Self::VirtualSpeed {
                    vspeed: payload[3],
                    resistance_1: be_u16(payload, 4),
                    resistance_2: be_u16(payload, 6),
                }
            }
            (8, _) => {
                check_zero(page, payload, &[2, 6, 7, 8]);
                Self::DistanceCounter {
                    count: u32::from(payload[3]) << 16 | u32::from(be_u16(payload, 4)),
                }
            }
            (16, _) => {
                check_zero(page, payload, &[7, 8]);
                Self::BrakeStatus {
                    alarm: BrakeAlarm(be_u16(payload, 2)),
                    temperature: payload[4],
                }
            }
            (34, _) => Self::BrakeCalibration {
                sub,
                powerback: payload[3],
                code: payload[4],
                value_tenths: payload[6],
            },
            (35, _) => {
                check_zero(page, payload, &[3, 4, 5, 6, 7, 8]);
                Self::HeadCalibration { command: sub }
            }
            (172, _) => Self::Heartbeat {
                command: sub,
                mode: payload[3],
            },
            (173, 1) => Self::SerialNumber {
                mode: HeadUnitMode::from(payload[3]),
                year: payload[4],
                device_number: be_u16(payload, 7),
            },
            (173, 2) => {
                check_zero(page, payload, &[7, 8]);
                Self::SoftwareVersion {
                    major: payload[3],
                    minor: payload[4],
                    revision: be_u16(payload, 5),
                }
            }
            (220, 1) => Self::TrainingTarget {
                mode: payload[3],
                target: be_u16(payload, 4) as i16,
                weight: payload[6],
            },
            (220, 2) => Self::WindSimulation {
                coefficient: be_u16(payload, 3),
                wind_speed: be_u16(payload, 5) as i16,
            },
            (220, 4) => Self::CalibrationAction { action: payload[3] },
            (221, 1) => Self::SpeedPowerCadence {
                speed_dkmh: be_u16(payload, 3),
                power: be_u16(payload, 5),
                cadence: payload[7],
                balance: payload[8],
            },
            (221, 2) => Self::DistanceHeartRate {
                distance: be_u32(payload, 3),
                heart_rate: payload[7],
            },
            (221, 3) => Self::AlarmTemperature {
                alarm: BrakeAlarm(be_u16(payload, 3)),
                temperature: payload[5],
                powerback: be_u16(payload, 6),
            },
            (221, 4) => Self::CalibrationStatus {
                state: CalibrationState::from(payload[3]),
                value_tenths: be_u16(payload, 4),
            },
            (221, 0x10) => Self::ButtonPress(ButtonEvent::from_key_byte(payload[3])),
            _ => Self::Unknown {
                page,
                sub: Some(sub),
            },
        };
        Ok(decoded)
    }
}

/// Keep-alive block for the head-unit control channel; prevents power-off
#[must_use]
pub fn keep_alive(channel: u8) -> Vec<u8> {
    vec![channel, 0, 0, 0, 0, 0, 0, 0, 0]
}

/// Page 1 as the brake sends it
///
/// The force fields track power at a fixed +-50 offset in captured traffic;
/// the same derivation is used here.
#[must_use]
pub fn brake_power(channel: u8, power: u16) -> Vec<u8> {
    let force_left = power.saturating_sub(50).to_be_bytes();
    let p = power.to_be_bytes();
    let force_right = power.saturating_add(50).to_be_bytes();
    vec![
        channel,
        1,
        force_left[0],
        force_left[1],
        p[0],
        p[1],
        force_right[0],
        force_right[1],
        0,
    ]
}

/// Page 1 as a head unit sends it: target power
#[must_use]
pub fn target_power(channel: u8, power: u16) -> Vec<u8> {
    let p = power.to_be_bytes();
    vec![channel, 1, p[0], p[1], 0, 0, 0, 0, 0]
}

/// Page 2: wheel speed (km/h x 10), cadence and balance
#[must_use]
pub fn speed_cadence_balance(channel: u8, speed_dkmh: u16, cadence: u8, balance: u8) -> Vec<u8> {
    let s = speed_dkmh.to_be_bytes();
    vec![channel, 2, s[0], s[1], cadence, balance, 0, 0, 0]
}

/// Page 34 (0x22): brake calibration progress
#[must_use]
pub fn brake_calibration(channel: u8, sub: u8, code: u8, value_tenths: u8) -> Vec<u8> {
    vec![channel, 0x22, sub, 0, code, 0, value_tenths, 0, 0]
}

/// Page 35 (0x23): head-unit calibration command
#[must_use]
pub fn head_calibration(channel: u8, command: u8) -> Vec<u8> {
    vec![channel, 0x23, command, 0, 0, 0, 0, 0, 0]
}

/// Page 172 (0xAC) command 0x03: request a head-unit mode change
#[must_use]
pub fn change_mode(channel: u8, mode: HeadUnitMode) -> Vec<u8> {
    vec![channel, 0xAC, 0x03, mode.as_u8(), 0, 0, 0, 0, 0]
}

/// Page 173 (0xAD) sub 1: serial identity
///
/// Years before 2000 encode as offset 0.
#[must_use]
pub fn serial_number(channel: u8, year: u16, device_number: u16) -> Vec<u8> {
    let offset = year.saturating_sub(2000).min(255) as u8;
    let number = device_number.to_be_bytes();
    vec![channel, 0xAD, 0x01, 0, offset, 0, 0, number[0], number[1]]
}

/// Page 173 (0xAD) sub 2: software version
#[must_use]
pub fn software_version(channel: u8, major: u8, minor: u8, revision: u16) -> Vec<u8> {
    let rev = revision.to_be_bytes();
    vec![channel, 0xAD, 0x02, major, minor, rev[0], rev[1], 0, 0]
}

/// Page 220 (0xDC) sub 1 in power mode: target power and weight
#[must_use]
pub fn power_target(channel: u8, power: u16, weight: u8) -> Vec<u8> {
    let p = power.to_be_bytes();
    vec![channel, 0xDC, 0x01, 0x01, p[0], p[1], weight, 0, 0]
}

/// Page 220 (0xDC) sub 1 in slope mode: target slope in tenths of a percent
///
/// The wire carries a sign flag byte (0 or 255) plus the tenths value in
/// two's complement.
#[must_use]
pub fn slope_target(channel: u8, slope_tenths: i8, weight: u8) -> Vec<u8> {
    let sign = if slope_tenths < 0 { 0xFF } else { 0x00 };
    vec![
        channel,
        0xDC,
        0x01,
        0x00,
        sign,
        slope_tenths as u8,
        weight,
        0,
        0,
    ]
}

/// Page 220 (0xDC) sub 2: wind simulation parameters
#[must_use]
pub fn wind_simulation(channel: u8, coefficient: u16, wind_speed: i16) -> Vec<u8> {
    let c = coefficient.to_be_bytes();
    let w = wind_speed.to_be_bytes();
    vec![channel, 0xDC, 0x02, c[0], c[1], w[0], w[1], 0, 0]
}

/// Page 220 (0xDC) sub 4: calibration action (0 stop, 1 start, 2 request)
#[must_use]
pub fn calibration_action(channel: u8, action: u8) -> Vec<u8> {
    vec![channel, 0xDC, 0x04, action, 0, 0, 0, 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Button, PressDuration};

    #[test]
    fn test_brake_power_layout_at_237_watts() {
        let info = brake_power(7, 237);
        assert_eq!(
            info,
            vec![7, 1, 0x00, 0xBB, 0x00, 0xED, 0x01, 0x1F, 0x00]
        );

        let page = DataPage::decode(&info, PageOrigin::Brake).unwrap();
        assert_eq!(
            page,
            DataPage::BrakePower {
                power: 237,
                force_left: 187,
                force_right: 287,
            }
        );
    }

    #[test]
    fn test_page_one_direction_disambiguation() {
        // Same page number, opposite meanings per sender
        let info = [6u8, 1, 0xFF, 0x0C, 0, 0, 0, 0, 0];
        let page = DataPage::decode(&info, PageOrigin::HeadUnit).unwrap();
        assert_eq!(page, DataPage::TargetResistance { resistance: -12 });

        let page = DataPage::decode(&info, PageOrigin::Brake).unwrap();
        assert!(matches!(page, DataPage::BrakePower { .. }));
    }

    #[test]
    fn test_speed_cadence_balance_round_trip() {
        let info = speed_cadence_balance(7, 325, 92, 51);
        let page = DataPage::decode(&info, PageOrigin::Brake).unwrap();
        assert_eq!(
            page,
            DataPage::SpeedCadenceBalance {
                speed_dkmh: 325,
                cadence: 92,
                balance: 51,
            }
        );
    }

    #[test]
    fn test_distance_counter_spans_three_bytes() {
        let info = [7u8, 8, 0, 0x01, 0x00, 0x10, 0, 0, 0];
        let page = DataPage::decode(&info, PageOrigin::Brake).unwrap();
        assert_eq!(page, DataPage::DistanceCounter { count: 0x0001_0010 });
    }

    #[test]
    fn test_brake_status_alarm() {
        let info = [7u8, 16, 0x00, 0x08, 57, 0, 0, 0, 0];
        let page = DataPage::decode(&info, PageOrigin::Brake).unwrap();
        assert_eq!(
            page,
            DataPage::BrakeStatus {
                alarm: BrakeAlarm(8),
                temperature: 57,
            }
        );
    }

    #[test]
    fn test_serial_identity_round_trip() {
        let info = serial_number(6, 2020, 2020);
        assert_eq!(info, vec![6, 0xAD, 0x01, 0, 20, 0, 0, 0x07, 0xE4]);

        let page = DataPage::decode(&info, PageOrigin::HeadUnit).unwrap();
        assert_eq!(
            page,
            DataPage::SerialNumber {
                mode: HeadUnitMode::Normal,
                year: 20,
                device_number: 2020,
            }
        );
    }

    #[test]
    fn test_software_version_round_trip() {
        let info = software_version(7, 1, 2, 3456);
        let page = DataPage::decode(&info, PageOrigin::HeadUnit).unwrap();
        assert_eq!(
            page,
            DataPage::SoftwareVersion {
                major: 1,
                minor: 2,
                revision: 3456,
            }
        );
    }

    #[test]
    fn test_negative_slope_target_encoding() {
        // -2.5 percent: sign flag set, tenths in two's complement
        let info = slope_target(5, -25, 78);
        assert_eq!(info[4], 0xFF);
        assert_eq!(info[5], 0xE7);
        assert_eq!(info[6], 78);
    }

    #[test]
    fn test_genius_speed_power_cadence() {
        let info = [5u8, 221, 0x01, 0x01, 0x41, 0x00, 0xB4, 90, 50];
        let page = DataPage::decode(&info, PageOrigin::HeadUnit).unwrap();
        assert_eq!(
            page,
            DataPage::SpeedPowerCadence {
                speed_dkmh: 321,
                power: 180,
                cadence: 90,
                balance: 50,
            }
        );
    }

    #[test]
    fn test_button_page() {
        let info = [5u8, 221, 0x10, 0x82, 0, 0, 0, 0, 1];
        let page = DataPage::decode(&info, PageOrigin::HeadUnit).unwrap();
        let DataPage::ButtonPress(event) = page else {
            panic!("expected a button press, got {page:?}");
        };
        assert_eq!(event.button, Button::Up);
        assert_eq!(event.duration, PressDuration::Long);
    }

    #[test]
    fn test_status_page_keeps_raw_bytes() {
        let info = [7u8, 0, 2, 0x11, 0, 0x42, 0, 0, 0x09];
        let page = DataPage::decode(&info, PageOrigin::Brake).unwrap();
        assert_eq!(
            page,
            DataPage::Status {
                sub: 2,
                raw: [0x11, 0, 0x42, 0, 0, 0x09],
            }
        );
    }

    #[test]
    fn test_unrecognized_page_is_not_an_error() {
        let info = [7u8, 99, 3, 0, 0, 0, 0, 0, 0];
        let page = DataPage::decode(&info, PageOrigin::Brake).unwrap();
        assert_eq!(
            page,
            DataPage::Unknown {
                page: 99,
                sub: Some(3),
            }
        );
    }

    #[test]
    fn test_short_payload_is_rejected() {
        assert!(DataPage::decode(&[7, 1, 0], PageOrigin::Brake).is_err());
    }

    #[test]
    fn test_mode_change_command() {
        let info = change_mode(5, HeadUnitMode::PcMode);
        assert_eq!(info, vec![5, 0xAC, 0x03, 4, 0, 0, 0, 0, 0]);

        let page = DataPage::decode(&info, PageOrigin::HeadUnit).unwrap();
        assert_eq!(
            page,
            DataPage::Heartbeat {
                command: 0x03,
                mode: 4,
            }
        );
    }
}
