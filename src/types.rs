use serde::{Deserialize, Serialize};
use std::fmt;

/// Which trainer component the bridge impersonates on its bridged channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeSide {
    /// Sit between the brake (master) and a head unit or TTS (slave)
    Brake,
    /// Sit between the head unit (master) and TTS (slave)
    HeadUnit,
}

impl BridgeSide {
    /// ANT device type transmitted in channel IDs for this side
    #[must_use]
    pub const fn device_type(self) -> u8 {
        match self {
            Self::Brake => crate::DEVICE_TYPE_BRAKE,
            Self::HeadUnit => crate::DEVICE_TYPE_HEAD_UNIT,
        }
    }
}

impl fmt::Display for BridgeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Brake => write!(f, "Bushido Brake"),
            Self::HeadUnit => write!(f, "Head Unit"),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Device type the bridged channels impersonate
    pub side: BridgeSide,
    /// Device number the bridge master transmits
    pub master_device_number: u16,
    /// Also pair the head-unit control channel (needed to drive the brake
    /// through a locally attached head unit)
    pub pair_head_unit: bool,
    /// Restrict dongle probing to one USB product ID
    pub dongle_product_id: Option<u16>,
    /// Reconnect attempts (1 s apart) before a lost dongle is fatal
    pub reconnect_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            side: BridgeSide::Brake,
            master_device_number: crate::DEFAULT_MASTER_DEVICE_NUMBER,
            pair_head_unit: false,
            dongle_product_id: None,
            reconnect_attempts: 600,
        }
    }
}

/// Operating mode of the Tacx head unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadUnitMode {
    /// Head unit commands the trainer on its own
    Normal,
    /// Reset the odometer
    ResetDistance,
    /// Head unit accepts training targets
    Training,
    /// Training paused ("start cycling" on the display)
    TrainingPause,
    /// Head unit only relays buttons to the controlling application
    PcMode,
    /// Mode byte not seen before
    Unknown(u8),
}

impl HeadUnitMode {
    /// Wire value used in mode-change commands
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::ResetDistance => 1,
            Self::Training => 2,
            Self::TrainingPause => 3,
            Self::PcMode => 4,
            Self::Unknown(value) => value,
        }
    }
}

impl From<u8> for HeadUnitMode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::ResetDistance,
            2 => Self::Training,
            3 => Self::TrainingPause,
            4 => Self::PcMode,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for HeadUnitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::ResetDistance => write!(f, "ResetDistance"),
            Self::Training => write!(f, "Training"),
            Self::TrainingPause => write!(f, "TrainingPause"),
            Self::PcMode => write!(f, "PcMode"),
            Self::Unknown(value) => write!(f, "Unknown(0x{value:02X})"),
        }
    }
}

/// Head-unit front panel button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Button {
    /// No button (key release / filler)
    None,
    /// Left arrow
    Left,
    /// Up arrow
    Up,
    /// Enter / OK
    Enter,
    /// Down arrow
    Down,
    /// Right arrow
    Right,
    /// Key code not seen before
    Unknown(u8),
}

impl From<u8> for Button {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Left,
            2 => Self::Up,
            3 => Self::Enter,
            4 => Self::Down,
            5 => Self::Right,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Left => write!(f, "Left"),
            Self::Up => write!(f, "Up"),
            Self::Enter => write!(f, "Enter"),
            Self::Down => write!(f, "Down"),
            Self::Right => write!(f, "Right"),
            Self::Unknown(value) => write!(f, "Unknown(0x{value:02X})"),
        }
    }
}

/// How long a head-unit button was held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PressDuration {
    /// Normal press
    Normal,
    /// Held longer than 0.5 s
    Long,
    /// Held longer than 2.5 s
    VeryLong,
    /// Duration flag not seen before
    Unknown(u8),
}

impl From<u8> for PressDuration {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            8 => Self::Long,
            12 => Self::VeryLong,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for PressDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Long => write!(f, "long"),
            Self::VeryLong => write!(f, "very long"),
            Self::Unknown(value) => write!(f, "duration flag {value}"),
        }
    }
}

/// A decoded head-unit button press
///
/// The wire encodes the key code in the low nibble and the duration flag in
/// the high nibble of a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonEvent {
    /// Which button
    pub button: Button,
    /// How long it was held
    pub duration: PressDuration,
}

impl ButtonEvent {
    /// Decode from the packed key byte
    #[must_use]
    pub fn from_key_byte(value: u8) -> Self {
        Self {
            button: Button::from(value & 0x0F),
            duration: PressDuration::from((value >> 4) & 0x0F),
        }
    }
}

/// Brake alarm bitmask as reported in brake status pages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrakeAlarm(pub u16);

impl BrakeAlarm {
    /// True when no alarm is raised
    #[must_use]
    pub const fn is_clear(self) -> bool {
        self.0 == 0
    }

    /// Human-readable description of known alarm codes
    #[must_use]
    pub const fn describe(self) -> Option<&'static str> {
        match self.0 {
            1 => Some("temperature warning level 1"),
            2 => Some("temperature warning level 2"),
            3 => Some("temperature warning level 3"),
            4 => Some("temperature warning level 4"),
            5 => Some("temperature warning level 5"),
            8 => Some("overvoltage"),
            16 => Some("overcurrent level 1"),
            32 => Some("overcurrent level 2"),
            128 => Some("overspeeding"),
            256 => Some("undervoltage"),
            512 => Some("communication error"),
            _ => None,
        }
    }
}

impl fmt::Display for BrakeAlarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.describe() {
            Some(text) => write!(f, "{text} (0b{:010b})", self.0),
            None => write!(f, "0b{:010b}", self.0),
        }
    }
}

/// Brake calibration status as reported in calibration info pages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationState {
    /// Calibration not running
    #[default]
    Stopped,
    /// Calibration run accepted
    Started,
    /// Run-off in progress
    Running,
    /// Calibration completed
    Calibrated,
    /// Brake reports no stored calibration
    Uncalibrated,
    /// Calibration value out of range
    ValueError,
    /// Pedalling detected during run-off
    CadenceError,
    /// Speed not reached or run-off timed out
    SpeedError,
    /// State byte not seen before
    Unknown(u8),
}

impl From<u8> for CalibrationState {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Stopped,
            0x01 => Self::Started,
            0x02 => Self::Running,
            0x03 => Self::Calibrated,
            0x04 => Self::Uncalibrated,
            0x81 => Self::ValueError,
            0x82 => Self::CadenceError,
            0x83 => Self::SpeedError,
            other => Self::Unknown(other),
        }
    }
}

/// Riding metrics reported by one side of the bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideTelemetry {
    /// Power in watts
    pub power: u16,
    /// Wheel speed in km/h x 10
    pub speed_dkmh: u16,
    /// Cadence in rpm
    pub cadence: u8,
    /// Left/right pedalling balance in percent
    pub balance: u8,
    /// Brake temperature
    pub temperature: u8,
    /// Distance counter
    pub distance: u32,
    /// Powerback (regenerated power) in watts
    pub powerback: u16,
    /// Alarm bitmask
    pub alarm: BrakeAlarm,
}

/// Last-known values decoded from bridged traffic
///
/// Routing never reads this; it only feeds the export sink and log output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Values reported by the brake (bridge slave channel)
    pub brake: SideTelemetry,
    /// Values reported by the head unit (control channel)
    pub head_unit: SideTelemetry,
    /// Virtual speed byte from brake page 4
    pub virtual_speed: u8,
    /// First unknown resistance field from brake page 4
    pub brake_resistance_1: u16,
    /// Second unknown resistance field from brake page 4
    pub brake_resistance_2: u16,
    /// Left force component from brake power pages
    pub force_left: u16,
    /// Right force component from brake power pages
    pub force_right: u16,
    /// Resistance commanded by the far head unit (bridge master channel)
    pub target_resistance: i16,
    /// Training target last sent through the control channel
    pub target: i16,
    /// Brake calibration state
    pub calibration_state: CalibrationState,
    /// Brake calibration value in tenths
    pub calibration_value: u16,
}

/// Names of the snapshot fields that changed between two cycles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedFields {
    /// Field names, stable identifiers usable as CSV column keys
    pub fields: Vec<&'static str>,
}

impl ChangedFields {
    /// True when nothing changed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when the named field changed
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains(&name)
    }
}

macro_rules! diff_fields {
    ($out:ident, $new:expr, $old:expr, $($field:ident => $name:literal),+ $(,)?) => {
        $( if $new.$field != $old.$field { $out.push($name); } )+
    };
}

impl TelemetrySnapshot {
    /// Compare against a previous snapshot
    ///
    /// Pure; neither snapshot is modified and the result depends only on the
    /// two inputs.
    #[must_use]
    pub fn diff(&self, old: &Self) -> ChangedFields {
        let mut fields = Vec::new();
        diff_fields!(fields, self.brake, old.brake,
            power => "br_power",
            speed_dkmh => "br_speed",
            cadence => "br_cadence",
            balance => "br_balance",
            temperature => "br_temp",
            distance => "br_distance",
            powerback => "br_pback",
            alarm => "br_alarm",
        );
        diff_fields!(fields, self.head_unit, old.head_unit,
            power => "hu_power",
            speed_dkmh => "hu_speed",
            cadence => "hu_cadence",
            balance => "hu_balance",
            temperature => "hu_temp",
            distance => "hu_distance",
            powerback => "hu_pback",
            alarm => "hu_alarm",
        );
        diff_fields!(fields, self, old,
            virtual_speed => "br_vspeed",
            brake_resistance_1 => "br_res1",
            brake_resistance_2 => "br_res2",
            force_left => "br_force_l",
            force_right => "br_force_r",
            target_resistance => "hu_res",
            target => "hu_target",
            calibration_state => "cal_state",
            calibration_value => "cal_value",
        );
        ChangedFields { fields }
    }
}

/// Direction of a recorded frame relative to the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Received from the dongle
    Rx,
    /// Written to the dongle
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => write!(f, "RX"),
            Self::Tx => write!(f, "TX"),
        }
    }
}

/// One data frame as seen on a channel, for export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Channel the frame was seen on
    pub channel: u8,
    /// Data page number
    pub page: u8,
    /// The seven page bytes after the page number
    pub data: [u8; 7],
    /// RX or TX
    pub direction: Direction,
}

impl FrameRecord {
    /// Build from a 9-byte data payload; `None` for short payloads
    #[must_use]
    pub fn from_payload(payload: &[u8], direction: Direction) -> Option<Self> {
        if payload.len() < 9 {
            return None;
        }
        let mut data = [0u8; 7];
        data.copy_from_slice(&payload[2..9]);
        Some(Self {
            channel: payload[0],
            page: payload[1],
            data,
            direction,
        })
    }
}

/// Export boundary for frame and telemetry rows
///
/// The session calls this synchronously from its loop; implementations
/// should not block for long.
pub trait ExportSink: Send {
    /// One decoded data frame, RX or TX
    fn record_frame(&mut self, record: &FrameRecord);
    /// Snapshot after a cycle in which at least one field changed
    fn record_telemetry(&mut self, snapshot: &TelemetrySnapshot, changed: &ChangedFields);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ExportSink for NullSink {
    fn record_frame(&mut self, _record: &FrameRecord) {}
    fn record_telemetry(&mut self, _snapshot: &TelemetrySnapshot, _changed: &ChangedFields) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_button_event_nibbles() {
        let event = ButtonEvent::from_key_byte(0x82);
        assert_eq!(event.button, Button::Up);
        assert_eq!(event.duration, PressDuration::Long);

        let event = ButtonEvent::from_key_byte(0xC4);
        assert_eq!(event.button, Button::Down);
        assert_eq!(event.duration, PressDuration::VeryLong);

        let event = ButtonEvent::from_key_byte(0x00);
        assert_eq!(event.button, Button::None);
        assert_eq!(event.duration, PressDuration::Normal);
    }

    #[test]
    fn test_alarm_descriptions() {
        assert!(BrakeAlarm(0).is_clear());
        assert_eq!(BrakeAlarm(8).describe(), Some("overvoltage"));
        assert_eq!(BrakeAlarm(512).describe(), Some("communication error"));
        assert_eq!(BrakeAlarm(7).describe(), None);
    }

    #[test]
    fn test_head_unit_mode_round_trip() {
        for value in 0..=5u8 {
            let mode = HeadUnitMode::from(value);
            assert_eq!(mode.as_u8(), value);
        }
    }

    #[test]
    fn test_telemetry_diff_is_pure_and_named() {
        let mut current = TelemetrySnapshot::default();
        let previous = current.clone();

        current.brake.power = 180;
        current.head_unit.speed_dkmh = 321;
        current.target = 150;

        let changed = current.diff(&previous);
        assert_eq!(changed.fields, vec!["br_power", "hu_speed", "hu_target"]);

        // Same inputs, same answer; inputs untouched
        assert_eq!(current.diff(&previous), changed);
        assert_eq!(previous, TelemetrySnapshot::default());

        assert!(current.diff(&current).is_empty());
    }

    #[test]
    fn test_frame_record_from_payload() {
        let payload = [7u8, 16, 0, 1, 0, 25, 0, 0, 0];
        let record = FrameRecord::from_payload(&payload, Direction::Rx).unwrap();
        assert_eq!(record.channel, 7);
        assert_eq!(record.page, 16);
        assert_eq!(record.data, [0, 1, 0, 25, 0, 0, 0]);

        assert!(FrameRecord::from_payload(&payload[..5], Direction::Rx).is_none());
    }

    #[test]
    fn test_bridge_side_device_types() {
        assert_eq!(BridgeSide::Brake.device_type(), 81);
        assert_eq!(BridgeSide::HeadUnit.device_type(), 82);
    }
}
