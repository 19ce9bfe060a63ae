#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]

//! # antbridge 🚴
//!
//! A Rust library for man-in-the-middle bridging of Tacx Bushido indoor
//! trainers over ANT+.
//!
//! The Bushido brake and head unit talk to each other (and to the old TTS
//! training software) on a private ANT network. This library puts a USB ANT
//! dongle between them: one channel follows the real master device, a second
//! re-broadcasts everything to the slave that believes it is talking to that
//! master, and an optional third channel drives a locally attached head unit
//! as a remote control. Every frame crossing the bridge is decoded, so the
//! otherwise undocumented protocol can be observed, logged and exported
//! while both peers keep working.
//!
//! ## Reverse Engineering Details
//!
//! There is no public specification for the Bushido wire protocol. The page
//! layouts, channel parameters and pairing behavior in this library come
//! from captured traffic between original Tacx components, cross-checked
//! against the community notes in the CyclismoProject wiki and the Tacx
//! Genius gist by switchabl:
//!
//! - **Framing**: standard ANT envelope (`A4 | len | id | payload | XOR`)
//! - **Session constants**: private network 1, 2460 MHz, period 0x1000
//! - **Data pages**: power/speed/cadence, brake status and alarms,
//!   calibration sequences, identity and button pages
//! - **Pairing**: device-type filtered search with wildcard device numbers
//!
//! ## Quick Start
//!
//! ```no_run
//! use antbridge::{BridgeConfig, BridgeSession, DongleLink, NullSink, UsbDongle};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::default();
//!     let dongle = UsbDongle::open(config.dongle_product_id).await?;
//!     let link = DongleLink::new(Box::new(dongle), config.reconnect_attempts);
//!
//!     let mut session = BridgeSession::new(link, config, NullSink);
//!     session.run().await?;
//!     Ok(())
//! }
//! ```

/// Bridge routing, head-unit driving and the session loop
pub mod bridge;
/// Channel configuration and pairing
pub mod channel;
/// Error types and handling
pub mod error;
/// Data page catalog
pub mod pages;
/// ANT frame codec and control messages
pub mod protocol;
/// USB dongle transport and reconnect handling
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use bridge::{BridgeRoute, BridgeRouter, BridgeSession, HeadUnitDriver, RoutedCycle};
pub use channel::{
    identity_messages, BridgeIdentity, ChannelConfig, ChannelRole, PairingPoll, PairingSession,
    PairingState, MASTER_IDENTITY, SLAVE_IDENTITY,
};
pub use error::{BridgeError, Result};
pub use pages::{DataPage, PageOrigin};
pub use protocol::{decode_stream, ChannelId, ChannelResponse, DecodedStream, Message, MessageId};
pub use transport::{DongleLink, MockTransport, Transport, UsbDongle, DONGLE_PRODUCT_IDS};
pub use types::{
    BrakeAlarm, BridgeConfig, BridgeSide, Button, ButtonEvent, CalibrationState, ChangedFields,
    Direction, ExportSink, FrameRecord, HeadUnitMode, NullSink, PressDuration, SideTelemetry,
    TelemetrySnapshot,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Dongle channel for the optional local head unit (slave end)
pub const CHANNEL_HEAD_UNIT: u8 = 5;

/// Dongle channel the far slave connects to (bridge master end)
pub const CHANNEL_BRIDGE_MASTER: u8 = 6;

/// Dongle channel that follows the real master (bridge slave end)
pub const CHANNEL_BRIDGE_SLAVE: u8 = 7;

/// ANT device type of the Bushido brake
pub const DEVICE_TYPE_BRAKE: u8 = 81;

/// ANT device type of the Bushido head unit
pub const DEVICE_TYPE_HEAD_UNIT: u8 = 82;

/// The private network number Tacx trainer components pair on
pub const NETWORK_BRIDGE: u8 = 0x01;

/// RF frequency offset from 2400 MHz observed on Tacx trainer channels
pub const RF_FREQUENCY_2460MHZ: u8 = 60;

/// Channel period observed on Tacx trainer channels (1/32768 s units)
pub const CHANNEL_PERIOD: u16 = 0x1000;

/// 0 dBm output power setting
pub const TRANSMIT_POWER_0DBM: u8 = 0x03;

/// Independent-channel transmission type used by the bridge master
pub const TRANSMISSION_TYPE_IC: u8 = 0x01;

/// Device number the bridge master presents unless configured otherwise
pub const DEFAULT_MASTER_DEVICE_NUMBER: u16 = 6666;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_constants_match_captured_traffic() {
        assert_eq!(CHANNEL_PERIOD, 0x1000);
        assert_eq!(RF_FREQUENCY_2460MHZ, 60);
        assert_ne!(DEVICE_TYPE_BRAKE, DEVICE_TYPE_HEAD_UNIT);
    }

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
