//! Channel configuration and the pairing state machine
//!
//! The bridge runs up to three channels: a master channel the far slave
//! (head unit or TTS) connects to, a slave channel that follows the real
//! master (the brake), and an optional slave channel for a locally attached
//! head unit used as a remote control. All three share the trainer session
//! constants: private network 1, 2460 MHz, period 0x1000.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::pages;
use crate::protocol::{ChannelId, ChannelType, Message, MessageId};

/// Master or slave end of an ANT channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelRole {
    /// Transmitting end; owns the device number
    Master,
    /// Receiving/searching end; learns the device number from the master
    Slave,
}

/// The identity a bridge channel presents in its serial and version pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeIdentity {
    /// Production year reported in the serial page
    pub year: u16,
    /// Device number reported in the serial page
    pub device_number: u16,
    /// Software version (major, minor, revision)
    pub version: (u8, u8, u16),
}

/// Identity presented on slave-role channels
pub const SLAVE_IDENTITY: BridgeIdentity = BridgeIdentity {
    year: 2015,
    device_number: 2015,
    version: (1, 2, 3456),
};

/// Identity presented on the master channel
pub const MASTER_IDENTITY: BridgeIdentity = BridgeIdentity {
    year: 2020,
    device_number: 2020,
    version: (5, 6, 7890),
};

/// The serial and software-version broadcasts for one channel
///
/// Real Tacx components announce themselves with these two pages; peers
/// that see them know they are talking to the bridge end, not through it.
#[must_use]
pub fn identity_messages(channel: u8, role: ChannelRole) -> Vec<Message> {
    let identity = match role {
        ChannelRole::Master => MASTER_IDENTITY,
        ChannelRole::Slave => SLAVE_IDENTITY,
    };
    vec![
        Message::broadcast_data(pages::serial_number(
            channel,
            identity.year,
            identity.device_number,
        )),
        Message::broadcast_data(pages::software_version(
            channel,
            identity.version.0,
            identity.version.1,
            identity.version.2,
        )),
    ]
}

/// Full configuration of one bridge channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel number on the dongle
    pub number: u8,
    /// Master or slave
    pub role: ChannelRole,
    /// Device number; 0 is the search wildcard on slave channels
    pub device_number: u16,
    /// Device type to present or search for
    pub device_type: u8,
    /// Transmission type field of the channel ID
    pub transmission_type: u8,
    /// Network the channel is assigned to
    pub network: u8,
    /// RF frequency offset from 2400 MHz
    pub rf_frequency: u8,
    /// Channel period in 1/32768 s units
    pub period: u16,
    /// Transmit power setting
    pub transmit_power: u8,
}

impl ChannelConfig {
    const fn with_session_defaults(
        number: u8,
        role: ChannelRole,
        device_number: u16,
        device_type: u8,
        transmission_type: u8,
    ) -> Self {
        Self {
            number,
            role,
            device_number,
            device_type,
            transmission_type,
            network: crate::NETWORK_BRIDGE,
            rf_frequency: crate::RF_FREQUENCY_2460MHZ,
            period: crate::CHANNEL_PERIOD,
            transmit_power: crate::TRANSMIT_POWER_0DBM,
        }
    }

    /// The channel the far slave (head unit or TTS) connects to
    #[must_use]
    pub const fn bridge_master(device_type: u8, device_number: u16) -> Self {
        Self::with_session_defaults(
            crate::CHANNEL_BRIDGE_MASTER,
            ChannelRole::Master,
            device_number,
            device_type,
            crate::TRANSMISSION_TYPE_IC,
        )
    }

    /// The channel that follows the real master device
    #[must_use]
    pub const fn bridge_slave(device_type: u8) -> Self {
        Self::with_session_defaults(
            crate::CHANNEL_BRIDGE_SLAVE,
            ChannelRole::Slave,
            0,
            device_type,
            0,
        )
    }

    /// The control channel for a locally attached head unit
    #[must_use]
    pub const fn head_unit_control() -> Self {
        Self::with_session_defaults(
            crate::CHANNEL_HEAD_UNIT,
            ChannelRole::Slave,
            0,
            crate::DEVICE_TYPE_HEAD_UNIT,
            0,
        )
    }

    /// The fixed batch that assigns and opens this channel
    #[must_use]
    pub fn configuration_messages(&self) -> Vec<Message> {
        let channel_type = match self.role {
            ChannelRole::Master => ChannelType::BidirectionalTransmit,
            ChannelRole::Slave => ChannelType::BidirectionalReceive,
        };
        vec![
            Message::assign_channel(self.number, channel_type, self.network),
            Message::channel_id(
                self.number,
                self.device_number,
                self.device_type,
                self.transmission_type,
            ),
            Message::rf_frequency(self.number, self.rf_frequency),
            Message::channel_period(self.number, self.period),
            Message::transmit_power(self.number, self.transmit_power),
            Message::open_channel(self.number),
        ]
    }
}

/// Pairing progress of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    /// Channel not assigned yet
    Unconfigured,
    /// Channel open, polling for a channel ID with a real device number
    Searching,
    /// Peer found
    Paired,
}

/// Outcome of one pairing cycle
#[derive(Debug, Default)]
pub struct PairingPoll {
    /// Messages to write this cycle
    pub outbound: Vec<Message>,
    /// True exactly once, on the poll that reached [`PairingState::Paired`]
    pub newly_paired: bool,
}

/// Poll-driven pairing for one channel
///
/// The session drives this at its own pace (two cycles per second against
/// real hardware); `poll` never sleeps, so tests iterate it directly.
#[derive(Debug)]
pub struct PairingSession {
    config: ChannelConfig,
    state: PairingState,
    iteration: u32,
    discovered_number: Option<u16>,
}

impl PairingSession {
    /// New session in [`PairingState::Unconfigured`]
    #[must_use]
    pub const fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            state: PairingState::Unconfigured,
            iteration: 0,
            discovered_number: None,
        }
    }

    /// Channel number this session pairs
    #[must_use]
    pub const fn channel(&self) -> u8 {
        self.config.number
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> PairingState {
        self.state
    }

    /// True once the peer is found
    #[must_use]
    pub const fn is_paired(&self) -> bool {
        matches!(self.state, PairingState::Paired)
    }

    /// Device number learned from the master, for slave-role channels
    #[must_use]
    pub const fn device_number(&self) -> Option<u16> {
        self.discovered_number
    }

    /// Advance one cycle
    ///
    /// The first poll emits the configuration batch and starts searching.
    /// While searching, each poll requests the channel ID and inspects the
    /// replies: the expected device type with a nonzero device number pairs
    /// a slave channel (the wildcard 0 means the master has not assigned
    /// one yet); a master channel pairs on device type alone since the
    /// number transmitted is its own. The pairing poll's outbound batch is
    /// this channel's identity broadcasts, sent exactly once.
    pub fn poll(&mut self, received: &[Message]) -> PairingPoll {
        match self.state {
            PairingState::Unconfigured => {
                info!(
                    channel = self.config.number,
                    role = ?self.config.role,
                    device_type = self.config.device_type,
                    "configuring channel"
                );
                self.state = PairingState::Searching;
                self.iteration = 0;
                let mut outbound = self.config.configuration_messages();
                outbound.push(Message::request_message(
                    self.config.number,
                    MessageId::ChannelId,
                ));
                PairingPoll {
                    outbound,
                    newly_paired: false,
                }
            }
            PairingState::Searching => {
                self.iteration += 1;
                if self.try_pair(received) {
                    self.state = PairingState::Paired;
                    PairingPoll {
                        outbound: identity_messages(self.config.number, self.config.role),
                        newly_paired: true,
                    }
                } else {
                    PairingPoll {
                        outbound: vec![Message::request_message(
                            self.config.number,
                            MessageId::ChannelId,
                        )],
                        newly_paired: false,
                    }
                }
            }
            PairingState::Paired => PairingPoll::default(),
        }
    }

    /// Back to square one; used when the dongle link was rebuilt
    pub fn reset(&mut self) {
        self.state = PairingState::Unconfigured;
        self.iteration = 0;
        self.discovered_number = None;
    }

    fn try_pair(&mut self, received: &[Message]) -> bool {
        for message in received {
            if message.id != MessageId::ChannelId {
                continue;
            }
            let Ok(id) = ChannelId::decode(message) else {
                continue;
            };
            if id.channel != self.config.number {
                continue;
            }
            if id.device_type != self.config.device_type {
                debug!(
                    channel = id.channel,
                    device_type = id.device_type,
                    "ignoring channel ID with unexpected device type"
                );
                continue;
            }
            match self.config.role {
                ChannelRole::Master => {
                    info!(
                        channel = self.config.number,
                        device_number = id.device_number,
                        "connected as master"
                    );
                    return true;
                }
                ChannelRole::Slave if id.device_number != 0 => {
                    info!(
                        channel = self.config.number,
                        device_number = id.device_number,
                        "found master device"
                    );
                    self.discovered_number = Some(id.device_number);
                    return true;
                }
                ChannelRole::Slave => {
                    if self.iteration % 10 == 0 {
                        info!(
                            channel = self.config.number,
                            iteration = self.iteration,
                            "device number not assigned yet"
                        );
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_id_reply(channel: u8, device_number: u16, device_type: u8) -> Message {
        Message::channel_id(channel, device_number, device_type, 1)
    }

    #[test]
    fn test_first_poll_emits_configuration_batch() {
        let mut session = PairingSession::new(ChannelConfig::bridge_slave(81));
        let poll = session.poll(&[]);

        let ids: Vec<MessageId> = poll.outbound.iter().map(|m| m.id).collect();
        assert_eq!(
            ids,
            vec![
                MessageId::AssignChannel,
                MessageId::ChannelId,
                MessageId::RfFrequency,
                MessageId::ChannelPeriod,
                MessageId::TransmitPower,
                MessageId::OpenChannel,
                MessageId::RequestMessage,
            ]
        );
        assert_eq!(session.state(), PairingState::Searching);
        // Slave searches with the wildcard device number
        assert_eq!(poll.outbound[1].payload[1..3], [0, 0]);
    }

    #[test]
    fn test_slave_pairs_when_number_assigned() {
        let mut session = PairingSession::new(ChannelConfig::bridge_slave(81));
        session.poll(&[]);

        // Wildcard replies keep it searching
        let wildcard = channel_id_reply(7, 0, 81);
        for _ in 0..12 {
            let poll = session.poll(std::slice::from_ref(&wildcard));
            assert!(!poll.newly_paired);
            assert_eq!(poll.outbound.len(), 1);
            assert_eq!(poll.outbound[0].id, MessageId::RequestMessage);
        }

        // The cycle after the master assigns a number pairs
        let poll = session.poll(&[channel_id_reply(7, 57591, 81)]);
        assert!(poll.newly_paired);
        assert!(session.is_paired());
        assert_eq!(session.device_number(), Some(57591));

        // Identity broadcasts go out exactly once
        assert_eq!(poll.outbound.len(), 2);
        assert!(poll
            .outbound
            .iter()
            .all(|m| m.id == MessageId::BroadcastData));
        assert_eq!(poll.outbound[0].payload[1], 0xAD);

        // Paired sessions stay quiet
        let poll = session.poll(&[channel_id_reply(7, 57591, 81)]);
        assert!(poll.outbound.is_empty());
        assert!(!poll.newly_paired);
    }

    #[test]
    fn test_wrong_device_type_never_pairs() {
        let mut session = PairingSession::new(ChannelConfig::bridge_slave(81));
        session.poll(&[]);

        for _ in 0..50 {
            let poll = session.poll(&[channel_id_reply(7, 1234, 82)]);
            assert!(!poll.newly_paired);
        }
        assert!(!session.is_paired());
    }

    #[test]
    fn test_master_pairs_on_type_match_alone() {
        let mut session = PairingSession::new(ChannelConfig::bridge_master(81, 6666));
        session.poll(&[]);

        let poll = session.poll(&[channel_id_reply(6, 6666, 81)]);
        assert!(poll.newly_paired);
        // The master's number is its own, not a discovery
        assert_eq!(session.device_number(), None);
    }

    #[test]
    fn test_replies_for_other_channels_are_ignored() {
        let mut session = PairingSession::new(ChannelConfig::bridge_slave(81));
        session.poll(&[]);

        let poll = session.poll(&[channel_id_reply(6, 57591, 81)]);
        assert!(!poll.newly_paired);
        assert!(!session.is_paired());
    }

    #[test]
    fn test_reset_clears_discovery() {
        let mut session = PairingSession::new(ChannelConfig::bridge_slave(81));
        session.poll(&[]);
        session.poll(&[channel_id_reply(7, 57591, 81)]);
        assert!(session.is_paired());

        session.reset();
        assert_eq!(session.state(), PairingState::Unconfigured);
        assert_eq!(session.device_number(), None);

        // A fresh poll reconfigures from scratch
        let poll = session.poll(&[]);
        assert_eq!(poll.outbound.len(), 7);
    }

    #[test]
    fn test_identity_constants_per_role() {
        let master = identity_messages(6, ChannelRole::Master);
        assert_eq!(master[0].payload[4], 20); // year 2020
        assert_eq!(master[0].payload[7..9], [0x07, 0xE4]); // number 2020
        assert_eq!(master[1].payload[3..5], [5, 6]);

        let slave = identity_messages(7, ChannelRole::Slave);
        assert_eq!(slave[0].payload[4], 15); // year 2015
        assert_eq!(slave[1].payload[3..5], [1, 2]);
        assert_eq!(
            u16::from_be_bytes([slave[1].payload[5], slave[1].payload[6]]),
            3456
        );
    }

    #[test]
    fn test_head_unit_control_config() {
        let config = ChannelConfig::head_unit_control();
        assert_eq!(config.number, 5);
        assert_eq!(config.device_type, 82);
        assert_eq!(config.role, ChannelRole::Slave);
        assert_eq!(config.network, 1);
        assert_eq!(config.period, 0x1000);
    }
}
