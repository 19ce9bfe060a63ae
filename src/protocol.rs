use crate::error::{BridgeError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

/// Sync byte framing the start of every ANT message
pub const SYNC: u8 = 0xA4;

/// Bytes preceding the payload: sync, length, message id
pub const HEADER_SIZE: usize = 3;

/// The public ANT+ network key, set on network 0
pub const NETWORK_KEY_ANTPLUS: u64 = 0x45C3_72BD_FB21_A5B9;

/// The all-zero key used on the private trainer network
pub const NETWORK_KEY_TACX: u64 = 0x0000_0000_0000_0000;

/// Response code "no error" in channel-response messages
pub const RESPONSE_NO_ERROR: u8 = 0x00;

/// Initiating-id value marking a channel-response as an RF event
///
/// Channel responses carrying this value in their second payload byte are
/// transport-layer acknowledgements, not payload data, and are never
/// forwarded by the bridge.
pub const RF_EVENT: u8 = 0x01;

/// Message IDs of the ANT dongle protocol used by this bridge
///
/// The values come from the ANT Message Protocol and Usage document
/// (D00000652, rev 5.1) and were cross-checked against live dongle traffic.
/// IDs outside this set still round-trip through [`MessageId::Other`] so the
/// bridge can forward traffic it does not interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    /// Request for the dongle's ANT version string
    AntVersion,
    /// Channel response / event (0x40)
    ChannelResponse,
    /// Unassign a channel (0x41)
    UnassignChannel,
    /// Assign a channel with a type and network (0x42)
    AssignChannel,
    /// Set the channel message period (0x43)
    ChannelPeriod,
    /// Set the channel search timeout (0x44)
    SearchTimeout,
    /// Set the channel RF frequency (0x45)
    RfFrequency,
    /// Set a network key (0x46)
    SetNetworkKey,
    /// Reset the dongle (0x4A)
    ResetSystem,
    /// Open an assigned channel (0x4B)
    OpenChannel,
    /// Request a specific message on a channel (0x4D)
    RequestMessage,
    /// Broadcast data carrying a data page (0x4E)
    BroadcastData,
    /// Acknowledged data carrying a data page (0x4F)
    AcknowledgedData,
    /// Burst data; channel number shares its byte with a sequence count (0x50)
    BurstData,
    /// Set or report a channel ID (0x51)
    ChannelId,
    /// Request for the dongle's capabilities (0x54)
    Capabilities,
    /// Set the channel transmit power (0x60)
    TransmitPower,
    /// Startup notification sent after a reset (0x6F)
    StartUp,
    /// Any message id this bridge does not interpret
    Other(u8),
}

impl MessageId {
    /// Convert from the wire byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x3E => Self::AntVersion,
            0x40 => Self::ChannelResponse,
            0x41 => Self::UnassignChannel,
            0x42 => Self::AssignChannel,
            0x43 => Self::ChannelPeriod,
            0x44 => Self::SearchTimeout,
            0x45 => Self::RfFrequency,
            0x46 => Self::SetNetworkKey,
            0x4A => Self::ResetSystem,
            0x4B => Self::OpenChannel,
            0x4D => Self::RequestMessage,
            0x4E => Self::BroadcastData,
            0x4F => Self::AcknowledgedData,
            0x50 => Self::BurstData,
            0x51 => Self::ChannelId,
            0x54 => Self::Capabilities,
            0x60 => Self::TransmitPower,
            0x6F => Self::StartUp,
            other => Self::Other(other),
        }
    }

    /// Convert to the wire byte
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::AntVersion => 0x3E,
            Self::ChannelResponse => 0x40,
            Self::UnassignChannel => 0x41,
            Self::AssignChannel => 0x42,
            Self::ChannelPeriod => 0x43,
            Self::SearchTimeout => 0x44,
            Self::RfFrequency => 0x45,
            Self::SetNetworkKey => 0x46,
            Self::ResetSystem => 0x4A,
            Self::OpenChannel => 0x4B,
            Self::RequestMessage => 0x4D,
            Self::BroadcastData => 0x4E,
            Self::AcknowledgedData => 0x4F,
            Self::BurstData => 0x50,
            Self::ChannelId => 0x51,
            Self::Capabilities => 0x54,
            Self::TransmitPower => 0x60,
            Self::StartUp => 0x6F,
            Self::Other(other) => other,
        }
    }
}

/// Channel assignment type for message 0x42
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelType {
    /// Bidirectional slave (receive/search)
    BidirectionalReceive = 0x00,
    /// Bidirectional master (transmit/broadcast)
    BidirectionalTransmit = 0x10,
}

/// A single ANT message
///
/// Wire format: `A4 | len | id | payload (len bytes) | checksum`, where the
/// checksum is the XOR of all preceding bytes. For data messages the first
/// payload byte is the channel number and the second the data page number.
/// Messages are constructed by [`decode_stream`] or the typed constructors
/// and are not modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message ID
    pub id: MessageId,
    /// Payload bytes (the "info" field in ANT terms)
    pub payload: Vec<u8>,
}

/// XOR-fold over a byte slice; the ANT frame checksum
#[must_use]
pub fn checksum(frame: &[u8]) -> u8 {
    frame.iter().fold(0, |acc, b| acc ^ b)
}

impl Message {
    /// Create a new message
    #[must_use]
    pub const fn new(id: MessageId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// Serialize to the wire format, checksum included
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len() + 1);
        buf.put_u8(SYNC);
        buf.put_u8(self.payload.len() as u8);
        buf.put_u8(self.id.as_u8());
        buf.extend_from_slice(&self.payload);
        let chk = checksum(&buf);
        buf.put_u8(chk);
        buf.freeze()
    }

    /// Channel number this message addresses, if it carries one
    ///
    /// For burst data the upper three bits of the first payload byte are a
    /// sequence number and are masked off.
    #[must_use]
    pub fn channel(&self) -> Option<u8> {
        let first = *self.payload.first()?;
        if self.id == MessageId::BurstData {
            Some(first & 0b0001_1111)
        } else {
            Some(first)
        }
    }

    /// Data page number, for broadcast/acknowledged data with a payload
    #[must_use]
    pub fn page(&self) -> Option<u8> {
        if self.is_data() {
            self.payload.get(1).copied()
        } else {
            None
        }
    }

    /// Sub-page discriminator (third payload byte), when present
    #[must_use]
    pub fn sub_page(&self) -> Option<u8> {
        if self.is_data() {
            self.payload.get(2).copied()
        } else {
            None
        }
    }

    /// True for broadcast and acknowledged data messages
    #[must_use]
    pub const fn is_data(&self) -> bool {
        matches!(
            self.id,
            MessageId::BroadcastData | MessageId::AcknowledgedData
        )
    }

    /// Unassign a channel (0x41)
    #[must_use]
    pub fn unassign_channel(channel: u8) -> Self {
        Self::new(MessageId::UnassignChannel, vec![channel])
    }

    /// Assign a channel (0x42)
    #[must_use]
    pub fn assign_channel(channel: u8, channel_type: ChannelType, network: u8) -> Self {
        Self::new(
            MessageId::AssignChannel,
            vec![channel, channel_type as u8, network],
        )
    }

    /// Set the channel ID: device number, device type and transmission type (0x51)
    ///
    /// A device number of 0 is the wildcard used while searching.
    #[must_use]
    pub fn channel_id(
        channel: u8,
        device_number: u16,
        device_type: u8,
        transmission_type: u8,
    ) -> Self {
        let num = device_number.to_le_bytes();
        Self::new(
            MessageId::ChannelId,
            vec![channel, num[0], num[1], device_type, transmission_type],
        )
    }

    /// Set the channel period in 1/32768 s units (0x43)
    #[must_use]
    pub fn channel_period(channel: u8, period: u16) -> Self {
        let p = period.to_le_bytes();
        Self::new(MessageId::ChannelPeriod, vec![channel, p[0], p[1]])
    }

    /// Set the channel search timeout in 2.5 s units (0x44)
    #[must_use]
    pub fn search_timeout(channel: u8, timeout: u8) -> Self {
        Self::new(MessageId::SearchTimeout, vec![channel, timeout])
    }

    /// Set the channel RF frequency as an offset from 2400 MHz (0x45)
    #[must_use]
    pub fn rf_frequency(channel: u8, frequency: u8) -> Self {
        Self::new(MessageId::RfFrequency, vec![channel, frequency])
    }

    /// Set a network key (0x46)
    #[must_use]
    pub fn set_network_key(network: u8, key: u64) -> Self {
        let mut payload = vec![network];
        payload.extend_from_slice(&key.to_le_bytes());
        Self::new(MessageId::SetNetworkKey, payload)
    }

    /// Reset the dongle (0x4A); 500 ms settle time applies afterwards
    #[must_use]
    pub fn reset_system() -> Self {
        Self::new(MessageId::ResetSystem, vec![0x00])
    }

    /// Open an assigned channel (0x4B)
    #[must_use]
    pub fn open_channel(channel: u8) -> Self {
        Self::new(MessageId::OpenChannel, vec![channel])
    }

    /// Request a message on a channel (0x4D)
    #[must_use]
    pub fn request_message(channel: u8, requested: MessageId) -> Self {
        Self::new(MessageId::RequestMessage, vec![channel, requested.as_u8()])
    }

    /// Set the channel transmit power (0x60)
    #[must_use]
    pub fn transmit_power(channel: u8, power: u8) -> Self {
        Self::new(MessageId::TransmitPower, vec![channel, power])
    }

    /// Broadcast data carrying a data-page info block (0x4E)
    #[must_use]
    pub const fn broadcast_data(info: Vec<u8>) -> Self {
        Self::new(MessageId::BroadcastData, info)
    }

    /// Acknowledged data carrying a data-page info block (0x4F)
    #[must_use]
    pub const fn acknowledged_data(info: Vec<u8>) -> Self {
        Self::new(MessageId::AcknowledgedData, info)
    }
}

/// Decoded view of a channel-ID message (0x51) received from the dongle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId {
    /// Channel the ID belongs to
    pub channel: u8,
    /// Peer device number; 0 while the master has not assigned one
    pub device_number: u16,
    /// Peer device type
    pub device_type: u8,
    /// Transmission type
    pub transmission_type: u8,
}

impl ChannelId {
    /// Decode from a received message
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Frame`] if the message is not a channel-ID
    /// message or its payload is too short.
    pub fn decode(message: &Message) -> Result<Self> {
        if message.id != MessageId::ChannelId {
            return Err(BridgeError::Frame(format!(
                "expected channel ID message, got {:?}",
                message.id
            )));
        }
        let p = &message.payload;
        if p.len() < 5 {
            return Err(BridgeError::Frame(format!(
                "channel ID payload too short: {} bytes",
                p.len()
            )));
        }
        Ok(Self {
            channel: p[0],
            device_number: u16::from_le_bytes([p[1], p[2]]),
            device_type: p[3],
            transmission_type: p[4],
        })
    }
}

/// Decoded view of a channel-response message (0x40)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelResponse {
    /// Channel the response refers to
    pub channel: u8,
    /// Message ID that triggered the response, or [`RF_EVENT`]
    pub initiating_id: u8,
    /// Response / event code
    pub code: u8,
}

impl ChannelResponse {
    /// Decode from a received message
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Frame`] if the message is not a
    /// channel-response message or its payload is too short.
    pub fn decode(message: &Message) -> Result<Self> {
        if message.id != MessageId::ChannelResponse {
            return Err(BridgeError::Frame(format!(
                "expected channel response, got {:?}",
                message.id
            )));
        }
        let p = &message.payload;
        if p.len() < 3 {
            return Err(BridgeError::Frame(format!(
                "channel response payload too short: {} bytes",
                p.len()
            )));
        }
        Ok(Self {
            channel: p[0],
            initiating_id: p[1],
            code: p[2],
        })
    }
}

/// Result of scanning a transport buffer for frames
#[derive(Debug, Default)]
pub struct DecodedStream {
    /// Valid messages, in arrival order
    pub messages: Vec<Message>,
    /// Bytes discarded while resynchronizing (garbage or corrupt frames)
    pub skipped: usize,
    /// Trailing bytes of a frame that has not fully arrived yet
    ///
    /// The caller prepends these to the next read; an overrunning frame is
    /// incomplete, not an error.
    pub incomplete: Vec<u8>,
}

/// Split a raw transport buffer into validated messages
///
/// The dongle usually returns one frame per read, but frames arrive
/// concatenated under load and corruption is observed in practice. The scan
/// looks for [`SYNC`], slices the declared length plus envelope, and checks
/// the XOR checksum. On a mismatch the candidate sync byte is skipped and
/// scanning resumes at the next sync occurrence, so one corrupt frame never
/// takes a healthy neighbor with it.
#[must_use]
pub fn decode_stream(buffer: &[u8]) -> DecodedStream {
    let mut out = DecodedStream::default();
    let mut start = 0;

    while start < buffer.len() {
        if buffer[start] != SYNC {
            let run_start = start;
            while start < buffer.len() && buffer[start] != SYNC {
                start += 1;
            }
            out.skipped += start - run_start;
            debug!(skipped = start - run_start, "skipped non-sync bytes");
            continue;
        }

        // A lone sync byte at the tail is an incomplete frame
        if start + 1 >= buffer.len() {
            out.incomplete = buffer[start..].to_vec();
            break;
        }

        let length = buffer[start + 1] as usize;
        let total = HEADER_SIZE + length + 1;
        if start + total > buffer.len() {
            out.incomplete = buffer[start..].to_vec();
            break;
        }

        let frame = &buffer[start..start + total];
        let expected = checksum(&frame[..total - 1]);
        if expected == frame[total - 1] {
            out.messages.push(Message::new(
                MessageId::from_u8(frame[2]),
                frame[HEADER_SIZE..HEADER_SIZE + length].to_vec(),
            ));
            start += total;
        } else {
            warn!(
                expected = format_args!("{expected:02X}"),
                received = format_args!("{:02X}", frame[total - 1]),
                "checksum mismatch, resynchronizing"
            );
            out.skipped += 1;
            start += 1;
        }
    }

    out
}
