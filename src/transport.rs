//! USB dongle access and the reconnect-capable link used by the session
//!
//! ANT dongles are plain USB bulk devices: frames out on endpoint 0x01,
//! frames in on endpoint 0x81. A healthy dongle answers a reset with a
//! startup notification, which is how probing tells a usable dongle from
//! another vendor's device on the same product ID.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nusb::transfer::RequestBuffer;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::protocol::{decode_stream, Message, MessageId};

/// USB product IDs of known ANT dongles (Suunto, Garmin, older Garmin)
pub const DONGLE_PRODUCT_IDS: [u16; 3] = [0x1008, 0x1009, 0x1004];

/// Bulk-in endpoint address
const ENDPOINT_IN: u8 = 0x81;

/// Bulk-out endpoint address
const ENDPOINT_OUT: u8 = 0x01;

/// Settle time the dongle needs after a reset
const RESET_SETTLE: Duration = Duration::from_millis(500);

/// Per-read timeout while draining the endpoint
const DRAIN_TIMEOUT: Duration = Duration::from_millis(20);

/// Read timeout while waiting for the startup notification
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Delay between reconnect attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Byte-level access to an ANT dongle
///
/// A read timeout returns an empty buffer, not an error; silence on the
/// endpoint is normal between channel events.
#[async_trait]
pub trait Transport: Send {
    /// Read raw bytes, waiting at most `limit`
    async fn read(&mut self, limit: Duration) -> Result<Vec<u8>>;

    /// Write one encoded frame
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Re-establish the connection after a failure
    async fn reconnect(&mut self) -> Result<()>;
}

/// An ANT dongle opened over USB
pub struct UsbDongle {
    interface: nusb::Interface,
    product_id: u16,
}

impl UsbDongle {
    /// Find and open a dongle
    ///
    /// Enumerates USB devices, filters on the known product IDs (or the
    /// given override) and probes each candidate with a reset until one
    /// reports startup.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DongleNotFound`] when no candidate answers.
    pub async fn open(preferred_pid: Option<u16>) -> Result<Self> {
        for candidate in nusb::list_devices()? {
            let pid = candidate.product_id();
            let wanted = match preferred_pid {
                Some(preferred) => pid == preferred,
                None => DONGLE_PRODUCT_IDS.contains(&pid),
            };
            if !wanted {
                continue;
            }
            debug!(
                vid = format_args!("{:04X}", candidate.vendor_id()),
                pid = format_args!("{pid:04X}"),
                "probing ANT dongle candidate"
            );
            match Self::probe(&candidate).await {
                Ok(dongle) => {
                    info!(pid = format_args!("{pid:04X}"), "ANT dongle opened");
                    return Ok(dongle);
                }
                Err(error) => {
                    warn!(pid = format_args!("{pid:04X}"), %error, "candidate rejected");
                }
            }
        }
        Err(BridgeError::DongleNotFound)
    }

    /// USB product ID of the opened dongle
    #[must_use]
    pub const fn product_id(&self) -> u16 {
        self.product_id
    }

    async fn probe(candidate: &nusb::DeviceInfo) -> Result<Self> {
        let device = candidate.open()?;
        let interface = device.detach_and_claim_interface(0)?;
        let mut dongle = Self {
            interface,
            product_id: candidate.product_id(),
        };

        // Two rounds; a dongle left mid-transfer can eat the first reset
        for attempt in 1..=2 {
            dongle.write(&Message::reset_system().encode()).await?;
            sleep(RESET_SETTLE).await;
            let data = dongle.read(PROBE_TIMEOUT).await?;
            let startup = decode_stream(&data)
                .messages
                .iter()
                .any(|m| m.id == MessageId::StartUp);
            if startup {
                return Ok(dongle);
            }
            debug!(attempt, "no startup notification after reset");
        }
        Err(BridgeError::Protocol(
            "dongle did not report startup after reset".to_string(),
        ))
    }
}

#[async_trait]
impl Transport for UsbDongle {
    async fn read(&mut self, limit: Duration) -> Result<Vec<u8>> {
        let transfer = self.interface.bulk_in(ENDPOINT_IN, RequestBuffer::new(64));
        match timeout(limit, transfer).await {
            Err(_) => Ok(Vec::new()),
            Ok(completion) => Ok(completion.into_result()?),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let completion = self.interface.bulk_out(ENDPOINT_OUT, data.to_vec()).await;
        completion.into_result()?;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        let reopened = Self::open(Some(self.product_id)).await?;
        self.interface = reopened.interface;
        Ok(())
    }
}

/// The message-level link the session talks to
///
/// Wraps a [`Transport`] with frame decoding, incomplete-tail carry-over
/// and the reconnect protocol. After a successful reconnect the
/// `link_reconnected` flag stays raised until the session acknowledges it
/// and rebuilds its channels.
pub struct DongleLink {
    transport: Box<dyn Transport>,
    pending: Vec<u8>,
    link_reconnected: bool,
    reconnect_attempts: u32,
}

impl DongleLink {
    /// Wrap a transport
    #[must_use]
    pub fn new(transport: Box<dyn Transport>, reconnect_attempts: u32) -> Self {
        Self {
            transport,
            pending: Vec::new(),
            link_reconnected: false,
            reconnect_attempts,
        }
    }

    /// Drain the endpoint and decode everything that arrived
    ///
    /// Reads with a short timeout until the endpoint is silent. A trailing
    /// partial frame is kept and prepended to the next drain. A failed read
    /// triggers the reconnect protocol.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Disconnected`] when the reconnect budget is
    /// exhausted.
    pub async fn read_messages(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        loop {
            let chunk = match self.transport.read(DRAIN_TIMEOUT).await {
                Ok(chunk) => chunk,
                Err(error) if error.is_connection_error() => {
                    warn!(%error, "dongle read failed, reconnecting");
                    self.reconnect().await?;
                    break;
                }
                Err(error) => return Err(error),
            };
            if chunk.is_empty() {
                break;
            }
            let mut buffer = std::mem::take(&mut self.pending);
            buffer.extend_from_slice(&chunk);
            let decoded = decode_stream(&buffer);
            self.pending = decoded.incomplete;
            messages.extend(decoded.messages);
        }
        Ok(messages)
    }

    /// Encode and write a batch; a failed write drops that message
    pub async fn write(&mut self, messages: &[Message]) {
        for message in messages {
            if let Err(error) = self.transport.write(&message.encode()).await {
                warn!(id = ?message.id, %error, "write failed, message dropped");
            }
        }
    }

    /// Reset the dongle and wait out the settle time
    pub async fn reset(&mut self) {
        self.write(&[Message::reset_system()]).await;
        sleep(RESET_SETTLE).await;
    }

    /// Bring a freshly opened dongle into a known state
    ///
    /// Resets, asks for capabilities and the ANT version, then programs the
    /// ANT+ key on network 0 and the zero key the trainer network uses on
    /// network 1.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Disconnected`] when the link is lost and the
    /// reconnect budget runs out during the exchange.
    pub async fn initialize(&mut self) -> Result<()> {
        use crate::protocol::{NETWORK_KEY_ANTPLUS, NETWORK_KEY_TACX};

        self.reset().await;
        self.write(&[
            Message::request_message(0, MessageId::Capabilities),
            Message::request_message(0, MessageId::AntVersion),
            Message::set_network_key(0, NETWORK_KEY_ANTPLUS),
            Message::set_network_key(1, NETWORK_KEY_TACX),
        ])
        .await;
        for reply in self.read_messages().await? {
            debug!(id = ?reply.id, payload = ?reply.payload, "initialization reply");
        }
        Ok(())
    }

    /// True when the link dropped and came back since the last acknowledge
    #[must_use]
    pub const fn link_reconnected(&self) -> bool {
        self.link_reconnected
    }

    /// Consume the reconnect flag; the caller restarts channel setup
    pub fn acknowledge_restart(&mut self) -> bool {
        std::mem::take(&mut self.link_reconnected)
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.pending.clear();
        for attempt in 1..=self.reconnect_attempts {
            sleep(RECONNECT_DELAY).await;
            match self.transport.reconnect().await {
                Ok(()) => {
                    info!(attempt, "dongle reconnected");
                    self.link_reconnected = true;
                    return Ok(());
                }
                Err(error) => {
                    debug!(attempt, %error, "reconnect attempt failed");
                }
            }
        }
        Err(BridgeError::Disconnected)
    }
}

enum MockRead {
    Data(Vec<u8>),
    Disconnect,
}

/// Scripted transport for tests
///
/// Reads pop from a queue (empty queue reads as silence), writes are
/// recorded into a shared buffer, and reconnect outcomes are scripted.
#[derive(Default)]
pub struct MockTransport {
    reads: VecDeque<MockRead>,
    reconnects: VecDeque<bool>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_writes: bool,
}

impl MockTransport {
    /// Empty mock; every read is silence
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for one read
    pub fn push_read(&mut self, data: Vec<u8>) {
        self.reads.push_back(MockRead::Data(data));
    }

    /// Queue a connection failure for one read
    pub fn push_disconnect(&mut self) {
        self.reads.push_back(MockRead::Disconnect);
    }

    /// Queue the outcome of the next reconnect attempt
    pub fn push_reconnect(&mut self, succeeds: bool) {
        self.reconnects.push_back(succeeds);
    }

    /// Make every write fail
    pub fn fail_writes(&mut self) {
        self.fail_writes = true;
    }

    /// Handle to the recorded writes, usable after the mock is boxed
    #[must_use]
    pub fn writes(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.writes)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn read(&mut self, _limit: Duration) -> Result<Vec<u8>> {
        match self.reads.pop_front() {
            Some(MockRead::Data(data)) => Ok(data),
            Some(MockRead::Disconnect) => Err(BridgeError::Disconnected),
            None => Ok(Vec::new()),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.fail_writes {
            return Err(BridgeError::Disconnected);
        }
        self.writes
            .lock()
            .expect("mock write log poisoned")
            .push(data.to_vec());
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        match self.reconnects.pop_front() {
            Some(true) | None => Ok(()),
            Some(false) => Err(BridgeError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn link_with(mock: MockTransport) -> DongleLink {
        DongleLink::new(Box::new(mock), 3)
    }

    #[tokio::test]
    async fn test_read_messages_drains_and_decodes() {
        let mut mock = MockTransport::new();
        mock.push_read(Message::open_channel(6).encode().to_vec());
        mock.push_read(Message::open_channel(7).encode().to_vec());

        let mut link = link_with(mock);
        let messages = link.read_messages().await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload, vec![6]);
        assert_eq!(messages[1].payload, vec![7]);
    }

    #[tokio::test]
    async fn test_incomplete_tail_carries_over_reads() {
        let frame = Message::channel_id(7, 57591, 81, 1).encode();
        let mut mock = MockTransport::new();
        mock.push_read(frame[..4].to_vec());

        let mut link = link_with(mock);
        assert!(link.read_messages().await.unwrap().is_empty());

        // The rest arrives on a later drain
        link.transport = Box::new({
            let mut mock = MockTransport::new();
            mock.push_read(frame[4..].to_vec());
            mock
        });
        let messages = link.read_messages().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, MessageId::ChannelId);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_raises_flag_once() {
        let mut mock = MockTransport::new();
        mock.push_disconnect();
        mock.push_reconnect(false);
        mock.push_reconnect(true);

        let mut link = link_with(mock);
        let start = Instant::now();
        let messages = link.read_messages().await.unwrap();
        assert!(messages.is_empty());
        assert!(start.elapsed() >= Duration::from_secs(2));

        assert!(link.link_reconnected());
        assert!(link.acknowledge_restart());
        assert!(!link.link_reconnected());
        assert!(!link.acknowledge_restart());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_budget_exhaustion_is_fatal() {
        let mut mock = MockTransport::new();
        mock.push_disconnect();
        for _ in 0..3 {
            mock.push_reconnect(false);
        }

        let mut link = link_with(mock);
        let error = link.read_messages().await.unwrap_err();
        assert!(matches!(error, BridgeError::Disconnected));
    }

    #[tokio::test]
    async fn test_write_failure_drops_message() {
        let mut mock = MockTransport::new();
        mock.fail_writes();
        let writes = mock.writes();

        let mut link = link_with(mock);
        link.write(&[Message::open_channel(6)]).await;
        assert!(writes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_sets_both_network_keys() {
        let mock = MockTransport::new();
        let writes = mock.writes();

        let mut link = link_with(mock);
        link.initialize().await.unwrap();

        let frames = writes.lock().unwrap();
        // reset + capabilities + version + two network keys
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0][2], MessageId::ResetSystem.as_u8());
        assert_eq!(frames[3][2], MessageId::SetNetworkKey.as_u8());
        assert_eq!(frames[3][3], 0);
        assert_eq!(frames[4][3], 1);
    }
}
