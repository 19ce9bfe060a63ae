//! Message routing between the bridged channels and the session loop
//!
//! The bridge sits between a master device (brake or head unit) and the
//! slave that believes it is talking to that master. Traffic is forwarded
//! by rewriting the channel byte; identity pages are the one exception and
//! are replaced with the bridge's own identity so a peer can always tell it
//! is connected to the bridge and not past it.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::channel::{identity_messages, ChannelConfig, ChannelRole, PairingSession};
use crate::error::Result;
use crate::pages::{self, DataPage, PageOrigin};
use crate::protocol::{Message, MessageId, RF_EVENT};
use crate::transport::DongleLink;
use crate::types::{
    BridgeConfig, ButtonEvent, Direction, ExportSink, FrameRecord, HeadUnitMode,
    TelemetrySnapshot,
};

/// Cycle budget during pairing; keeps polling at two cycles per second
const PAIRING_CYCLE: Duration = Duration::from_millis(500);

/// The channel numbers a router works across
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeRoute {
    /// Bridge master channel (faces the far slave)
    pub master: u8,
    /// Bridge slave channel (faces the real master)
    pub slave: u8,
    /// Control channel for a local head unit, consumed rather than bridged
    pub control: Option<u8>,
}

impl BridgeRoute {
    /// The standard channel assignment
    #[must_use]
    pub const fn standard(with_control: bool) -> Self {
        Self {
            master: crate::CHANNEL_BRIDGE_MASTER,
            slave: crate::CHANNEL_BRIDGE_SLAVE,
            control: if with_control {
                Some(crate::CHANNEL_HEAD_UNIT)
            } else {
                None
            },
        }
    }

    /// The opposite bridged channel, if `channel` is bridged
    #[must_use]
    pub const fn partner(&self, channel: u8) -> Option<u8> {
        if channel == self.master {
            Some(self.slave)
        } else if channel == self.slave {
            Some(self.master)
        } else {
            None
        }
    }

    /// True for the local head-unit control channel
    #[must_use]
    pub fn is_control(&self, channel: u8) -> bool {
        self.control == Some(channel)
    }
}

/// Outcome of routing one read cycle
#[derive(Debug, Default)]
pub struct RoutedCycle {
    /// The single outbound batch for this cycle, in inbound order
    pub outbound: Vec<Message>,
    /// Control-channel messages, handled locally
    pub consumed: Vec<Message>,
    /// Messages forwarded to a partner channel
    pub forwarded: usize,
    /// Messages dropped (transport acks, unroutable traffic)
    pub dropped: usize,
}

/// Per-message forwarding decisions
pub struct BridgeRouter {
    route: BridgeRoute,
    master_identity: Vec<Message>,
    slave_identity: Vec<Message>,
}

impl BridgeRouter {
    /// Build a router; the substituted identity messages are composed once
    #[must_use]
    pub fn new(route: BridgeRoute) -> Self {
        Self {
            route,
            master_identity: identity_messages(route.master, ChannelRole::Master),
            slave_identity: identity_messages(route.slave, ChannelRole::Slave),
        }
    }

    /// Decide the fate of every inbound message
    ///
    /// Decisions, in priority order: transport acks (channel responses
    /// flagged as RF events) are dropped; identity pages on a bridged
    /// channel, broadcast or acknowledged, are replaced by the bridge's own
    /// identity for the partner channel; remaining bridged traffic is
    /// forwarded with the channel
    /// byte rewritten; control-channel traffic is consumed locally;
    /// anything else is logged and dropped. Inbound order is preserved in
    /// the outbound batch.
    #[must_use]
    pub fn route_cycle(&self, inbound: &[Message]) -> RoutedCycle {
        let mut cycle = RoutedCycle::default();
        for message in inbound {
            if message.id == MessageId::ChannelResponse
                && message.payload.get(1) == Some(&RF_EVENT)
            {
                cycle.dropped += 1;
                continue;
            }
            let Some(channel) = message.channel() else {
                warn!(id = ?message.id, "message without channel byte dropped");
                cycle.dropped += 1;
                continue;
            };
            if let Some(partner) = self.route.partner(channel) {
                if message.is_data() && message.page() == Some(pages::PAGE_IDENTITY) {
                    self.substitute_identity(message, partner, &mut cycle);
                    continue;
                }
                let mut payload = message.payload.clone();
                payload[0] = partner;
                cycle.outbound.push(Message::new(message.id, payload));
                cycle.forwarded += 1;
            } else if self.route.is_control(channel) {
                cycle.consumed.push(message.clone());
            } else {
                warn!(id = ?message.id, channel, "unroutable message dropped");
                cycle.dropped += 1;
            }
        }
        cycle
    }

    fn substitute_identity(&self, message: &Message, partner: u8, cycle: &mut RoutedCycle) {
        let identity = if partner == self.route.master {
            &self.master_identity
        } else {
            &self.slave_identity
        };
        match message.sub_page() {
            Some(1) => {
                cycle.outbound.push(identity[0].clone());
                cycle.forwarded += 1;
            }
            Some(2) => {
                cycle.outbound.push(identity[1].clone());
                cycle.forwarded += 1;
            }
            sub => {
                debug!(?sub, "identity page with unhandled sub-page dropped");
                cycle.dropped += 1;
            }
        }
    }
}

/// Drives a locally attached head unit through its control channel
///
/// Steps the display to training mode (PcMode, then TrainingPause, then
/// Training), tracks the mode it reports in its identity page, and collects
/// button presses for the caller. The power or slope ramp riding on those
/// buttons lives outside this crate; the page 220 target encoders are its
/// interface.
#[derive(Debug)]
pub struct HeadUnitDriver {
    channel: u8,
    reported: Option<HeadUnitMode>,
    announced: Option<HeadUnitMode>,
    events: Vec<ButtonEvent>,
}

impl HeadUnitDriver {
    /// Driver for a head unit on the given control channel
    #[must_use]
    pub const fn new(channel: u8) -> Self {
        Self {
            channel,
            reported: None,
            announced: None,
            events: Vec::new(),
        }
    }

    /// Feed one decoded control-channel page
    pub fn observe(&mut self, page: &DataPage) {
        match page {
            DataPage::SerialNumber { mode, .. } => {
                self.reported = Some(*mode);
            }
            DataPage::ButtonPress(event) => {
                info!(button = ?event.button, duration = ?event.duration, "head unit button");
                self.events.push(*event);
            }
            _ => {}
        }
    }

    /// The mode-change command for this cycle, while not yet in training
    pub fn drive(&mut self) -> Option<Message> {
        if self.reported == Some(HeadUnitMode::Training) {
            if self.announced != self.reported {
                info!("head unit in training mode");
                self.announced = self.reported;
            }
            return None;
        }
        let next = match self.reported {
            Some(HeadUnitMode::PcMode) => HeadUnitMode::TrainingPause,
            Some(HeadUnitMode::TrainingPause) => HeadUnitMode::Training,
            _ => HeadUnitMode::PcMode,
        };
        if self.announced != Some(next) {
            info!(requested = %next, "stepping head unit mode");
            self.announced = Some(next);
        }
        Some(Message::broadcast_data(pages::change_mode(
            self.channel,
            next,
        )))
    }

    /// Keep-alive broadcast; prevents the display from powering off
    #[must_use]
    pub fn keep_alive(&self) -> Message {
        Message::broadcast_data(pages::keep_alive(self.channel))
    }

    /// Button presses collected since the last call
    pub fn take_button_events(&mut self) -> Vec<ButtonEvent> {
        std::mem::take(&mut self.events)
    }

    /// True once the head unit reported training mode
    #[must_use]
    pub fn is_training(&self) -> bool {
        self.reported == Some(HeadUnitMode::Training)
    }
}

enum Flow {
    Continue,
    Restart,
}

/// The complete bridge: link, pairing, routing, telemetry and export
pub struct BridgeSession<S: ExportSink> {
    link: DongleLink,
    config: BridgeConfig,
    sink: S,
    telemetry: TelemetrySnapshot,
    button_handler: Option<Box<dyn FnMut(ButtonEvent) + Send>>,
}

impl<S: ExportSink> BridgeSession<S> {
    /// Build a session over an opened link
    #[must_use]
    pub fn new(link: DongleLink, config: BridgeConfig, sink: S) -> Self {
        Self {
            link,
            config,
            sink,
            telemetry: TelemetrySnapshot::default(),
            button_handler: None,
        }
    }

    /// Receive head-unit button events as they arrive
    pub fn set_button_handler(&mut self, handler: Box<dyn FnMut(ButtonEvent) + Send>) {
        self.button_handler = Some(handler);
    }

    /// Last decoded telemetry
    #[must_use]
    pub const fn telemetry(&self) -> &TelemetrySnapshot {
        &self.telemetry
    }

    /// Run the bridge until the link is lost for good
    ///
    /// Initializes the dongle, pairs the control, master and slave channels
    /// in that order, then bridges traffic. When the link drops and comes
    /// back, the channels are torn down and the whole sequence restarts.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BridgeError::Disconnected`] when the reconnect
    /// budget is exhausted.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if let Err(error) = self.link.initialize().await {
                self.teardown().await;
                return Err(error);
            }
            match self.session_attempt().await {
                Ok(()) => {
                    self.teardown().await;
                    self.link.acknowledge_restart();
                    info!("link rebuilt, restarting channel setup");
                }
                Err(error) => {
                    self.teardown().await;
                    return Err(error);
                }
            }
        }
    }

    async fn session_attempt(&mut self) -> Result<()> {
        let device_type = self.config.side.device_type();
        info!(side = %self.config.side, "starting bridge session");

        let mut control = self
            .config
            .pair_head_unit
            .then(|| PairingSession::new(ChannelConfig::head_unit_control()));
        let mut master = PairingSession::new(ChannelConfig::bridge_master(
            device_type,
            self.config.master_device_number,
        ));
        let mut slave = PairingSession::new(ChannelConfig::bridge_slave(device_type));

        if let Some(session) = control.as_mut() {
            if matches!(self.pair_channel(session, None).await?, Flow::Restart) {
                return Ok(());
            }
        }
        if matches!(self.pair_channel(&mut master, None).await?, Flow::Restart) {
            return Ok(());
        }
        // Keep the local head unit awake while waiting for the real master
        let keep_alive = control
            .as_ref()
            .filter(|c| c.is_paired())
            .map(PairingSession::channel);
        if matches!(self.pair_channel(&mut slave, keep_alive).await?, Flow::Restart) {
            return Ok(());
        }

        let route = BridgeRoute::standard(control.is_some());
        let router = BridgeRouter::new(route);
        let mut driver = control.as_ref().map(|c| HeadUnitDriver::new(c.channel()));
        info!("bridging started");

        loop {
            let inbound = self.link.read_messages().await?;
            if self.link.link_reconnected() {
                return Ok(());
            }
            let mut cycle = router.route_cycle(&inbound);
            let previous = self.telemetry.clone();

            let mut control_pages = Vec::new();
            for message in &inbound {
                if !message.is_data() {
                    continue;
                }
                if let Some(record) = FrameRecord::from_payload(&message.payload, Direction::Rx) {
                    self.sink.record_frame(&record);
                }
                let origin = if message.channel() == Some(route.slave) {
                    PageOrigin::Brake
                } else {
                    PageOrigin::HeadUnit
                };
                match DataPage::decode(&message.payload, origin) {
                    Ok(page) => {
                        apply_page(&mut self.telemetry, &page);
                        if message
                            .channel()
                            .is_some_and(|channel| route.is_control(channel))
                        {
                            control_pages.push(page);
                        }
                    }
                    Err(error) => debug!(%error, "undecodable data payload"),
                }
            }

            if let Some(driver) = driver.as_mut() {
                for page in &control_pages {
                    driver.observe(page);
                }
                if let Some(command) = driver.drive() {
                    cycle.outbound.push(command);
                }
                for event in driver.take_button_events() {
                    if let Some(handler) = self.button_handler.as_mut() {
                        handler(event);
                    }
                }
            }

            for message in &cycle.outbound {
                if !message.is_data() {
                    continue;
                }
                if let Some(record) = FrameRecord::from_payload(&message.payload, Direction::Tx) {
                    self.sink.record_frame(&record);
                }
            }
            debug!(
                read = inbound.len(),
                forwarded = cycle.forwarded,
                dropped = cycle.dropped,
                "bridged cycle"
            );
            self.link.write(&cycle.outbound).await;

            let changed = self.telemetry.diff(&previous);
            if !changed.is_empty() {
                self.sink.record_telemetry(&self.telemetry, &changed);
            }
        }
    }

    async fn pair_channel(
        &mut self,
        session: &mut PairingSession,
        keep_alive: Option<u8>,
    ) -> Result<Flow> {
        while !session.is_paired() {
            let start = Instant::now();
            let received = self.link.read_messages().await?;
            if self.link.link_reconnected() {
                return Ok(Flow::Restart);
            }
            let mut poll = session.poll(&received);
            if !session.is_paired() {
                if let Some(channel) = keep_alive {
                    poll.outbound
                        .push(Message::broadcast_data(pages::keep_alive(channel)));
                }
            }
            self.link.write(&poll.outbound).await;
            let elapsed = start.elapsed();
            if elapsed < PAIRING_CYCLE {
                sleep(PAIRING_CYCLE - elapsed).await;
            }
        }
        Ok(Flow::Continue)
    }

    async fn teardown(&mut self) {
        self.link
            .write(&[
                Message::unassign_channel(crate::CHANNEL_BRIDGE_SLAVE),
                Message::unassign_channel(crate::CHANNEL_BRIDGE_MASTER),
            ])
            .await;
        self.link.reset().await;
    }
}

/// Fold one decoded page into the telemetry snapshot
fn apply_page(telemetry: &mut TelemetrySnapshot, page: &DataPage) {
    match *page {
        DataPage::BrakePower {
            power,
            force_left,
            force_right,
        } => {
            telemetry.brake.power = power;
            telemetry.force_left = force_left;
            telemetry.force_right = force_right;
        }
        DataPage::TargetResistance { resistance } => {
            telemetry.target_resistance = resistance;
        }
        DataPage::TrainingTarget { target, .. } => {
            telemetry.target = target;
        }
        DataPage::SpeedCadenceBalance {
            speed_dkmh,
            cadence,
            balance,
        } => {
            telemetry.brake.speed_dkmh = speed_dkmh;
            telemetry.brake.cadence = cadence;
            telemetry.brake.balance = balance;
        }
        DataPage::VirtualSpeed {
            vspeed,
            resistance_1,
            resistance_2,
        } => {
            telemetry.virtual_speed = vspeed;
            telemetry.brake_resistance_1 = resistance_1;
            telemetry.brake_resistance_2 = resistance_2;
        }
        DataPage::DistanceCounter { count } => {
            telemetry.brake.distance = count;
        }
        DataPage::BrakeStatus { alarm, temperature } => {
            if let Some(text) = alarm.describe() {
                warn!(temperature, "brake alarm: {text}");
            }
            telemetry.brake.alarm = alarm;
            telemetry.brake.temperature = temperature;
        }
        DataPage::BrakeCalibration {
            sub,
            powerback,
            code,
            value_tenths,
        } => {
            telemetry.brake.powerback = u16::from(powerback);
            // Sub-page 3 code 0x42 carries the value shown on the display
            if sub == 3 && code == 0x42 {
                telemetry.calibration_value = u16::from(value_tenths);
            }
        }
        DataPage::SpeedPowerCadence {
            speed_dkmh,
            power,
            cadence,
            balance,
        } => {
            telemetry.head_unit.speed_dkmh = speed_dkmh;
            telemetry.head_unit.power = power;
            telemetry.head_unit.cadence = cadence;
            telemetry.head_unit.balance = balance;
        }
        DataPage::DistanceHeartRate { distance, .. } => {
            telemetry.head_unit.distance = distance;
        }
        DataPage::AlarmTemperature {
            alarm,
            temperature,
            powerback,
        } => {
            telemetry.head_unit.alarm = alarm;
            telemetry.head_unit.temperature = temperature;
            telemetry.head_unit.powerback = powerback;
        }
        DataPage::CalibrationStatus {
            state,
            value_tenths,
        } => {
            telemetry.calibration_state = state;
            telemetry.calibration_value = value_tenths;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_stream;
    use crate::types::{BrakeAlarm, Button};

    fn router() -> BridgeRouter {
        BridgeRouter::new(BridgeRoute::standard(true))
    }

    #[test]
    fn test_rf_event_ack_dropped_broadcast_forwarded() {
        // The read-buffer scenario: a transport ack concatenated with a
        // broadcast from the brake channel
        let ack = Message::new(MessageId::ChannelResponse, vec![0x00, 0x01, 0x00]);
        let data = Message::broadcast_data(vec![7, 16, 0, 8, 57, 0, 0, 0, 0]);
        let mut buffer = ack.encode().to_vec();
        buffer.extend_from_slice(&data.encode());

        let inbound = decode_stream(&buffer).messages;
        let cycle = router().route_cycle(&inbound);

        assert_eq!(cycle.dropped, 1);
        assert_eq!(cycle.outbound.len(), 1);
        assert_eq!(cycle.outbound[0].payload[0], 6);
        assert_eq!(cycle.outbound[0].payload[1..], data.payload[1..]);
    }

    #[test]
    fn test_channel_rewrite_preserves_everything_else() {
        let inbound = vec![
            Message::broadcast_data(pages::brake_power(7, 237)),
            Message::acknowledged_data(vec![6, 1, 0x00, 0x96, 0, 0, 0, 0, 0]),
        ];
        let cycle = router().route_cycle(&inbound);

        assert_eq!(cycle.forwarded, 2);
        assert_eq!(cycle.outbound[0].payload[0], 6);
        assert_eq!(cycle.outbound[0].payload[1..], inbound[0].payload[1..]);
        assert_eq!(cycle.outbound[0].id, MessageId::BroadcastData);
        assert_eq!(cycle.outbound[1].payload[0], 7);
        assert_eq!(cycle.outbound[1].id, MessageId::AcknowledgedData);
    }

    #[test]
    fn test_identity_pages_never_cross_the_bridge() {
        // The brake announces serial 57591; the far side must only ever see
        // the bridge's own identity
        let foreign_serial = Message::broadcast_data(vec![7, 0xAD, 0x01, 0, 9, 0, 0, 0xE0, 0xF7]);
        let foreign_version = Message::broadcast_data(vec![7, 0xAD, 0x02, 9, 9, 0x10, 0x92, 0, 0]);

        let cycle = router().route_cycle(&[foreign_serial, foreign_version]);
        assert_eq!(cycle.outbound.len(), 2);

        // Substituted with the master-channel identity (year 2020, 2020)
        assert_eq!(cycle.outbound[0].payload[0], 6);
        assert_eq!(cycle.outbound[0].payload[4], 20);
        assert_eq!(cycle.outbound[0].payload[7..9], [0x07, 0xE4]);
        assert_eq!(cycle.outbound[1].payload[3..5], [5, 6]);

        // Nothing outbound carries the foreign serial bytes
        for message in &cycle.outbound {
            assert!(!message.payload.windows(2).any(|w| w == [0xE0, 0xF7]));
        }

        // Acknowledged data carrying the identity page is substituted too
        let acked_serial =
            Message::acknowledged_data(vec![7, 0xAD, 0x01, 0, 9, 0, 0, 0xE0, 0xF7]);
        let cycle = router().route_cycle(&[acked_serial]);
        assert_eq!(cycle.outbound.len(), 1);
        assert_eq!(cycle.outbound[0].payload[0], 6);
        assert_eq!(cycle.outbound[0].payload[4], 20);
        assert!(!cycle.outbound[0].payload.windows(2).any(|w| w == [0xE0, 0xF7]));
    }

    #[test]
    fn test_identity_substitution_direction() {
        // Identity arriving on the master channel gets the slave identity
        let serial = Message::broadcast_data(vec![6, 0xAD, 0x01, 0, 9, 0, 0, 0x12, 0x34]);
        let cycle = router().route_cycle(&[serial]);
        assert_eq!(cycle.outbound[0].payload[0], 7);
        assert_eq!(cycle.outbound[0].payload[4], 15); // year 2015
    }

    #[test]
    fn test_identity_with_unknown_sub_page_dropped() {
        let odd = Message::broadcast_data(vec![7, 0xAD, 0x07, 0, 0, 0, 0, 0, 0]);
        let cycle = router().route_cycle(&[odd]);
        assert!(cycle.outbound.is_empty());
        assert_eq!(cycle.dropped, 1);
    }

    #[test]
    fn test_control_channel_consumed_not_forwarded() {
        let button = Message::acknowledged_data(vec![5, 221, 0x10, 0x02, 0, 0, 0, 0, 1]);
        let cycle = router().route_cycle(&[button]);
        assert!(cycle.outbound.is_empty());
        assert_eq!(cycle.consumed.len(), 1);
    }

    #[test]
    fn test_unroutable_channel_dropped() {
        let stray = Message::broadcast_data(vec![3, 16, 0, 0, 0, 0, 0, 0, 0]);
        let cycle = router().route_cycle(&[stray]);
        assert!(cycle.outbound.is_empty());
        assert!(cycle.consumed.is_empty());
        assert_eq!(cycle.dropped, 1);
    }

    #[test]
    fn test_head_unit_mode_ladder() {
        let mut driver = HeadUnitDriver::new(5);

        // Nothing reported yet: ask for PC mode
        let command = driver.drive().unwrap();
        assert_eq!(command.payload[2..4], [0x03, 4]);

        driver.observe(&DataPage::SerialNumber {
            mode: HeadUnitMode::PcMode,
            year: 9,
            device_number: 1234,
        });
        let command = driver.drive().unwrap();
        assert_eq!(command.payload[3], 3); // TrainingPause

        driver.observe(&DataPage::SerialNumber {
            mode: HeadUnitMode::TrainingPause,
            year: 9,
            device_number: 1234,
        });
        let command = driver.drive().unwrap();
        assert_eq!(command.payload[3], 2); // Training

        driver.observe(&DataPage::SerialNumber {
            mode: HeadUnitMode::Training,
            year: 9,
            device_number: 1234,
        });
        assert!(driver.drive().is_none());
        assert!(driver.is_training());
    }

    #[test]
    fn test_driver_collects_button_events() {
        let mut driver = HeadUnitDriver::new(5);
        driver.observe(&DataPage::ButtonPress(ButtonEvent::from_key_byte(0x02)));
        driver.observe(&DataPage::ButtonPress(ButtonEvent::from_key_byte(0x04)));

        let events = driver.take_button_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].button, Button::Up);
        assert_eq!(events[1].button, Button::Down);
        assert!(driver.take_button_events().is_empty());
    }

    #[test]
    fn test_apply_page_updates_sides_independently() {
        let mut telemetry = TelemetrySnapshot::default();
        let previous = telemetry.clone();

        apply_page(
            &mut telemetry,
            &DataPage::BrakePower {
                power: 237,
                force_left: 187,
                force_right: 287,
            },
        );
        apply_page(
            &mut telemetry,
            &DataPage::SpeedPowerCadence {
                speed_dkmh: 321,
                power: 180,
                cadence: 90,
                balance: 50,
            },
        );
        apply_page(
            &mut telemetry,
            &DataPage::BrakeStatus {
                alarm: BrakeAlarm(1),
                temperature: 41,
            },
        );

        assert_eq!(telemetry.brake.power, 237);
        assert_eq!(telemetry.head_unit.power, 180);
        assert_eq!(telemetry.brake.alarm, BrakeAlarm(1));

        let changed = telemetry.diff(&previous);
        assert!(changed.contains("br_power"));
        assert!(changed.contains("hu_power"));
        assert!(changed.contains("br_alarm"));
        assert!(!changed.contains("hu_alarm"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_fails_when_reconnect_budget_exhausted() {
        use crate::transport::MockTransport;
        use crate::types::NullSink;

        let mut mock = MockTransport::new();
        mock.push_disconnect();
        for _ in 0..2 {
            mock.push_reconnect(false);
        }
        let link = DongleLink::new(Box::new(mock), 2);

        let mut session = BridgeSession::new(link, BridgeConfig::default(), NullSink);
        let error = session.run().await.unwrap_err();
        assert!(matches!(error, crate::BridgeError::Disconnected));
    }
}
