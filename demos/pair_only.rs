use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use antbridge::{
    BridgeConfig, ChannelConfig, DongleLink, Message, PairingSession, Result, UsbDongle,
};

const CYCLE: Duration = Duration::from_millis(500);

/// Drive one channel through its pairing sequence at two cycles per second.
async fn pair(link: &mut DongleLink, session: &mut PairingSession, attempts: u32) -> Result<bool> {
    for _ in 0..attempts {
        let started = Instant::now();
        let received = link.read_messages().await?;
        let poll = session.poll(&received);
        link.write(&poll.outbound).await;
        if poll.newly_paired {
            return Ok(true);
        }
        if let Some(remaining) = CYCLE.checked_sub(started.elapsed()) {
            sleep(remaining).await;
        }
    }
    Ok(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🔗 Bushido Pairing Example");
    info!("Searching for an ANT+ dongle...");

    let config = BridgeConfig::default();

    let dongle = match UsbDongle::open(config.dongle_product_id).await {
        Ok(dongle) => {
            info!("✅ Dongle ready (product 0x{:04X})", dongle.product_id());
            dongle
        }
        Err(e) => {
            error!("❌ Failed to open dongle: {}", e);
            return Err(e);
        }
    };

    let mut link = DongleLink::new(Box::new(dongle), config.reconnect_attempts);
    link.initialize().await?;

    let device_type = config.side.device_type();

    // Search for the real master first; its device number is the proof the
    // peer is actually transmitting.
    info!("🔍 Searching for a {} master...", config.side);
    let mut slave = PairingSession::new(ChannelConfig::bridge_slave(device_type));
    if pair(&mut link, &mut slave, 240).await? {
        match slave.device_number() {
            Some(number) => info!("✅ Paired with {} (device number {})", config.side, number),
            None => info!("✅ Paired with {}", config.side),
        }
    } else {
        warn!("⏰ No {} found within two minutes", config.side);
    }

    // Now present our own master channel for the other side to find.
    info!("📡 Opening bridge master channel...");
    let mut master = PairingSession::new(ChannelConfig::bridge_master(
        device_type,
        config.master_device_number,
    ));
    if pair(&mut link, &mut master, 240).await? {
        info!("✅ A peer attached to the bridge master channel");
    } else {
        warn!("⏰ Nothing attached to the bridge master channel");
    }

    info!("🔌 Closing channels...");
    link.write(&[
        Message::unassign_channel(slave.channel()),
        Message::unassign_channel(master.channel()),
    ])
    .await;
    link.reset().await;

    info!("🎉 Pairing example completed!");
    Ok(())
}
