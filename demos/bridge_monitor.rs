use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

use tracing::{error, info};

use antbridge::{
    BridgeConfig, BridgeSession, ChangedFields, DongleLink, ExportSink, FrameRecord, Result,
    TelemetrySnapshot, UsbDongle,
};

/// Writes everything crossing the bridge to two semicolon-separated files:
/// one row per data frame, one row per telemetry change.
struct CsvSink {
    frames: BufWriter<File>,
    telemetry: BufWriter<File>,
    started: Instant,
}

impl CsvSink {
    fn create() -> std::io::Result<Self> {
        let mut frames = BufWriter::new(File::create("frames.csv")?);
        let mut telemetry = BufWriter::new(File::create("telemetry.csv")?);
        writeln!(frames, "time;dir;channel;page;data")?;
        writeln!(
            telemetry,
            "time;br_power;br_speed;br_cadence;br_balance;br_temp;br_distance;\
             hu_power;hu_speed;hu_cadence;hu_distance;br_vspeed;hu_res;hu_target;changed"
        )?;
        Ok(Self {
            frames,
            telemetry,
            started: Instant::now(),
        })
    }

    fn timestamp(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

impl ExportSink for CsvSink {
    fn record_frame(&mut self, record: &FrameRecord) {
        let data: Vec<String> = record.data.iter().map(|b| format!("{b:02X}")).collect();
        let _ = writeln!(
            self.frames,
            "{:.3};{};{};{};{}",
            self.timestamp(),
            record.direction,
            record.channel,
            record.page,
            data.join(" ")
        );
    }

    fn record_telemetry(&mut self, snapshot: &TelemetrySnapshot, changed: &ChangedFields) {
        let _ = writeln!(
            self.telemetry,
            "{:.3};{};{};{};{};{};{};{};{};{};{};{};{};{};{}",
            self.timestamp(),
            snapshot.brake.power,
            snapshot.brake.speed_dkmh,
            snapshot.brake.cadence,
            snapshot.brake.balance,
            snapshot.brake.temperature,
            snapshot.brake.distance,
            snapshot.head_unit.power,
            snapshot.head_unit.speed_dkmh,
            snapshot.head_unit.cadence,
            snapshot.head_unit.distance,
            snapshot.virtual_speed,
            snapshot.target_resistance,
            snapshot.target,
            changed.fields.join(",")
        );
        let _ = self.telemetry.flush();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Bushido Bridge Monitor Example");
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

    let sink = CsvSink::create()?;
    info!("📝 Recording to frames.csv and telemetry.csv");

    let link = DongleLink::new(Box::new(dongle), config.reconnect_attempts);
    let mut session = BridgeSession::new(link, config, sink);

    session.set_button_handler(Box::new(|event| {
        println!("🔘 Button: {} ({})", event.button, event.duration);
    }));

    info!("🔍 Bridging; press Ctrl+C to stop");

    let result = tokio::select! {
        result = session.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("🔌 Interrupted, shutting down");
            Ok(())
        }
    };

    let snapshot = session.telemetry();
    println!("\n📊 Final readings:");
    println!("  Brake power: {} W", snapshot.brake.power);
    println!(
        "  Brake speed: {:.1} km/h",
        f64::from(snapshot.brake.speed_dkmh) / 10.0
    );
    println!("  Distance: {}", snapshot.brake.distance);

    if let Err(e) = &result {
        error!("❌ Bridge stopped: {}", e);
    }
    result
}
