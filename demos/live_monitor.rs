use pulselink::{
    ble::BtleplugCentral,
    session::BleSession,
    storage::MemorySettingsStore,
    types::SessionConfig,
    HeartRateSession,
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("❤️ Pulselink Live Monitor Example");
    info!("Scanning for heart-rate monitors...");

    let central = Arc::new(BtleplugCentral::new().await?);
    let store = Arc::new(MemorySettingsStore::new());
    let session = BleSession::new(central, store, SessionConfig::default()).await?;

    // Take the first real strap the scan turns up
    let mut scans = session.scan().await?;
    let device = loop {
        let snapshot = scans.recv().await?;
        info!("🔍 {} device(s) in range", snapshot.len());
        if let Some(found) = snapshot.into_iter().find(|d| !d.is_demo) {
            break found;
        }
    };
    info!("✅ Found {} ({})", device.name, device.id);

    // Battery arrives during connect, so subscribe before it
    let mut battery = session.battery_updates();

    if let Err(e) = session.connect(&device.id).await {
        error!("❌ Failed to connect: {e}");
        error!("💡 {}", e.guidance());
        return Err(e.into());
    }
    info!("✅ Connected to {}", device.name);
    info!("Press Ctrl+C to stop");

    let mut samples = session.subscribe_to_heart_rate();
    let mut states = session.monitor_connectivity();

    let start_time = Instant::now();
    let mut beats_seen = 0u64;
    let mut max_bpm = 0u16;

    loop {
        tokio::select! {
            sample = samples.recv() => match sample {
                Ok(sample) => {
                    beats_seen += 1;
                    max_bpm = max_bpm.max(sample.bpm);
                    println!("❤️ {:3} bpm", sample.bpm);
                }
                Err(_) => break,
            },
            level = battery.recv() => {
                if let Ok(level) = level {
                    info!("🔋 Battery: {level}");
                }
            },
            state = states.recv() => match state {
                Ok(state) if !state.is_connected() => {
                    warn!("❌ Connection lost ({state})");
                    break;
                }
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => {
                info!("🔌 Disconnecting...");
                session.disconnect().await;
                break;
            }
        }
    }

    let elapsed = start_time.elapsed();
    println!("\n📊 Session Summary:");
    println!(
        "  Duration: {:02}:{:02}",
        elapsed.as_secs() / 60,
        elapsed.as_secs() % 60
    );
    println!("  Samples: {beats_seen}");
    println!("  Max BPM: {max_bpm}");

    info!("🎉 Monitoring completed!");
    Ok(())
}
