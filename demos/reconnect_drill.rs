use pulselink::{
    demo::DemoSession,
    reconnect::ReconnectionController,
    types::{DeviceId, ReconnectConfig, ReconnectionState},
    HeartRateSession,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🔁 Pulselink Reconnection Drill");
    info!("Runs entirely against the built-in demo device, no hardware needed");

    let session = Arc::new(DemoSession::new());
    let controller = ReconnectionController::new(
        Arc::clone(&session) as Arc<dyn HeartRateSession>,
        ReconnectConfig::default(),
    );

    let id = DeviceId::demo();
    session.connect(&id).await?;
    controller.start_monitoring(id).await;
    info!("✅ Connected to the demo device");

    let mut samples = session.subscribe_to_heart_rate();
    let mut reconnect_states = controller.state_updates();

    // Let a few beats through first
    for _ in 0..5 {
        let sample = samples.recv().await?;
        println!("❤️ {:3} bpm", sample.bpm);
    }

    info!("💥 Injecting an unexpected connection drop");
    session.inject_drop().await;

    // Watch the controller walk its campaign
    loop {
        match reconnect_states.recv().await? {
            ReconnectionState::Reconnecting {
                attempt,
                max_attempts,
                last_known_bpm,
            } => {
                // What a status header would render right now
                let shown = session.connectivity().await.with_reconnect_overlay(true);
                info!(
                    "🔄 Reconnection attempt {attempt}/{max_attempts}, header shows {shown} (last known: {} bpm)",
                    last_known_bpm.map_or_else(|| "?".to_string(), |bpm| bpm.to_string())
                );
            }
            ReconnectionState::Idle => {
                info!("✅ Reconnected, samples resume");
                break;
            }
            ReconnectionState::Failed { attempts_made, message, .. } => {
                info!("❌ Gave up after {attempts_made} attempts: {message}");
                return Ok(());
            }
        }
    }

    for _ in 0..3 {
        let sample = samples.recv().await?;
        println!("❤️ {:3} bpm", sample.bpm);
    }

    info!("🔌 Announced disconnect next, so the controller stays quiet");
    controller.mark_manual_disconnect().await;
    session.disconnect().await;
    sleep(Duration::from_secs(2)).await;
    info!(
        "Controller state after manual disconnect: {:?}",
        controller.current_state().await
    );

    controller.reset().await;
    info!("🎉 Drill complete!");
    Ok(())
}
