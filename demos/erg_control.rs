use ergometer::{
    ble::BleTransport, DeviceSession, Engine, EngineConfig, EngineEvent, Result, SessionConfig,
};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Ergometer ERG Control Example");
    info!("Searching for FTMS trainers...");

    let transport = Arc::new(BleTransport::new().await?);
    let session = Arc::new(DeviceSession::new(transport, SessionConfig::default()));

    match session.connect_first().await {
        Ok(device) => info!("✅ Connected to: {}", device.label()),
        Err(e) => {
            error!("❌ Failed to connect: {}", e);
            return Err(e);
        }
    }

    if let Err(e) = session.request_control().await {
        error!("❌ Trainer refused control: {}", e);
        session.disconnect().await;
        return Err(e);
    }
    if let Some(range) = session.power_range() {
        info!(
            "📏 Power range: {}-{}W ({}W steps)",
            range.min_watts, range.max_watts, range.increment_watts
        );
    }

    let engine = Engine::start(Arc::clone(&session), EngineConfig::default())?;
    let mut events = engine.subscribe();

    // Print telemetry in the background
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::Telemetry(tick) => info!(
                    "📊 #{:>3} power {:>4}W (avg {:>5.1}W) cadence {:>5.1}rpm target {:?}",
                    tick.sequence,
                    tick.state.power_watts.unwrap_or_default(),
                    tick.state.smoothed_power_watts.unwrap_or_default(),
                    tick.state.cadence_rpm.unwrap_or_default(),
                    tick.state.confirmed_target_watts
                ),
                EngineEvent::TargetApplied { requested, applied } => {
                    info!("✅ Target {}W applied as {}W", requested, applied);
                }
                EngineEvent::TargetRejected { watts, error } => {
                    warn!("⚠️ Target {}W rejected: {}", watts, error);
                }
                EngineEvent::ConnectionChanged(state) => info!("🔗 Connection: {}", state),
            }
        }
    });

    for watts in [150, 200, 250, 150] {
        info!("⚡ Setting target to {}W...", watts);
        engine.set_target(watts)?;
        sleep(Duration::from_secs(30)).await;
    }

    info!("🛑 Shutting down...");
    engine.stop().await;
    printer.abort();
    session.disconnect().await;
    info!("✅ Done");
    Ok(())
}
