use ergometer::{
    sim::{SimConfig, SimulatedTrainer},
    zone::Band,
    DeviceSession, Engine, EngineConfig, EngineEvent, Result, SessionConfig, WorkoutDefinition,
    WorkoutEvent, WorkoutExecutor, WorkoutStatus, WorkoutStep,
};
use std::{sync::Arc, time::Duration};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Ergometer Simulated Workout Example");

    let sim = SimulatedTrainer::new(SimConfig {
        telemetry_interval: Some(Duration::from_millis(250)),
        ..SimConfig::default()
    });
    let session = Arc::new(DeviceSession::new(
        Arc::new(sim.clone()),
        SessionConfig::default(),
    ));
    let device = session.connect_first().await?;
    info!("✅ Connected to: {}", device.label());
    session.request_control().await?;

    let engine = Arc::new(Engine::start(
        Arc::clone(&session),
        EngineConfig::default(),
    )?);
    let mut ticks = engine.subscribe();

    let cadence = Band::new(85.0, 95.0)?;
    let workout = WorkoutDefinition::new(
        "Short intervals",
        vec![
            WorkoutStep::new(Duration::from_secs(10), 120).with_label("Warmup"),
            WorkoutStep::new(Duration::from_secs(8), 220)
                .with_label("Effort")
                .with_cadence_band(cadence),
            WorkoutStep::new(Duration::from_secs(6), 140).with_label("Recovery"),
        ],
    )?;

    let mut executor = WorkoutExecutor::new(Arc::clone(&engine));
    executor.start(workout)?;

    // One workout tick per telemetry tick
    while executor.status() == WorkoutStatus::Running {
        let Ok(EngineEvent::Telemetry(tick)) = ticks.recv().await else {
            continue;
        };

        for event in executor.observe_state(&tick.state) {
            if let WorkoutEvent::CoachingChanged { coaching } = event {
                info!("💬 {} ({:?})", coaching, coaching.severity());
            }
        }
        for event in executor.tick(Duration::from_secs(1))? {
            info!("🏁 {:?}", event);
        }

        if let Some(progress) = executor.progress() {
            info!(
                "📊 {} [{}/{}] {}s left, target {}W ({}W), power {:?}W, zone {:?}",
                progress.label,
                progress.step_index + 1,
                progress.step_total,
                progress.step_remaining.as_secs(),
                progress.target_watts,
                progress.power_band,
                tick.state.power_watts,
                executor.zone()
            );
        }
    }

    engine.stop().await;
    session.disconnect().await;
    info!("✅ Workout finished, {} commands sent", sim.commands().len());
    Ok(())
}
