use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    error::{FtmsError, Result},
    protocol::IndoorBikeSample,
    types::TrainerState,
    zone::{classify_metrics, Band, Coaching, CoachingStabilizer, Zone, ZoneConfig},
};

const EVENT_BUFFER: usize = 64;

/// Receives the target power of each workout step
///
/// Calls are fire-and-forget: an `Ok` means the request was accepted, not that
/// the trainer confirmed it.
pub trait TargetSink {
    /// Request a new ERG target
    ///
    /// # Errors
    ///
    /// Returns an error if the request is rejected before it is queued.
    fn apply_target(&self, watts: i32) -> Result<()>;
}

impl<T: TargetSink + ?Sized> TargetSink for Arc<T> {
    fn apply_target(&self, watts: i32) -> Result<()> {
        (**self).apply_target(watts)
    }
}

impl<T: TargetSink + ?Sized> TargetSink for &T {
    fn apply_target(&self, watts: i32) -> Result<()> {
        (**self).apply_target(watts)
    }
}

/// One interval of a structured workout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutStep {
    /// Step length
    pub duration: Duration,
    /// ERG target in watts
    pub target_watts: i32,
    /// Display label
    pub label: Option<String>,
    /// Expected cadence range
    pub cadence_band: Option<Band>,
    /// Expected power range; derived from the target when absent
    pub power_band: Option<Band>,
}

impl WorkoutStep {
    /// Create a step
    #[must_use]
    pub const fn new(duration: Duration, target_watts: i32) -> Self {
        Self {
            duration,
            target_watts,
            label: None,
            cadence_band: None,
            power_band: None,
        }
    }

    /// Set the label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the expected cadence range
    #[must_use]
    pub fn with_cadence_band(mut self, band: Band) -> Self {
        self.cadence_band = Some(band);
        self
    }

    /// Override the expected power range
    #[must_use]
    pub fn with_power_band(mut self, band: Band) -> Self {
        self.power_band = Some(band);
        self
    }

    /// Expected power range: the explicit band or the target ±5%
    #[must_use]
    pub fn power_band(&self) -> Band {
        self.power_band
            .unwrap_or_else(|| Band::around_target(self.target_watts))
    }
}

/// A validated, immutable workout
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkoutDefinition {
    name: String,
    steps: Vec<WorkoutStep>,
}

impl WorkoutDefinition {
    /// Validate and build a workout
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidParameters`] for an empty step list, a
    /// zero-length step or a negative target.
    pub fn new(name: impl Into<String>, steps: Vec<WorkoutStep>) -> Result<Self> {
        if steps.is_empty() {
            return Err(FtmsError::InvalidParameters(
                "workout has no steps".to_string(),
            ));
        }
        for (index, step) in steps.iter().enumerate() {
            if step.duration.is_zero() {
                return Err(FtmsError::InvalidParameters(format!(
                    "step {} has zero duration",
                    index + 1
                )));
            }
            if step.target_watts < 0 {
                return Err(FtmsError::InvalidParameters(format!(
                    "step {} has negative target {}W",
                    index + 1,
                    step.target_watts
                )));
            }
        }

        Ok(Self {
            name: name.into(),
            steps,
        })
    }

    /// Workout name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered steps
    #[must_use]
    pub fn steps(&self) -> &[WorkoutStep] {
        &self.steps
    }

    /// Sum of all step durations
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.steps.iter().map(|step| step.duration).sum()
    }
}

/// Lifecycle of a workout run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkoutStatus {
    /// Nothing loaded, or stopped
    #[default]
    Idle,
    /// Ticks advance the timeline
    Running,
    /// Ticks are ignored
    Paused,
    /// Every step has elapsed
    Completed,
}

impl fmt::Display for WorkoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Completed => write!(f, "Completed"),
        }
    }
}

/// Position in the workout timeline
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkoutRunState {
    /// Zero-based index of the current step
    pub step_index: usize,
    /// Time spent in the current step
    pub step_elapsed: Duration,
    /// Time spent in the workout
    pub session_elapsed: Duration,
    /// Run status
    pub status: WorkoutStatus,
}

/// Notifications published by the [`WorkoutExecutor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkoutEvent {
    /// A workout started at step 0
    Started {
        /// Workout name
        name: String,
        /// Target of the first step
        target_watts: i32,
    },
    /// The timeline moved to another step
    StepChanged {
        /// Zero-based index of the new step
        index: usize,
        /// Target of the new step
        target_watts: i32,
        /// Label of the new step
        label: String,
    },
    /// Live metrics moved to another zone
    ZoneChanged {
        /// New zone
        zone: Zone,
    },
    /// The displayed coaching hint changed
    CoachingChanged {
        /// New hint
        coaching: Coaching,
    },
    /// Ticks are suspended
    Paused,
    /// Ticks resumed
    Resumed,
    /// The last step elapsed
    Completed,
    /// The run was abandoned
    Stopped,
    /// A step target could not be handed to the sink
    TargetFailed {
        /// Rejected target
        watts: i32,
        /// Rejection reason
        error: String,
    },
}

/// Snapshot of a run for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutProgress {
    /// Zero-based index of the current step
    pub step_index: usize,
    /// Number of steps
    pub step_total: usize,
    /// Step label, `Step N` when unlabeled
    pub label: String,
    /// ERG target
    pub target_watts: i32,
    /// Expected power range
    pub power_band: Band,
    /// Expected cadence range
    pub cadence_band: Option<Band>,
    /// Step length
    pub step_duration: Duration,
    /// Time spent in the step
    pub step_elapsed: Duration,
    /// Time left in the step
    pub step_remaining: Duration,
    /// Time spent in the workout
    pub session_elapsed: Duration,
    /// Workout length
    pub total_duration: Duration,
    /// Time left in the workout
    pub total_remaining: Duration,
    /// Run status
    pub status: WorkoutStatus,
}

fn step_label(step: &WorkoutStep, index: usize) -> String {
    step.label
        .clone()
        .unwrap_or_else(|| format!("Step {}", index + 1))
}

/// Walks a [`WorkoutDefinition`] and drives a [`TargetSink`]
///
/// The executor owns no clock. Callers drive it with [`tick`](Self::tick) at
/// any cadence; each call only updates in-memory state and hands targets to
/// the sink, so it never blocks.
pub struct WorkoutExecutor<S: TargetSink> {
    sink: S,
    config: ZoneConfig,
    workout: Option<Arc<WorkoutDefinition>>,
    run: WorkoutRunState,
    zone: Option<Zone>,
    stabilizer: CoachingStabilizer,
    events: broadcast::Sender<WorkoutEvent>,
}

impl<S: TargetSink> WorkoutExecutor<S> {
    /// Create an idle executor with the default zone settings
    #[must_use]
    pub fn new(sink: S) -> Self {
        Self::with_config(sink, ZoneConfig::default())
    }

    /// Create an idle executor
    #[must_use]
    pub fn with_config(sink: S, config: ZoneConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            sink,
            stabilizer: CoachingStabilizer::new(Duration::from_millis(config.hint_switch_ms)),
            config,
            workout: None,
            run: WorkoutRunState::default(),
            zone: None,
            events,
        }
    }

    /// Subscribe to workout events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkoutEvent> {
        self.events.subscribe()
    }

    /// Current run status
    #[must_use]
    pub const fn status(&self) -> WorkoutStatus {
        self.run.status
    }

    /// Current timeline position
    #[must_use]
    pub const fn run_state(&self) -> &WorkoutRunState {
        &self.run
    }

    /// Loaded workout
    #[must_use]
    pub fn workout(&self) -> Option<&WorkoutDefinition> {
        self.workout.as_deref()
    }

    /// Step the timeline is in
    #[must_use]
    pub fn current_step(&self) -> Option<&WorkoutStep> {
        self.workout
            .as_deref()
            .and_then(|workout| workout.steps().get(self.run.step_index))
    }

    /// Last zone reported
    #[must_use]
    pub const fn zone(&self) -> Option<Zone> {
        self.zone
    }

    /// Coaching hint currently shown
    #[must_use]
    pub const fn coaching(&self) -> Option<Coaching> {
        self.stabilizer.current()
    }

    fn publish(&self, events: &[WorkoutEvent]) {
        for event in events {
            let _ = self.events.send(event.clone());
        }
    }

    fn apply_target(&self, watts: i32, events: &mut Vec<WorkoutEvent>) {
        if let Err(e) = self.sink.apply_target(watts) {
            warn!("Workout target {}W rejected: {}", watts, e);
            events.push(WorkoutEvent::TargetFailed {
                watts,
                error: e.to_string(),
            });
        }
    }

    fn invalid_state(&self) -> FtmsError {
        FtmsError::InvalidState {
            state: format!("workout {}", self.run.status),
        }
    }

    /// Load `workout` and start at step 0, applying its target
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidState`] while a run is active.
    pub fn start(&mut self, workout: WorkoutDefinition) -> Result<Vec<WorkoutEvent>> {
        if !matches!(
            self.run.status,
            WorkoutStatus::Idle | WorkoutStatus::Completed
        ) {
            return Err(self.invalid_state());
        }

        let target_watts = workout.steps()[0].target_watts;
        info!(
            "Starting workout '{}' ({} steps, {}s)",
            workout.name(),
            workout.steps().len(),
            workout.total_duration().as_secs()
        );

        let mut events = vec![WorkoutEvent::Started {
            name: workout.name().to_string(),
            target_watts,
        }];
        self.workout = Some(Arc::new(workout));
        self.run = WorkoutRunState {
            status: WorkoutStatus::Running,
            ..WorkoutRunState::default()
        };
        self.zone = None;
        self.stabilizer.reset();

        self.apply_target(target_watts, &mut events);
        self.publish(&events);
        Ok(events)
    }

    /// Advance the timeline by `delta`
    ///
    /// Crossing a step boundary applies the next target and emits
    /// [`WorkoutEvent::StepChanged`]; the overshoot is carried into the next
    /// step. A paused run ignores ticks.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidState`] unless running or paused.
    pub fn tick(&mut self, delta: Duration) -> Result<Vec<WorkoutEvent>> {
        match self.run.status {
            WorkoutStatus::Running => {}
            WorkoutStatus::Paused => return Ok(Vec::new()),
            WorkoutStatus::Idle | WorkoutStatus::Completed => return Err(self.invalid_state()),
        }
        let Some(workout) = self.workout.clone() else {
            return Err(self.invalid_state());
        };

        let mut events = Vec::new();
        let mut remaining = delta;
        loop {
            let step = &workout.steps()[self.run.step_index];
            let left_in_step = step.duration.saturating_sub(self.run.step_elapsed);
            if remaining < left_in_step {
                self.run.step_elapsed += remaining;
                self.run.session_elapsed += remaining;
                break;
            }

            remaining -= left_in_step;
            self.run.session_elapsed += left_in_step;

            let next = self.run.step_index + 1;
            if let Some(next_step) = workout.steps().get(next) {
                self.run.step_index = next;
                self.run.step_elapsed = Duration::ZERO;
                let label = step_label(next_step, next);
                info!(
                    "Step {}/{}: {} at {}W",
                    next + 1,
                    workout.steps().len(),
                    label,
                    next_step.target_watts
                );
                events.push(WorkoutEvent::StepChanged {
                    index: next,
                    target_watts: next_step.target_watts,
                    label,
                });
                self.apply_target(next_step.target_watts, &mut events);
            } else {
                self.run.step_elapsed = step.duration;
                self.run.status = WorkoutStatus::Completed;
                info!("Workout '{}' completed", workout.name());
                events.push(WorkoutEvent::Completed);
                break;
            }
        }

        self.publish(&events);
        Ok(events)
    }

    /// Freeze the timeline
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidState`] unless running.
    pub fn pause(&mut self) -> Result<Vec<WorkoutEvent>> {
        if self.run.status != WorkoutStatus::Running {
            return Err(self.invalid_state());
        }
        self.run.status = WorkoutStatus::Paused;
        let events = vec![WorkoutEvent::Paused];
        self.publish(&events);
        Ok(events)
    }

    /// Unfreeze the timeline without re-issuing the step target
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidState`] unless paused.
    pub fn resume(&mut self) -> Result<Vec<WorkoutEvent>> {
        if self.run.status != WorkoutStatus::Paused {
            return Err(self.invalid_state());
        }
        self.run.status = WorkoutStatus::Running;
        let events = vec![WorkoutEvent::Resumed];
        self.publish(&events);
        Ok(events)
    }

    /// Abandon the run; a no-op unless running or paused
    pub fn stop(&mut self) -> Vec<WorkoutEvent> {
        if !matches!(
            self.run.status,
            WorkoutStatus::Running | WorkoutStatus::Paused
        ) {
            return Vec::new();
        }
        self.run.status = WorkoutStatus::Idle;
        info!("Workout stopped");
        let events = vec![WorkoutEvent::Stopped];
        self.publish(&events);
        events
    }

    /// Classify live metrics against the current step
    ///
    /// Emits [`WorkoutEvent::ZoneChanged`] when the zone differs from the last
    /// observation and [`WorkoutEvent::CoachingChanged`] when the stabilized
    /// hint switches. Ignored unless running.
    pub fn observe(&mut self, power_watts: Option<f64>, cadence_rpm: Option<f64>) -> Vec<WorkoutEvent> {
        if self.run.status != WorkoutStatus::Running {
            return Vec::new();
        }
        let Some(step) = self.current_step().cloned() else {
            return Vec::new();
        };

        let mut events = Vec::new();
        let zone = classify_metrics(power_watts, cadence_rpm, &step, self.config.tolerance);
        if self.zone != Some(zone) {
            self.zone = Some(zone);
            events.push(WorkoutEvent::ZoneChanged { zone });
        }

        let candidate = Coaching::evaluate(power_watts, cadence_rpm, &step);
        let (coaching, changed) = self
            .stabilizer
            .update(candidate, self.run.session_elapsed);
        if changed {
            events.push(WorkoutEvent::CoachingChanged { coaching });
        }

        self.publish(&events);
        events
    }

    /// [`observe`](Self::observe) a decoded sample
    pub fn observe_sample(&mut self, sample: &IndoorBikeSample) -> Vec<WorkoutEvent> {
        self.observe(sample.power_watts.map(f64::from), sample.cadence_rpm)
    }

    /// [`observe`](Self::observe) an engine snapshot, preferring smoothed power
    pub fn observe_state(&mut self, state: &TrainerState) -> Vec<WorkoutEvent> {
        let power = state
            .smoothed_power_watts
            .or_else(|| state.power_watts.map(f64::from));
        self.observe(power, state.cadence_rpm)
    }

    /// Snapshot of the run, `None` before the first start
    #[must_use]
    pub fn progress(&self) -> Option<WorkoutProgress> {
        let workout = self.workout.as_deref()?;
        let step = workout.steps().get(self.run.step_index)?;
        let total_duration = workout.total_duration();

        Some(WorkoutProgress {
            step_index: self.run.step_index,
            step_total: workout.steps().len(),
            label: step_label(step, self.run.step_index),
            target_watts: step.target_watts,
            power_band: step.power_band(),
            cadence_band: step.cadence_band,
            step_duration: step.duration,
            step_elapsed: self.run.step_elapsed,
            step_remaining: step.duration.saturating_sub(self.run.step_elapsed),
            session_elapsed: self.run.session_elapsed,
            total_duration,
            total_remaining: total_duration.saturating_sub(self.run.session_elapsed),
            status: self.run.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        targets: Mutex<Vec<i32>>,
        reject_above: Option<i32>,
    }

    impl RecordingSink {
        fn targets(&self) -> Vec<i32> {
            self.targets.lock().unwrap().clone()
        }
    }

    impl TargetSink for RecordingSink {
        fn apply_target(&self, watts: i32) -> Result<()> {
            if let Some(max) = self.reject_above {
                if watts > max {
                    return Err(FtmsError::OutOfRange { watts, min: 0, max });
                }
            }
            self.targets.lock().unwrap().push(watts);
            Ok(())
        }
    }

    fn two_steps() -> WorkoutDefinition {
        WorkoutDefinition::new(
            "Test",
            vec![
                WorkoutStep::new(Duration::from_secs(10), 100).with_label("Warmup"),
                WorkoutStep::new(Duration::from_secs(5), 150),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_definition_validation() {
        assert!(WorkoutDefinition::new("empty", Vec::new()).is_err());
        assert!(WorkoutDefinition::new(
            "zero",
            vec![WorkoutStep::new(Duration::ZERO, 100)]
        )
        .is_err());
        assert!(WorkoutDefinition::new(
            "negative",
            vec![WorkoutStep::new(Duration::from_secs(1), -5)]
        )
        .is_err());

        let workout = two_steps();
        assert_eq!(workout.total_duration(), Duration::from_secs(15));
        assert_eq!(workout.name(), "Test");
    }

    #[test]
    fn test_step_transitions_at_exact_boundaries() {
        let sink = Arc::new(RecordingSink::default());
        let mut executor = WorkoutExecutor::new(Arc::clone(&sink));

        let events = executor.start(two_steps()).unwrap();
        assert!(matches!(
            events.as_slice(),
            [WorkoutEvent::Started {
                target_watts: 100,
                ..
            }]
        ));
        assert_eq!(sink.targets(), vec![100]);

        for _ in 0..9 {
            assert!(executor.tick(Duration::from_secs(1)).unwrap().is_empty());
        }
        assert_eq!(executor.run_state().step_index, 0);

        let events = executor.tick(Duration::from_secs(1)).unwrap();
        assert_eq!(
            events,
            vec![WorkoutEvent::StepChanged {
                index: 1,
                target_watts: 150,
                label: "Step 2".to_string()
            }]
        );
        assert_eq!(sink.targets(), vec![100, 150]);

        for _ in 0..4 {
            assert!(executor.tick(Duration::from_secs(1)).unwrap().is_empty());
        }
        assert_eq!(executor.status(), WorkoutStatus::Running);

        let events = executor.tick(Duration::from_secs(1)).unwrap();
        assert_eq!(events, vec![WorkoutEvent::Completed]);
        assert_eq!(executor.status(), WorkoutStatus::Completed);
        assert_eq!(sink.targets(), vec![100, 150]);

        assert!(matches!(
            executor.tick(Duration::from_secs(1)),
            Err(FtmsError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_tick_carries_overshoot() {
        let sink = RecordingSink::default();
        let mut executor = WorkoutExecutor::new(&sink);
        executor.start(two_steps()).unwrap();

        let events = executor.tick(Duration::from_millis(12_500)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(executor.run_state().step_index, 1);
        assert_eq!(executor.run_state().step_elapsed, Duration::from_millis(2_500));

        let events = executor.tick(Duration::from_secs(30)).unwrap();
        assert_eq!(events, vec![WorkoutEvent::Completed]);
        assert_eq!(executor.run_state().session_elapsed, Duration::from_secs(15));

        let progress = executor.progress().unwrap();
        assert_eq!(progress.total_remaining, Duration::ZERO);
        assert_eq!(progress.step_remaining, Duration::ZERO);
    }

    #[test]
    fn test_single_tick_can_cross_several_steps() {
        let sink = RecordingSink::default();
        let mut executor = WorkoutExecutor::new(&sink);
        let workout = WorkoutDefinition::new(
            "Short",
            vec![
                WorkoutStep::new(Duration::from_secs(1), 100),
                WorkoutStep::new(Duration::from_secs(1), 200),
                WorkoutStep::new(Duration::from_secs(1), 300),
            ],
        )
        .unwrap();
        executor.start(workout).unwrap();

        let events = executor.tick(Duration::from_secs(5)).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], WorkoutEvent::Completed);
        assert_eq!(sink.targets(), vec![100, 200, 300]);
    }

    #[test]
    fn test_pause_resume_does_not_reissue_target() {
        let sink = RecordingSink::default();
        let mut executor = WorkoutExecutor::new(&sink);
        executor.start(two_steps()).unwrap();
        executor.tick(Duration::from_secs(3)).unwrap();

        assert_eq!(executor.pause().unwrap(), vec![WorkoutEvent::Paused]);
        assert!(executor.tick(Duration::from_secs(60)).unwrap().is_empty());
        assert_eq!(executor.run_state().step_elapsed, Duration::from_secs(3));
        assert!(executor.pause().is_err());

        assert_eq!(executor.resume().unwrap(), vec![WorkoutEvent::Resumed]);
        assert!(executor.resume().is_err());
        assert_eq!(sink.targets(), vec![100]);

        executor.tick(Duration::from_secs(7)).unwrap();
        assert_eq!(sink.targets(), vec![100, 150]);
    }

    #[test]
    fn test_start_and_stop_lifecycle() {
        let sink = RecordingSink::default();
        let mut executor = WorkoutExecutor::new(&sink);
        assert!(executor.tick(Duration::from_secs(1)).is_err());
        assert!(executor.progress().is_none());

        executor.start(two_steps()).unwrap();
        assert!(executor.start(two_steps()).is_err());

        assert_eq!(executor.stop(), vec![WorkoutEvent::Stopped]);
        assert!(executor.stop().is_empty());
        assert_eq!(executor.status(), WorkoutStatus::Idle);

        executor.start(two_steps()).unwrap();
        executor.tick(Duration::from_secs(15)).unwrap();
        assert_eq!(executor.status(), WorkoutStatus::Completed);
        assert!(executor.start(two_steps()).is_ok());
        assert_eq!(executor.run_state().session_elapsed, Duration::ZERO);
    }

    #[test]
    fn test_rejected_target_is_reported_not_fatal() {
        let sink = RecordingSink {
            reject_above: Some(120),
            ..RecordingSink::default()
        };
        let mut executor = WorkoutExecutor::new(&sink);
        executor.start(two_steps()).unwrap();

        let events = executor.tick(Duration::from_secs(10)).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            WorkoutEvent::TargetFailed { watts: 150, .. }
        ));
        assert_eq!(executor.run_state().step_index, 1);
    }

    #[test]
    fn test_progress_snapshot() {
        let sink = RecordingSink::default();
        let mut executor = WorkoutExecutor::new(&sink);
        executor.start(two_steps()).unwrap();
        executor.tick(Duration::from_secs(4)).unwrap();

        let progress = executor.progress().unwrap();
        assert_eq!(progress.label, "Warmup");
        assert_eq!(progress.step_total, 2);
        assert_eq!(progress.power_band, Band::around_target(100));
        assert_eq!(progress.step_remaining, Duration::from_secs(6));
        assert_eq!(progress.total_remaining, Duration::from_secs(11));
    }

    #[test]
    fn test_zone_changes_emitted_once() {
        let sink = RecordingSink::default();
        let mut executor = WorkoutExecutor::new(&sink);
        let mut events = executor.subscribe();
        executor.start(two_steps()).unwrap();

        let first = executor.observe_sample(&IndoorBikeSample::new(Some(100), None));
        assert!(first.contains(&WorkoutEvent::ZoneChanged {
            zone: Zone::InZone
        }));
        assert!(executor
            .observe_sample(&IndoorBikeSample::new(Some(101), None))
            .is_empty());

        let changed = executor.observe_sample(&IndoorBikeSample::new(Some(60), None));
        assert_eq!(
            changed,
            vec![WorkoutEvent::ZoneChanged {
                zone: Zone::OutOfZone
            }]
        );
        assert_eq!(executor.zone(), Some(Zone::OutOfZone));

        assert!(matches!(
            events.try_recv().unwrap(),
            WorkoutEvent::Started { .. }
        ));
    }

    #[test]
    fn test_coaching_is_stabilized_on_workout_clock() {
        let sink = RecordingSink::default();
        let mut executor = WorkoutExecutor::new(&sink);
        executor.start(two_steps()).unwrap();

        executor.observe(Some(100.0), None);
        assert_eq!(executor.coaching(), Some(Coaching::default()));

        executor.observe(Some(60.0), None);
        executor.tick(Duration::from_secs(1)).unwrap();
        executor.observe(Some(60.0), None);
        assert!(executor.coaching().unwrap().is_ok());

        executor.tick(Duration::from_secs(1)).unwrap();
        let events = executor.observe(Some(60.0), None);
        assert!(events
            .iter()
            .any(|event| matches!(event, WorkoutEvent::CoachingChanged { .. })));
        assert!(!executor.coaching().unwrap().is_ok());
    }
}
