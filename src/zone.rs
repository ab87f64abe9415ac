use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::{
    error::{FtmsError, Result},
    protocol::IndoorBikeSample,
    workout::WorkoutStep,
};

/// Relative margin outside a band that still counts as [`Zone::Near`]
pub const DEFAULT_TOLERANCE: f64 = 0.05;

/// How long a new coaching hint must persist before it is shown
pub const DEFAULT_HINT_SWITCH: Duration = Duration::from_secs(2);

/// Compliance of a live metric with the current step, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Zone {
    /// Inside the band, boundaries included
    InZone,
    /// Outside the band but within the tolerance margin
    Near,
    /// Beyond the tolerance margin
    OutOfZone,
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InZone => write!(f, "In Zone"),
            Self::Near => write!(f, "Near"),
            Self::OutOfZone => write!(f, "Out of Zone"),
        }
    }
}

/// Inclusive `[min, max]` range of a metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
}

impl Band {
    /// Create a band
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidParameters`] if a bound is not finite or
    /// `min > max`.
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(FtmsError::InvalidParameters(format!(
                "invalid band [{min}, {max}]"
            )));
        }
        Ok(Self { min, max })
    }

    /// Expected power band for an ERG target: ±5%, rounded, at least 1 W
    #[must_use]
    pub fn around_target(target_watts: i32) -> Self {
        let target = f64::from(target_watts);
        Self {
            min: (target * (1.0 - DEFAULT_TOLERANCE)).round().max(1.0),
            max: (target * (1.0 + DEFAULT_TOLERANCE)).round().max(1.0),
        }
    }

    /// Check if `value` lies inside the band, boundaries included
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0}-{:.0}", self.min, self.max)
    }
}

/// Zone and coaching settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Relative margin counted as [`Zone::Near`]
    pub tolerance: f64,
    /// Minimum persistence of a new coaching hint in milliseconds
    pub hint_switch_ms: u64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            hint_switch_ms: 2_000,
        }
    }
}

/// Classify one value against a band
#[must_use]
pub fn classify_value(value: f64, band: &Band, tolerance: f64) -> Zone {
    if band.contains(value) {
        Zone::InZone
    } else if value >= band.min * (1.0 - tolerance) && value <= band.max * (1.0 + tolerance) {
        Zone::Near
    } else {
        Zone::OutOfZone
    }
}

/// Classify power and cadence against a step, the worse zone wins
///
/// Missing metrics and steps without a cadence band do not count against the rider.
#[must_use]
pub fn classify_metrics(
    power_watts: Option<f64>,
    cadence_rpm: Option<f64>,
    step: &WorkoutStep,
    tolerance: f64,
) -> Zone {
    let power = power_watts.map_or(Zone::InZone, |watts| {
        classify_value(watts, &step.power_band(), tolerance)
    });
    let cadence = match (cadence_rpm, step.cadence_band.as_ref()) {
        (Some(rpm), Some(band)) => classify_value(rpm, band, tolerance),
        _ => Zone::InZone,
    };
    power.max(cadence)
}

/// Classify a live sample against a step using [`DEFAULT_TOLERANCE`]
#[must_use]
pub fn classify(sample: &IndoorBikeSample, step: &WorkoutStep) -> Zone {
    classify_metrics(
        sample.power_watts.map(f64::from),
        sample.cadence_rpm,
        step,
        DEFAULT_TOLERANCE,
    )
}

/// Direction a metric should move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Adjust {
    /// Below the band
    Raise,
    /// Above the band
    Lower,
}

/// Urgency of a coaching hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Hold the zone
    Ok,
    /// Effort too low
    Warn,
    /// Effort too high
    Bad,
}

/// Action hint for the rider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Coaching {
    /// Power correction, if power is outside its band
    pub power: Option<Adjust>,
    /// Cadence correction, if cadence is outside its band
    pub cadence: Option<Adjust>,
}

fn adjust(value: Option<f64>, band: Option<&Band>) -> Option<Adjust> {
    match (value, band) {
        (Some(value), Some(band)) if value < band.min => Some(Adjust::Raise),
        (Some(value), Some(band)) if value > band.max => Some(Adjust::Lower),
        _ => None,
    }
}

impl Coaching {
    /// Compare live power and cadence with the step bands
    #[must_use]
    pub fn evaluate(power_watts: Option<f64>, cadence_rpm: Option<f64>, step: &WorkoutStep) -> Self {
        Self {
            power: adjust(power_watts, Some(&step.power_band())),
            cadence: adjust(cadence_rpm, step.cadence_band.as_ref()),
        }
    }

    /// Exceeding a band is worse than falling short of it
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match (self.power, self.cadence) {
            (Some(Adjust::Lower), _) | (_, Some(Adjust::Lower)) => Severity::Bad,
            (None, None) => Severity::Ok,
            _ => Severity::Warn,
        }
    }

    /// Check if no correction is needed
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.power.is_none() && self.cadence.is_none()
    }
}

impl fmt::Display for Coaching {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hint = |adjust: Adjust, metric: &str| match adjust {
            Adjust::Raise => format!("raise {metric}"),
            Adjust::Lower => format!("lower {metric}"),
        };
        match (self.power, self.cadence) {
            (None, None) => write!(f, "Hold the zone"),
            (Some(power), None) => write!(f, "Action: {}", hint(power, "power")),
            (None, Some(cadence)) => write!(f, "Action: {}", hint(cadence, "cadence")),
            (Some(power), Some(cadence)) => write!(
                f,
                "Action: {} + {}",
                hint(power, "power"),
                hint(cadence, "cadence")
            ),
        }
    }
}

/// Keeps coaching hints from flickering when a metric hovers on a band edge
///
/// A new hint replaces the current one only after it has been the candidate
/// for at least `min_switch`.
#[derive(Debug, Clone)]
pub struct CoachingStabilizer {
    min_switch: Duration,
    current: Option<Coaching>,
    pending: Option<(Coaching, Duration)>,
}

impl CoachingStabilizer {
    /// Create a stabilizer
    #[must_use]
    pub const fn new(min_switch: Duration) -> Self {
        Self {
            min_switch,
            current: None,
            pending: None,
        }
    }

    /// Forget the current and pending hints
    pub fn reset(&mut self) {
        self.current = None;
        self.pending = None;
    }

    /// Hint currently shown
    #[must_use]
    pub const fn current(&self) -> Option<Coaching> {
        self.current
    }

    /// Feed a candidate observed at `now` (time since an arbitrary origin)
    ///
    /// Returns the hint to show and whether it changed.
    pub fn update(&mut self, candidate: Coaching, now: Duration) -> (Coaching, bool) {
        let Some(current) = self.current else {
            self.current = Some(candidate);
            self.pending = None;
            return (candidate, true);
        };

        if candidate == current {
            self.pending = None;
            return (current, false);
        }

        match self.pending {
            Some((pending, since)) if pending == candidate => {
                if now.saturating_sub(since) >= self.min_switch {
                    self.current = Some(candidate);
                    self.pending = None;
                    (candidate, true)
                } else {
                    (current, false)
                }
            }
            _ => {
                self.pending = Some((candidate, now));
                (current, false)
            }
        }
    }
}

impl Default for CoachingStabilizer {
    fn default() -> Self {
        Self::new(DEFAULT_HINT_SWITCH)
    }
}
