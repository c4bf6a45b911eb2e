use chrono::Timelike;
use serde::Serialize;

use crate::{config::ScheduleConfig, types::LightPhase};

const SECS_PER_HOUR: i64 = 3_600;
const SECS_PER_DAY: i64 = 86_400;

/// Ramp geometry in seconds since midnight.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Ramps {
    start: i64,
    end: i64,
    plateau: i64,
    baseline: f64,
    offset: i64,
    sunrise: f64,
    sunset: f64,
}

impl Ramps {
    fn plateau_start(&self) -> i64 {
        self.start + self.sunrise.floor() as i64
    }

    fn plateau_end(&self) -> i64 {
        self.plateau_start() + self.plateau
    }
}

/// Computed schedule boundaries for operator visibility.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingReport {
    #[serde(rename = "referenceTime")]
    pub reference_time: String,
    #[serde(rename = "baselineRampSecs")]
    pub baseline_ramp_secs: f64,
    #[serde(rename = "offsetSecs")]
    pub offset_secs: i64,
    #[serde(rename = "sunriseRampSecs")]
    pub sunrise_ramp_secs: f64,
    #[serde(rename = "sunsetRampSecs")]
    pub sunset_ramp_secs: f64,
    #[serde(rename = "sunriseAt")]
    pub sunrise_at: String,
    #[serde(rename = "plateauStart")]
    pub plateau_start: String,
    #[serde(rename = "plateauEnd")]
    pub plateau_end: String,
    #[serde(rename = "sunsetAt")]
    pub sunset_at: String,
    #[serde(rename = "plateauBrightness")]
    pub plateau_brightness: u8,
    pub phase: LightPhase,
    #[serde(rename = "targetBrightness")]
    pub target_brightness: u8,
}

impl ScheduleConfig {
    /// Target brightness percentage for the wall-clock time of `now`.
    pub fn brightness_at<T: Timelike>(&self, now: &T) -> u8 {
        self.evaluate(now).1
    }

    pub fn phase_at<T: Timelike>(&self, now: &T) -> LightPhase {
        self.evaluate(now).0
    }

    pub fn evaluate<T: Timelike>(&self, now: &T) -> (LightPhase, u8) {
        let now_sec = seconds_since_midnight(now);
        let ramps = self.ramps();

        if now_sec < ramps.start || now_sec >= ramps.end {
            return (LightPhase::Off, 0);
        }

        if (now_sec as f64) < ramps.start as f64 + ramps.sunrise {
            let elapsed = (now_sec - ramps.start) as f64;
            return (LightPhase::Sunrise, self.ramp_level(elapsed, ramps.sunrise));
        }

        if now_sec >= ramps.plateau_start() && now_sec < ramps.plateau_end() {
            return (LightPhase::Plateau, self.max_brightness);
        }

        let remaining = (ramps.end - now_sec) as f64;
        (LightPhase::Sunset, self.ramp_level(remaining, ramps.sunset))
    }

    pub fn describe_timing<T: Timelike>(&self, now: &T) -> TimingReport {
        let ramps = self.ramps();
        let (phase, target_brightness) = self.evaluate(now);

        TimingReport {
            reference_time: format_clock(seconds_since_midnight(now)),
            baseline_ramp_secs: ramps.baseline,
            offset_secs: ramps.offset,
            sunrise_ramp_secs: ramps.sunrise,
            sunset_ramp_secs: ramps.sunset,
            sunrise_at: format_clock(ramps.start),
            plateau_start: format_clock(ramps.plateau_start()),
            plateau_end: format_clock(ramps.plateau_end()),
            sunset_at: format_clock(ramps.end),
            plateau_brightness: self.max_brightness,
            phase,
            target_brightness,
        }
    }

    fn ramps(&self) -> Ramps {
        let start = i64::from(self.start_hour) * SECS_PER_HOUR;
        let end = i64::from(self.end_hour) * SECS_PER_HOUR;
        let plateau = i64::from(self.plateau_hours) * SECS_PER_HOUR;
        let baseline = (end - start - plateau) as f64 / 2.0;
        let offset = i64::from(self.plateau_offset_hours) * SECS_PER_HOUR;

        Ramps {
            start,
            end,
            plateau,
            baseline,
            offset,
            sunrise: baseline + offset as f64,
            sunset: baseline - offset as f64,
        }
    }

    /// Linear ramp from `step_size` (fraction 0) to `max_brightness` (fraction 1),
    /// quantized to the step. A ramp with no length jumps straight to the maximum.
    fn ramp_level(&self, progress_secs: f64, ramp_secs: f64) -> u8 {
        if ramp_secs <= 0.0 {
            return self.max_brightness;
        }

        let step = f64::from(self.step_size);
        let max = f64::from(self.max_brightness);
        let fraction = progress_secs / ramp_secs;
        let raw = step + fraction * (max - step);
        let quantized = (raw / step).round() * step;

        quantized.clamp(0.0, max) as u8
    }
}

fn seconds_since_midnight<T: Timelike>(now: &T) -> i64 {
    i64::from(now.num_seconds_from_midnight())
}

fn format_clock(secs: i64) -> String {
    let secs = secs.rem_euclid(SECS_PER_DAY);
    format!(
        "{:02}:{:02}:{:02}",
        secs / SECS_PER_HOUR,
        (secs / 60) % 60,
        secs % 60
    )
}
