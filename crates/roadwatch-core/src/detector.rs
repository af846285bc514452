//! Anomaly detection over chronologically ordered readings.
//!
//! Two variants share the [`AnomalyDetector`] seam: [`ThresholdDetector`]
//! classifies raw vibration with peak/cooldown and sustained-band rules, and
//! [`FlagDetector`] trusts booleans already set by the device. [`DetectorSet`]
//! picks one per reading from the fields the payload exposed.

use crate::{AnomalyEvent, AnomalyKind, Reading, Severity};
use serde::{Deserialize, Serialize};

const FLAG_HIGH_VIBRATION: f64 = 9.0;
const FLAG_MEDIUM_VIBRATION: f64 = 7.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorThresholds {
    pub min_speed: f64,
    /// Speeds below this are GPS jitter and count as standing still.
    pub speed_noise: f64,
    pub peak_delta: f64,
    pub z_min_threshold: f64,
    pub cooldown_ms: i64,
    pub high_z_threshold: f64,
    pub patchy_min: f64,
    pub patchy_max: f64,
    pub patchy_duration_ms: i64,
    pub patchy_reset_ms: i64,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            min_speed: 5.0,
            speed_noise: 1.0,
            peak_delta: 4.0,
            z_min_threshold: 7.0,
            cooldown_ms: 2_000,
            high_z_threshold: 9.0,
            patchy_min: 3.0,
            patchy_max: 7.0,
            patchy_duration_ms: 3_000,
            patchy_reset_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorVariant {
    Threshold,
    Flag,
}

impl DetectorVariant {
    pub fn for_reading(reading: &Reading) -> Self {
        if reading.raw_flags.is_some() {
            DetectorVariant::Flag
        } else {
            DetectorVariant::Threshold
        }
    }
}

pub trait AnomalyDetector {
    /// Feeds the next reading; readings must arrive in non-decreasing time order.
    fn observe(&mut self, reading: &Reading) -> Vec<AnomalyEvent>;
}

#[derive(Debug, Clone, Default)]
struct PatchyRun {
    started_at: Option<i64>,
    last_in_band_at: Option<i64>,
    alert_sent: bool,
}

#[derive(Debug, Clone)]
pub struct ThresholdDetector {
    thresholds: DetectorThresholds,
    previous_vibration: f64,
    pothole_fired: bool,
    last_pothole_at: Option<i64>,
    patchy: PatchyRun,
}

impl ThresholdDetector {
    pub fn new(thresholds: DetectorThresholds) -> Self {
        Self {
            thresholds,
            previous_vibration: 0.0,
            pothole_fired: false,
            last_pothole_at: None,
            patchy: PatchyRun::default(),
        }
    }

    fn qualifying_speed(&self, speed: f64) -> bool {
        if !speed.is_finite() {
            return false;
        }
        let speed = if speed < self.thresholds.speed_noise {
            0.0
        } else {
            speed
        };
        speed >= self.thresholds.min_speed
    }

    fn observe_patchy(&mut self, reading: &Reading, moving: bool) -> Option<AnomalyEvent> {
        let now = reading.timestamp_ms?;

        if let Some(last) = self.patchy.last_in_band_at {
            if now - last > self.thresholds.patchy_reset_ms {
                self.patchy = PatchyRun::default();
            }
        }

        let vibration = reading.vibration;
        let in_band = moving
            && vibration.is_finite()
            && vibration >= self.thresholds.patchy_min
            && vibration < self.thresholds.patchy_max;
        if !in_band {
            return None;
        }

        let started_at = *self.patchy.started_at.get_or_insert(now);
        self.patchy.last_in_band_at = Some(now);
        if self.patchy.alert_sent || now - started_at < self.thresholds.patchy_duration_ms {
            return None;
        }

        self.patchy.alert_sent = true;
        Some(AnomalyEvent {
            kind: AnomalyKind::Patchy,
            latitude: reading.latitude,
            longitude: reading.longitude,
            severity: Severity::Low,
            timestamp_ms: Some(now),
        })
    }

    fn observe_pothole(&mut self, reading: &Reading, moving: bool) -> Option<AnomalyEvent> {
        let vibration = reading.vibration;
        if !moving || !vibration.is_finite() {
            return None;
        }
        if (vibration - self.previous_vibration).abs() <= self.thresholds.peak_delta
            || vibration < self.thresholds.z_min_threshold
        {
            return None;
        }

        let cooled_down = if !self.pothole_fired {
            true
        } else {
            match (reading.timestamp_ms, self.last_pothole_at) {
                (Some(now), Some(last)) => now - last > self.thresholds.cooldown_ms,
                (Some(_), None) => true,
                (None, _) => false,
            }
        };
        if !cooled_down {
            return None;
        }

        self.pothole_fired = true;
        self.last_pothole_at = reading.timestamp_ms;
        let severity = if vibration >= self.thresholds.high_z_threshold {
            Severity::High
        } else {
            Severity::Medium
        };
        Some(AnomalyEvent {
            kind: AnomalyKind::Pothole,
            latitude: reading.latitude,
            longitude: reading.longitude,
            severity,
            timestamp_ms: reading.timestamp_ms,
        })
    }
}

impl AnomalyDetector for ThresholdDetector {
    fn observe(&mut self, reading: &Reading) -> Vec<AnomalyEvent> {
        let moving = self.qualifying_speed(reading.speed);

        // patchy is checked first and suppresses a pothole on the same reading
        let event = match self.observe_patchy(reading, moving) {
            Some(event) => Some(event),
            None => self.observe_pothole(reading, moving),
        };

        if reading.vibration.is_finite() {
            self.previous_vibration = reading.vibration;
        }
        event.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlagDetector;

impl FlagDetector {
    fn pothole_severity(vibration: f64) -> Severity {
        if vibration >= FLAG_HIGH_VIBRATION {
            Severity::High
        } else if vibration >= FLAG_MEDIUM_VIBRATION {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl AnomalyDetector for FlagDetector {
    fn observe(&mut self, reading: &Reading) -> Vec<AnomalyEvent> {
        let Some(flags) = reading.raw_flags else {
            return Vec::new();
        };
        if !flags.any() || !reading.has_gps_lock() {
            return Vec::new();
        }

        let mut events = Vec::with_capacity(2);
        if flags.pothole {
            events.push(AnomalyEvent {
                kind: AnomalyKind::Pothole,
                latitude: reading.latitude,
                longitude: reading.longitude,
                severity: Self::pothole_severity(reading.vibration),
                timestamp_ms: reading.timestamp_ms,
            });
        }
        if flags.patchy {
            events.push(AnomalyEvent {
                kind: AnomalyKind::Patchy,
                latitude: reading.latitude,
                longitude: reading.longitude,
                severity: Severity::Low,
                timestamp_ms: reading.timestamp_ms,
            });
        }
        events
    }
}

/// Both detector variants with their state, scoped to one reconciliation
/// pass or one watched stream.
#[derive(Debug, Clone)]
pub struct DetectorSet {
    threshold: ThresholdDetector,
    flags: FlagDetector,
}

impl DetectorSet {
    pub fn new(thresholds: DetectorThresholds) -> Self {
        Self {
            threshold: ThresholdDetector::new(thresholds),
            flags: FlagDetector,
        }
    }
}

impl AnomalyDetector for DetectorSet {
    fn observe(&mut self, reading: &Reading) -> Vec<AnomalyEvent> {
        match DetectorVariant::for_reading(reading) {
            DetectorVariant::Flag => self.flags.observe(reading),
            DetectorVariant::Threshold => self.threshold.observe(reading),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_reading;
    use crate::RawFlags;
    use serde_json::json;

    const T0: i64 = 1_700_000_000_000;

    fn reading(offset_ms: i64, vibration: f64, speed: f64) -> Reading {
        Reading {
            latitude: 12.9713,
            longitude: 77.5946,
            vibration,
            speed,
            timestamp_ms: Some(T0 + offset_ms),
            raw_flags: None,
        }
    }

    fn run(detector: &mut impl AnomalyDetector, readings: &[Reading]) -> Vec<AnomalyEvent> {
        readings
            .iter()
            .flat_map(|reading| detector.observe(reading))
            .collect()
    }

    #[test]
    fn small_vibrations_never_fire_a_pothole() {
        let mut detector = ThresholdDetector::new(DetectorThresholds::default());
        let readings: Vec<Reading> = (0..50)
            .map(|i| reading(i * 100, if i % 2 == 0 { 1.0 } else { 2.5 }, 30.0))
            .collect();
        assert!(run(&mut detector, &readings).is_empty());
    }

    #[test]
    fn pothole_needs_speed_delta_and_magnitude() {
        let mut detector = ThresholdDetector::new(DetectorThresholds::default());
        // standing still
        assert!(detector.observe(&reading(0, 10.0, 0.5)).is_empty());
        // previous is now 10.0, so the delta is too small
        assert!(detector.observe(&reading(100, 9.5, 30.0)).is_empty());
        assert!(detector.observe(&reading(200, 1.0, 30.0)).is_empty());

        let events = detector.observe(&reading(300, 8.0, 30.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AnomalyKind::Pothole);
        assert_eq!(events[0].severity, Severity::Medium);
        assert_eq!(events[0].timestamp_ms, Some(T0 + 300));
    }

    #[test]
    fn pothole_cooldown_resets_on_each_firing() {
        let mut detector = ThresholdDetector::new(DetectorThresholds::default());
        let readings = [
            reading(0, 0.0, 30.0),
            reading(100, 10.0, 30.0),
            reading(200, 0.0, 30.0),
            reading(1_500, 10.0, 30.0),
            reading(1_600, 0.0, 30.0),
            reading(2_200, 10.0, 30.0),
        ];
        let events = run(&mut detector, &readings);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, Severity::High);
        assert_eq!(events[0].timestamp_ms, Some(T0 + 100));
        assert_eq!(events[1].timestamp_ms, Some(T0 + 2_200));
    }

    #[test]
    fn patchy_fires_once_at_duration_boundary() {
        let thresholds = DetectorThresholds::default();
        let mut detector = ThresholdDetector::new(thresholds);
        let mut readings = vec![reading(-500, 1.0, 30.0)];
        readings.extend((0..=12).map(|i| reading(i * 500, 5.0, 30.0)));

        let events = run(&mut detector, &readings);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AnomalyKind::Patchy);
        assert_eq!(events[0].severity, Severity::Low);
        assert_eq!(events[0].timestamp_ms, Some(T0 + thresholds.patchy_duration_ms));
    }

    #[test]
    fn brief_dip_does_not_restart_the_patchy_run() {
        let mut detector = ThresholdDetector::new(DetectorThresholds::default());
        let readings = [
            reading(0, 5.0, 30.0),
            reading(900, 5.0, 30.0),
            reading(1_500, 1.0, 30.0),
            reading(1_900, 5.0, 30.0),
            reading(2_800, 5.0, 30.0),
            reading(3_000, 5.0, 30.0),
        ];
        let events = run(&mut detector, &readings);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp_ms, Some(T0 + 3_000));
    }

    #[test]
    fn long_gap_breaks_the_run_and_rearms_the_alert() {
        let mut detector = ThresholdDetector::new(DetectorThresholds::default());
        let mut readings: Vec<Reading> = (0..=6).map(|i| reading(i * 500, 5.0, 30.0)).collect();
        readings.push(reading(3_200, 1.0, 30.0));
        readings.push(reading(4_500, 1.0, 30.0));
        readings.extend((0..=6).map(|i| reading(5_000 + i * 500, 5.0, 30.0)));

        let events = run(&mut detector, &readings);
        let stamps: Vec<_> = events.iter().map(|event| event.timestamp_ms).collect();
        assert_eq!(stamps, vec![Some(T0 + 3_000), Some(T0 + 8_000)]);
    }

    #[test]
    fn patchy_wins_the_tie_and_previous_vibration_still_advances() {
        let thresholds = DetectorThresholds {
            patchy_max: 12.0,
            ..DetectorThresholds::default()
        };
        let mut detector = ThresholdDetector::new(thresholds);
        let mut readings: Vec<Reading> = (0..6).map(|i| reading(i * 500, 3.5, 30.0)).collect();
        readings.push(reading(3_000, 10.0, 30.0));
        let events = run(&mut detector, &readings);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AnomalyKind::Patchy);

        // the 10.0 above became the new baseline, so 3.5 -> 10.0 fires again
        assert!(detector.observe(&reading(3_100, 3.5, 30.0)).is_empty());
        let events = detector.observe(&reading(3_200, 10.0, 30.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AnomalyKind::Pothole);
        assert_eq!(events[0].severity, Severity::High);
    }

    #[test]
    fn flag_detector_emits_one_event_per_true_flag() {
        let mut detector = FlagDetector;
        let mut flagged = reading(0, 7.5, 0.0);
        flagged.raw_flags = Some(RawFlags {
            pothole: true,
            patchy: true,
        });
        let events = detector.observe(&flagged);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, AnomalyKind::Pothole);
        assert_eq!(events[0].severity, Severity::Medium);
        assert_eq!(events[1].kind, AnomalyKind::Patchy);
        assert_eq!(events[1].severity, Severity::Low);

        let mut lowered = flagged;
        lowered.raw_flags = Some(RawFlags::default());
        assert!(detector.observe(&lowered).is_empty());

        flagged.vibration = f64::NAN;
        assert_eq!(detector.observe(&flagged)[0].severity, Severity::Low);

        flagged.latitude = 0.0;
        flagged.longitude = 0.0;
        assert!(detector.observe(&flagged).is_empty());
    }

    #[test]
    fn detector_set_routes_flagged_payloads_to_the_flag_variant() {
        let payload = json!({"lat": 12.9, "lng": 77.5, "potholeFlag": true, "zCorrected": 10});
        let reading = normalize_reading(&payload, None).expect("valid reading");
        assert_eq!(DetectorVariant::for_reading(&reading), DetectorVariant::Flag);

        let mut detectors = DetectorSet::new(DetectorThresholds::default());
        let events = detectors.observe(&reading);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AnomalyKind::Pothole);
        assert_eq!(events[0].severity, Severity::High);
    }
}
