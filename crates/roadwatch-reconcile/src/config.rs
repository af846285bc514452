use roadwatch_core::detector::DetectorThresholds;
use serde::Serialize;
use std::str::FromStr;
use tracing::warn;

pub const DEFAULT_ROOT_PATH: &str = "readings";
pub const DEFAULT_BATCH_LIMIT: usize = 500;
pub const MAX_BATCH_LIMIT: usize = 5_000;

/// Settings shared by the batch reconciler and the live watcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileConfig {
    pub root_path: String,
    pub limit: usize,
    pub dry_run: bool,
    pub reprocess: bool,
    pub thresholds: DetectorThresholds,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            root_path: DEFAULT_ROOT_PATH.to_string(),
            limit: DEFAULT_BATCH_LIMIT,
            dry_run: false,
            reprocess: false,
            thresholds: DetectorThresholds::default(),
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(root) = lookup("ROADWATCH_ROOT_PATH").filter(|value| !value.trim().is_empty()) {
            config.root_path = root.trim().to_string();
        }
        if let Some(limit) = parse_override::<usize, F>(&lookup, "ROADWATCH_SYNC_LIMIT") {
            config.limit = clamp_limit(limit);
        }
        if let Some(dry_run) = bool_override(&lookup, "ROADWATCH_DRY_RUN") {
            config.dry_run = dry_run;
        }
        if let Some(reprocess) = bool_override(&lookup, "ROADWATCH_REPROCESS") {
            config.reprocess = reprocess;
        }

        let thresholds = &mut config.thresholds;
        apply_f64(&lookup, "ROADWATCH_MIN_SPEED", &mut thresholds.min_speed);
        apply_f64(&lookup, "ROADWATCH_SPEED_NOISE", &mut thresholds.speed_noise);
        apply_f64(&lookup, "ROADWATCH_PEAK_DELTA", &mut thresholds.peak_delta);
        apply_f64(&lookup, "ROADWATCH_Z_MIN_THRESHOLD", &mut thresholds.z_min_threshold);
        apply_i64(&lookup, "ROADWATCH_COOLDOWN_MS", &mut thresholds.cooldown_ms);
        apply_f64(&lookup, "ROADWATCH_HIGH_Z_THRESHOLD", &mut thresholds.high_z_threshold);
        apply_f64(&lookup, "ROADWATCH_PATCHY_MIN", &mut thresholds.patchy_min);
        apply_f64(&lookup, "ROADWATCH_PATCHY_MAX", &mut thresholds.patchy_max);
        apply_i64(&lookup, "ROADWATCH_PATCHY_DURATION_MS", &mut thresholds.patchy_duration_ms);
        apply_i64(&lookup, "ROADWATCH_PATCHY_RESET_MS", &mut thresholds.patchy_reset_ms);

        config
    }
}

/// Toggles for the process-start hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartupToggles {
    pub sync_on_start: bool,
    pub sync_reprocess: bool,
    pub watcher_enabled: bool,
}

impl Default for StartupToggles {
    fn default() -> Self {
        Self {
            sync_on_start: true,
            sync_reprocess: false,
            watcher_enabled: true,
        }
    }
}

impl StartupToggles {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            sync_on_start: bool_override(&lookup, "ROADWATCH_SYNC_ON_START")
                .unwrap_or(defaults.sync_on_start),
            sync_reprocess: bool_override(&lookup, "ROADWATCH_SYNC_REPROCESS")
                .unwrap_or(defaults.sync_reprocess),
            watcher_enabled: bool_override(&lookup, "ROADWATCH_WATCHER_ENABLED")
                .unwrap_or(defaults.watcher_enabled),
        }
    }
}

/// Zero falls back to the default batch size; anything above the hard cap is cut.
pub fn clamp_limit(limit: usize) -> usize {
    if limit == 0 {
        DEFAULT_BATCH_LIMIT
    } else {
        limit.min(MAX_BATCH_LIMIT)
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn bool_override<F>(lookup: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    let parsed = parse_bool(&raw);
    if parsed.is_none() {
        warn!(event = "config_value_ignored", key, value = %raw);
    }
    parsed
}

fn parse_override<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(event = "config_value_ignored", key, value = %raw);
            None
        }
    }
}

fn apply_f64<F>(lookup: &F, key: &str, target: &mut f64)
where
    F: Fn(&str) -> Option<String>,
{
    match parse_override::<f64, F>(lookup, key) {
        Some(value) if value.is_finite() => *target = value,
        Some(value) => warn!(event = "config_value_ignored", key, value),
        None => {}
    }
}

fn apply_i64<F>(lookup: &F, key: &str, target: &mut i64)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = parse_override::<i64, F>(lookup, key) {
        if value >= 0 {
            *target = value;
        } else {
            warn!(event = "config_value_ignored", key, value);
        }
    }
}
