//! Discretized situational context.
//!
//! A [`ContextKey`] buckets the continuous inputs of a user snapshot (energy,
//! capacity utilization, day of week, season intensity) into a small
//! enumerated key. It is the lookup key of the playbook and the shared
//! bucketing used by rules and the escalation controller.

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;
use crate::snapshot::UserStateSnapshot;

/// Three-level bucket used for energy and season intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelBucket {
    Low,
    Medium,
    High,
}

impl LevelBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelBucket::Low => "low",
            LevelBucket::Medium => "medium",
            LevelBucket::High => "high",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(LevelBucket::Low),
            "medium" => Some(LevelBucket::Medium),
            "high" => Some(LevelBucket::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityBucket {
    Light,
    Full,
    Overloaded,
}

impl CapacityBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityBucket::Light => "light",
            CapacityBucket::Full => "full",
            CapacityBucket::Overloaded => "overloaded",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "light" => Some(CapacityBucket::Light),
            "full" => Some(CapacityBucket::Full),
            "overloaded" => Some(CapacityBucket::Overloaded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayTypeBucket {
    Weekday,
    Weekend,
}

impl DayTypeBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayTypeBucket::Weekday => "weekday",
            DayTypeBucket::Weekend => "weekend",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "weekday" => Some(DayTypeBucket::Weekday),
            "weekend" => Some(DayTypeBucket::Weekend),
            _ => None,
        }
    }
}

/// Fixed thresholds used by [`ContextKey::from_values`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketThresholds {
    /// Energy at or below this is `Low`.
    #[serde(default = "default_low_max")]
    pub energy_low_max: u8,
    /// Energy at or above this is `High`.
    #[serde(default = "default_high_min")]
    pub energy_high_min: u8,
    /// Utilization strictly above this is `Overloaded`.
    #[serde(default = "default_overloaded_above")]
    pub capacity_overloaded_above: f64,
    /// Utilization at or above this is `Full`.
    #[serde(default = "default_full_min")]
    pub capacity_full_min: f64,
    #[serde(default = "default_low_max")]
    pub season_low_max: u8,
    #[serde(default = "default_high_min")]
    pub season_high_min: u8,
}

fn default_low_max() -> u8 {
    2
}
fn default_high_min() -> u8 {
    4
}
fn default_overloaded_above() -> f64 {
    1.2
}
fn default_full_min() -> f64 {
    0.8
}

impl Default for BucketThresholds {
    fn default() -> Self {
        Self {
            energy_low_max: default_low_max(),
            energy_high_min: default_high_min(),
            capacity_overloaded_above: default_overloaded_above(),
            capacity_full_min: default_full_min(),
            season_low_max: default_low_max(),
            season_high_min: default_high_min(),
        }
    }
}

impl BucketThresholds {
    fn level(value: u8, low_max: u8, high_min: u8) -> LevelBucket {
        if value <= low_max {
            LevelBucket::Low
        } else if value >= high_min {
            LevelBucket::High
        } else {
            LevelBucket::Medium
        }
    }

    pub fn energy(&self, energy: u8) -> LevelBucket {
        Self::level(energy, self.energy_low_max, self.energy_high_min)
    }

    pub fn season(&self, intensity: u8) -> LevelBucket {
        Self::level(intensity, self.season_low_max, self.season_high_min)
    }

    /// NaN utilization is treated as `Light`.
    pub fn capacity(&self, utilization: f64) -> CapacityBucket {
        if utilization > self.capacity_overloaded_above {
            CapacityBucket::Overloaded
        } else if utilization >= self.capacity_full_min {
            CapacityBucket::Full
        } else {
            CapacityBucket::Light
        }
    }

    pub fn day(weekday: Weekday) -> DayTypeBucket {
        match weekday {
            Weekday::Sat | Weekday::Sun => DayTypeBucket::Weekend,
            _ => DayTypeBucket::Weekday,
        }
    }
}

/// Discretized situational context used as the playbook lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextKey {
    pub energy: LevelBucket,
    pub capacity: CapacityBucket,
    pub day_type: DayTypeBucket,
    pub season_intensity: LevelBucket,
}

impl ContextKey {
    pub fn new(
        energy: LevelBucket,
        capacity: CapacityBucket,
        day_type: DayTypeBucket,
        season_intensity: LevelBucket,
    ) -> Self {
        Self {
            energy,
            capacity,
            day_type,
            season_intensity,
        }
    }

    /// Bucket raw values. Total over every input.
    pub fn from_values(
        thresholds: &BucketThresholds,
        energy: u8,
        capacity_utilization: f64,
        weekday: Weekday,
        season_intensity: u8,
    ) -> Self {
        Self {
            energy: thresholds.energy(energy),
            capacity: thresholds.capacity(capacity_utilization),
            day_type: BucketThresholds::day(weekday),
            season_intensity: thresholds.season(season_intensity),
        }
    }

    pub fn from_snapshot(thresholds: &BucketThresholds, snapshot: &UserStateSnapshot) -> Self {
        Self::from_values(
            thresholds,
            snapshot.energy_level,
            snapshot.capacity_utilization,
            snapshot.weekday(),
            snapshot.season_intensity,
        )
    }

    /// Canonical `energy:capacity:day:season` form.
    pub fn to_storage_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.energy.as_str(),
            self.capacity.as_str(),
            self.day_type.as_str(),
            self.season_intensity.as_str()
        )
    }

    pub fn from_storage_key(key: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidContextKey(key.to_string());
        let mut parts = key.split(':');
        let energy = parts.next().and_then(LevelBucket::parse).ok_or_else(invalid)?;
        let capacity = parts.next().and_then(CapacityBucket::parse).ok_or_else(invalid)?;
        let day_type = parts.next().and_then(DayTypeBucket::parse).ok_or_else(invalid)?;
        let season_intensity = parts.next().and_then(LevelBucket::parse).ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self::new(energy, capacity, day_type, season_intensity))
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_storage_key())
    }
}

impl FromStr for ContextKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_storage_key(s)
    }
}
