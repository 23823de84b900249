//! Publish-time windows used to gate reads.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Accepted publish interval for one round, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub time_min: DateTime<Utc>,
    pub time_max: DateTime<Utc>,
}

/// Where a publish timestamp falls relative to a [`TimeWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPosition {
    TooEarly,
    Inside,
    TooLate,
}

impl TimeWindow {
    pub fn new(time_min: DateTime<Utc>, time_max: DateTime<Utc>) -> Self {
        Self { time_min, time_max }
    }

    /// Window starting at the anchor block timestamp and lasting `delta_seconds`.
    pub fn from_anchor(anchor: DateTime<Utc>, delta_seconds: i64) -> Self {
        Self {
            time_min: anchor,
            time_max: anchor + Duration::seconds(delta_seconds),
        }
    }

    pub fn classify(&self, published_at: DateTime<Utc>) -> WindowPosition {
        if published_at < self.time_min {
            WindowPosition::TooEarly
        } else if published_at > self.time_max {
            WindowPosition::TooLate
        } else {
            WindowPosition::Inside
        }
    }

    pub fn contains(&self, published_at: DateTime<Utc>) -> bool {
        self.classify(published_at) == WindowPosition::Inside
    }
}
