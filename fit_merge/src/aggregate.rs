//! Running statistics rebuilt from correlated records.
//!
//! Distances are relative to the first correlated sample, ascent and descent are
//! summed from consecutive altitude deltas, and lap-scoped values reset whenever a
//! lap message is finalized.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::index::{Sample, SampleIndex};
use crate::message::{lap, record, session, FieldValue, FitMessage};

/// What the pipeline does with an event after processing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Forward,
    Rewritten,
    Drop,
}

impl Disposition {
    pub fn is_emitted(self) -> bool {
        !matches!(self, Disposition::Drop)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregationState {
    pub activity_ascent: f64,
    pub activity_descent: f64,
    pub lap_ascent: f64,
    pub lap_descent: f64,
    /// Set together with `activity_start_time` on the first correlated record.
    pub distance_offset: Option<f64>,
    pub total_distance: f64,
    pub lap_distance_base: f64,
    pub activity_max_speed: f64,
    pub lap_max_speed: f64,
    pub activity_start_time: Option<i64>,
    pub lap_start_time: i64,
    pub last_seen_time: i64,
    pub last_altitude: f64,
}

impl AggregationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_anchored(&self) -> bool {
        self.distance_offset.is_some()
    }

    /// Fold one correlated sample observed at `timestamp` into the running totals.
    pub fn absorb(&mut self, timestamp: i64, sample: &Sample) {
        let offset = match self.distance_offset {
            Some(offset) => offset,
            None => {
                debug!(
                    "anchoring activity at t={} (distance offset {:.1} m)",
                    timestamp, sample.distance
                );
                self.distance_offset = Some(sample.distance);
                self.activity_start_time = Some(timestamp);
                self.lap_start_time = timestamp;
                self.last_altitude = sample.altitude;
                sample.distance
            }
        };

        let delta = sample.altitude - self.last_altitude;
        if delta > 0.0 {
            self.activity_ascent += delta;
            self.lap_ascent += delta;
        } else if delta < 0.0 {
            self.activity_descent -= delta;
            self.lap_descent -= delta;
        }

        self.total_distance = sample.distance - offset;
        self.activity_max_speed = self.activity_max_speed.max(sample.speed);
        self.lap_max_speed = self.lap_max_speed.max(sample.speed);
        self.last_altitude = sample.altitude;
        self.last_seen_time = timestamp;
    }

    pub fn lap_elapsed(&self) -> i64 {
        self.last_seen_time - self.lap_start_time
    }

    pub fn activity_elapsed(&self) -> i64 {
        self.activity_start_time
            .map(|start| self.last_seen_time - start)
            .unwrap_or(0)
    }

    fn reset_lap(&mut self) {
        self.lap_ascent = 0.0;
        self.lap_descent = 0.0;
        self.lap_max_speed = 0.0;
        self.lap_start_time = self.last_seen_time;
        self.lap_distance_base = self.total_distance;
    }
}

/// Mean speed over an interval, `None` when the interval is empty.
pub fn average_speed(distance_m: f64, elapsed_s: i64) -> Option<f64> {
    if elapsed_s > 0 {
        Some(distance_m / elapsed_s as f64)
    } else {
        None
    }
}

/// Rewrites device records from the simulator index.
pub struct RecordCorrelator<'a> {
    index: &'a SampleIndex,
}

impl<'a> RecordCorrelator<'a> {
    pub fn new(index: &'a SampleIndex) -> Self {
        Self { index }
    }

    /// Records without a simulator sample at the same second are dropped.
    pub fn correlate(&self, state: &mut AggregationState, msg: &mut FitMessage) -> Disposition {
        let Some(timestamp) = msg.timestamp() else {
            return Disposition::Drop;
        };
        let Some(sample) = self.index.get(timestamp) else {
            return Disposition::Drop;
        };

        state.absorb(timestamp, sample);

        msg.set_f64(record::ALTITUDE, sample.altitude);
        msg.set_f64(record::ENHANCED_ALTITUDE, sample.altitude);
        msg.set_f64(record::DISTANCE, state.total_distance);
        msg.set_f64(record::POSITION_LAT, sample.latitude);
        msg.set_f64(record::POSITION_LONG, sample.longitude);
        msg.set_f64(record::SPEED, sample.speed);
        msg.set_f64(record::ENHANCED_SPEED, sample.speed);
        Disposition::Rewritten
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LapSummary {
    pub lap: usize,
    pub start_time: i64,
    pub elapsed_s: i64,
    pub distance_m: f64,
    pub ascent_m: f64,
    pub descent_m: f64,
    pub avg_speed_mps: f64,
    pub max_speed_mps: f64,
    pub degenerate: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub start: Option<DateTime<Utc>>,
    pub elapsed_s: i64,
    pub distance_m: f64,
    pub ascent_m: f64,
    pub descent_m: f64,
    pub avg_speed_mps: f64,
    pub max_speed_mps: f64,
    pub degenerate: bool,
}

/// Overwrite a lap message with the lap-scoped totals, then start the next lap.
///
/// An empty lap (no correlated record since the previous boundary) gets an average
/// speed of zero.
pub fn finalize_lap(
    state: &mut AggregationState,
    msg: &mut FitMessage,
    lap_number: usize,
    sub_sport: &str,
) -> LapSummary {
    let elapsed = state.lap_elapsed();
    let distance = state.total_distance - state.lap_distance_base;
    let avg = average_speed(distance, elapsed);
    if avg.is_none() {
        warn!("lap {} has no elapsed time, writing zero average speed", lap_number);
    }
    let summary = LapSummary {
        lap: lap_number,
        start_time: state.lap_start_time,
        elapsed_s: elapsed,
        distance_m: distance,
        ascent_m: state.lap_ascent,
        descent_m: state.lap_descent,
        avg_speed_mps: avg.unwrap_or(0.0),
        max_speed_mps: state.lap_max_speed,
        degenerate: avg.is_none(),
    };

    msg.set_f64(lap::TOTAL_ASCENT, summary.ascent_m);
    msg.set_f64(lap::TOTAL_DESCENT, summary.descent_m);
    msg.set_f64(lap::TOTAL_DISTANCE, summary.distance_m);
    msg.set_f64(lap::AVG_SPEED, summary.avg_speed_mps);
    msg.set_f64(lap::ENHANCED_AVG_SPEED, summary.avg_speed_mps);
    msg.set_f64(lap::MAX_SPEED, summary.max_speed_mps);
    msg.set_f64(lap::ENHANCED_MAX_SPEED, summary.max_speed_mps);
    msg.set_f64(lap::TOTAL_ELAPSED_TIME, elapsed as f64);
    msg.set_f64(lap::TOTAL_TIMER_TIME, elapsed as f64);
    msg.set_field(lap::SUB_SPORT, FieldValue::Text(sub_sport.to_string()));

    debug!(
        "lap {}: {:.1} m in {} s, +{:.1}/-{:.1} m",
        lap_number, summary.distance_m, elapsed, summary.ascent_m, summary.descent_m
    );
    state.reset_lap();
    summary
}

/// Overwrite a session message with activity-wide totals. State is left untouched.
pub fn finalize_session(
    state: &AggregationState,
    msg: &mut FitMessage,
    sub_sport: &str,
) -> SessionSummary {
    let elapsed = state.activity_elapsed();
    let avg = average_speed(state.total_distance, elapsed);
    if avg.is_none() {
        warn!("session has no elapsed time, writing zero average speed");
    }
    let summary = SessionSummary {
        start: state
            .activity_start_time
            .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
        elapsed_s: elapsed,
        distance_m: state.total_distance,
        ascent_m: state.activity_ascent,
        descent_m: state.activity_descent,
        avg_speed_mps: avg.unwrap_or(0.0),
        max_speed_mps: state.activity_max_speed,
        degenerate: avg.is_none(),
    };

    msg.set_f64(session::TOTAL_ASCENT, summary.ascent_m);
    msg.set_f64(session::TOTAL_DESCENT, summary.descent_m);
    msg.set_f64(session::AVG_SPEED, summary.avg_speed_mps);
    msg.set_f64(session::ENHANCED_AVG_SPEED, summary.avg_speed_mps);
    msg.set_f64(session::MAX_SPEED, summary.max_speed_mps);
    msg.set_f64(session::ENHANCED_MAX_SPEED, summary.max_speed_mps);
    msg.set_f64(session::TOTAL_DISTANCE, summary.distance_m);
    msg.set_f64(session::TOTAL_ELAPSED_TIME, elapsed as f64);
    msg.set_f64(session::TOTAL_TIMER_TIME, elapsed as f64);
    msg.set_field(session::SUB_SPORT, FieldValue::Text(sub_sport.to_string()));
    summary
}
