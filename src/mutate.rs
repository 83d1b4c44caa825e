//!
//! Per-stream mutations
//! --------------------
//! Transformations applied to a single stream before aggregation: identity,
//! resampling onto a uniform grid (AVERAGE by linear interpolation, MIN/MAX
//! by bucket extremum), RATE / RATE_SIGNED, DELTA and LATEST. Requested
//! mutations are chained in order, each consuming the previous output.
//! Non-numeric (text) samples pass through NONE and LATEST untouched but are
//! ignored by the numeric transforms.

use crate::error::{Result, StoreError};
use crate::protocol::{Mutation, MutationKind, Value, ValueStream};

/// Resamples a non-uniform series onto a uniform grid.
///
/// The grid base is `first_input_ts - (first_input_ts % interval)` and
/// outputs lie at `base + k*interval` for k >= 1. A grid point that
/// coincides with an input passes that input through; one that falls
/// between two inputs is linearly interpolated; nothing is emitted before
/// the first input or after the last. Input gaps wider than `max_gap`
/// (when non-zero) produce no interpolated samples.
pub struct UniformSeries {
    interval: u64,
    max_gap: u64,
    base_timestamp: u64,
    points_input: u64,
    points_output: u64,
    last_timestamp: u64,
    last_value: f64,
}

impl UniformSeries {
    pub fn new(interval: u64, max_gap: u64) -> Self {
        UniformSeries {
            interval,
            max_gap,
            base_timestamp: 0,
            points_input: 0,
            points_output: 0,
            last_timestamp: 0,
            last_value: 0.0,
        }
    }

    /// Feed one input point; returns the grid points that became computable.
    pub fn add_point(&mut self, timestamp: u64, value: f64) -> Vec<Value> {
        self.points_input += 1;
        if self.points_input == 1 {
            self.base_timestamp = timestamp - (timestamp % self.interval);
            self.points_output = 1;
            self.last_timestamp = timestamp;
            self.last_value = value;
            return Vec::new();
        }
        let mut output = Vec::new();
        loop {
            let next = self.base_timestamp + self.interval * self.points_output;
            if timestamp == next {
                self.points_output += 1;
                output.push(Value::double(timestamp, value));
                break;
            } else if timestamp < next {
                break;
            }
            let span = timestamp - self.last_timestamp;
            let interpolate = self.max_gap == 0 || span <= self.max_gap;
            let mut next = next;
            while timestamp > next {
                if interpolate && span > 0 {
                    let fraction = (next - self.last_timestamp) as f64 / span as f64;
                    let interpolated = self.last_value + (value - self.last_value) * fraction;
                    output.push(Value::double(next, interpolated));
                }
                self.points_output += 1;
                next = self.base_timestamp + self.interval * self.points_output;
            }
        }
        self.last_timestamp = timestamp;
        self.last_value = value;
        output
    }
}

/// Numeric points of a stream as (timestamp, value) pairs, text samples
/// skipped.
fn numeric_points(stream: &ValueStream) -> Vec<(u64, f64)> {
    stream
        .values
        .iter()
        .filter_map(|v| v.as_double().map(|d| (v.timestamp, d)))
        .collect()
}

fn require_resample_args(mutation: &Mutation) -> Result<(u64, u64)> {
    let frequency = mutation.sample_frequency.unwrap_or(0);
    let max_gap = mutation.max_gap_interpolate.unwrap_or(0);
    if frequency == 0 || max_gap == 0 {
        return Err(StoreError::InvalidArgument(
            "resampling mutations require sample_frequency and max_gap_interpolate".into(),
        ));
    }
    Ok((frequency, max_gap))
}

/// Apply one mutation, producing a new stream with the same variable.
pub fn apply_mutation(mutation: &Mutation, input: &ValueStream) -> Result<ValueStream> {
    let mut output = ValueStream::new(input.variable.clone());
    if input.values.is_empty() {
        return Ok(output);
    }
    match mutation.kind {
        MutationKind::None => {
            output.values = input.values.clone();
        }
        MutationKind::Average => {
            let (frequency, max_gap) = require_resample_args(mutation)?;
            let mut series = UniformSeries::new(frequency, max_gap);
            for (ts, value) in numeric_points(input) {
                output.values.extend(series.add_point(ts, value));
            }
        }
        MutationKind::Min | MutationKind::Max => {
            let (frequency, _max_gap) = require_resample_args(mutation)?;
            output.values = bucket_extremum(
                &numeric_points(input),
                frequency,
                mutation.kind == MutationKind::Min,
            );
        }
        MutationKind::Rate => {
            output.values = rates(&numeric_points(input), true);
        }
        MutationKind::RateSigned => {
            output.values = rates(&numeric_points(input), false);
        }
        MutationKind::Delta => {
            let points = numeric_points(input);
            for pair in points.windows(2) {
                output
                    .values
                    .push(Value::double(pair[1].0, pair[1].1 - pair[0].1));
            }
        }
        MutationKind::Latest => {
            if let Some(last) = input.values.last() {
                output.values.push(last.clone());
            }
        }
    }
    Ok(output)
}

/// Apply a chain of mutations in request order.
pub fn apply_mutations(mutations: &[Mutation], input: &ValueStream) -> Result<ValueStream> {
    let mut current = input.clone();
    for mutation in mutations {
        current = apply_mutation(mutation, &current)?;
    }
    Ok(current)
}

/// MIN/MAX share the AVERAGE grid but take the extremum of the raw inputs
/// inside each `(T - interval, T]` bucket; empty buckets emit nothing.
fn bucket_extremum(points: &[(u64, f64)], interval: u64, take_min: bool) -> Vec<Value> {
    let mut output = Vec::new();
    let first = match points.first() {
        Some(&(ts, _)) => ts,
        None => return output,
    };
    let base = first - (first % interval);
    let mut k = 1u64;
    let mut i = 0usize;
    let last_ts = points[points.len() - 1].0;
    while i < points.len() {
        let target = base + interval * k;
        let mut extremum: Option<f64> = None;
        while i < points.len() && points[i].0 <= target {
            let v = points[i].1;
            extremum = Some(match extremum {
                Some(e) if take_min => e.min(v),
                Some(e) => e.max(v),
                None => v,
            });
            i += 1;
        }
        if let Some(e) = extremum {
            output.push(Value::double(target, e));
        }
        if target >= last_ts {
            break;
        }
        k += 1;
    }
    output
}

fn rates(points: &[(u64, f64)], clamp_negative: bool) -> Vec<Value> {
    let mut output = Vec::new();
    for pair in points.windows(2) {
        let (t0, v0) = pair[0];
        let (t1, v1) = pair[1];
        if t1 == t0 {
            continue;
        }
        let mut rate = (v1 - v0) / (t1 - t0) as f64;
        if clamp_negative && rate < 0.0 {
            rate = 0.0;
        }
        output.push(Value::double(t1, rate));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ValueStream;
    use crate::variable::Variable;

    fn stream(points: &[(u64, f64)]) -> ValueStream {
        let mut s = ValueStream::new(Variable::new("/m"));
        for &(ts, v) in points {
            s.values.push(Value::double(ts, v));
        }
        s
    }

    #[test]
    fn uniform_resampling_reference_vector() {
        let inputs = [
            (0, 10.0),
            (1, 10.0),
            (30, 60.0),
            (41, 70.0),
            (70, 130.0),
            (130, 280.0),
            (190, 460.0),
            (240, 460.0),
            (250, 710.0),
            (305, 840.0),
            (470, 1034.0),
            (900, 1630.0),
        ];
        let expected = [
            (60, 109.31035),
            (120, 255.0),
            (180, 430.0),
            (240, 460.0),
            (300, 828.1818),
            (360, 904.6667),
            (420, 975.2121),
            (480, 1047.8605),
            (540, 1131.0233),
            (600, 1214.1860),
            (660, 1297.3488),
            (720, 1380.5116),
            (780, 1463.6744),
            (840, 1546.8372),
            (900, 1630.0),
        ];
        let mutation = Mutation::resample(MutationKind::Average, 60, 1_000_000);
        let out = apply_mutation(&mutation, &stream(&inputs)).unwrap();
        assert_eq!(out.values.len(), expected.len());
        for (value, &(ts, want)) in out.values.iter().zip(expected.iter()) {
            assert_eq!(value.timestamp, ts);
            let got = value.as_double().unwrap();
            assert!(
                (got - want).abs() < 1e-4,
                "at t={ts}: got {got}, want {want}"
            );
        }
    }

    #[test]
    fn resampling_respects_max_gap() {
        // 430 ms gap between the last two inputs; with max_gap 100 nothing
        // may be interpolated inside it.
        let inputs = [(0, 0.0), (60, 60.0), (470, 470.0), (900, 900.0)];
        let mutation = Mutation::resample(MutationKind::Average, 60, 100);
        let out = apply_mutation(&mutation, &stream(&inputs)).unwrap();
        assert!(out
            .values
            .iter()
            .all(|v| v.timestamp <= 60 || v.timestamp == 900));
        assert_eq!(out.values.first().unwrap().timestamp, 60);
        assert_eq!(out.values.last().unwrap().timestamp, 900);
    }

    #[test]
    fn resampling_requires_arguments() {
        let mutation = Mutation::plain(MutationKind::Average);
        assert!(apply_mutation(&mutation, &stream(&[(0, 1.0)])).is_err());
    }

    #[test]
    fn rate_is_per_millisecond_and_clamped() {
        let s = stream(&[(0, 10.0), (1000, 20.0), (2000, 40.0), (3000, 5.0)]);
        let out = apply_mutation(&Mutation::plain(MutationKind::Rate), &s).unwrap();
        let got: Vec<(u64, f64)> = out
            .values
            .iter()
            .map(|v| (v.timestamp, v.as_double().unwrap()))
            .collect();
        assert_eq!(got, vec![(1000, 0.01), (2000, 0.02), (3000, 0.0)]);
    }

    #[test]
    fn rate_signed_preserves_negatives() {
        let s = stream(&[(0, 40.0), (1000, 20.0)]);
        let out = apply_mutation(&Mutation::plain(MutationKind::RateSigned), &s).unwrap();
        assert_eq!(out.values[0].as_double().unwrap(), -0.02);
    }

    #[test]
    fn delta_and_latest() {
        let s = stream(&[(0, 10.0), (1000, 25.0), (2000, 15.0)]);
        let delta = apply_mutation(&Mutation::plain(MutationKind::Delta), &s).unwrap();
        let got: Vec<f64> = delta
            .values
            .iter()
            .map(|v| v.as_double().unwrap())
            .collect();
        assert_eq!(got, vec![15.0, -10.0]);

        let latest = apply_mutation(&Mutation::plain(MutationKind::Latest), &s).unwrap();
        assert_eq!(latest.values.len(), 1);
        assert_eq!(latest.values[0].timestamp, 2000);
    }

    #[test]
    fn min_max_bucket_extrema() {
        let s = stream(&[(10, 5.0), (20, 9.0), (70, 2.0), (110, 7.0)]);
        let min = apply_mutation(&Mutation::resample(MutationKind::Min, 60, 1_000), &s).unwrap();
        let max = apply_mutation(&Mutation::resample(MutationKind::Max, 60, 1_000), &s).unwrap();
        let min_got: Vec<(u64, f64)> = min
            .values
            .iter()
            .map(|v| (v.timestamp, v.as_double().unwrap()))
            .collect();
        let max_got: Vec<(u64, f64)> = max
            .values
            .iter()
            .map(|v| (v.timestamp, v.as_double().unwrap()))
            .collect();
        assert_eq!(min_got, vec![(60, 5.0), (120, 2.0)]);
        assert_eq!(max_got, vec![(60, 9.0), (120, 7.0)]);
    }

    #[test]
    fn chained_mutations_consume_previous_output() {
        let s = stream(&[(0, 0.0), (1000, 10.0), (2000, 30.0)]);
        let chain = [
            Mutation::plain(MutationKind::Delta),
            Mutation::plain(MutationKind::Latest),
        ];
        let out = apply_mutations(&chain, &s).unwrap();
        assert_eq!(out.values.len(), 1);
        assert_eq!(out.values[0].as_double().unwrap(), 20.0);
    }
}
