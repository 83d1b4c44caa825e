//!
//! Cross-stream aggregation
//! ------------------------
//! Reduces a set of (already mutated) streams into one output stream per
//! partition. Partitions come from the aggregation's group-by labels: for
//! each group-by label, every distinct observed value forms one partition;
//! with no labels the single partition is the whole set. Within a partition
//! all streams are walked in parallel by timestamp: the smallest pending
//! timestamp anchors a bucket, every pending value less than one
//! sample-interval after the anchor joins it, and one aggregate value is
//! emitted at the anchor.

use std::collections::{BTreeMap, BTreeSet};

use crate::protocol::{Aggregation, AggregationKind, Value, ValueStream, DEFAULT_SAMPLE_INTERVAL_MS};
use crate::variable::Variable;

fn reduce(kind: AggregationKind, bucket: &mut Vec<f64>) -> f64 {
    match kind {
        AggregationKind::Sum => bucket.iter().sum(),
        AggregationKind::Average => bucket.iter().sum::<f64>() / bucket.len() as f64,
        AggregationKind::Min => bucket.iter().cloned().fold(f64::INFINITY, f64::min),
        AggregationKind::Max => bucket.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        AggregationKind::Median => {
            // The value at index n/2 of the sorted bucket, not the
            // interpolated median.
            bucket.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            bucket[bucket.len() / 2]
        }
    }
}

/// Walk all streams of a partition in parallel and reduce bucket by bucket.
fn reduce_partition(
    kind: AggregationKind,
    sample_interval: u64,
    streams: &[&ValueStream],
) -> Vec<Value> {
    let mut points: Vec<Vec<(u64, f64)>> = streams
        .iter()
        .map(|s| {
            s.values
                .iter()
                .filter_map(|v| v.as_double().map(|d| (v.timestamp, d)))
                .collect()
        })
        .collect();
    let mut positions = vec![0usize; points.len()];
    let mut output = Vec::new();
    loop {
        let mut anchor: Option<u64> = None;
        for (stream, &pos) in points.iter().zip(positions.iter()) {
            if let Some(&(ts, _)) = stream.get(pos) {
                anchor = Some(anchor.map_or(ts, |a| a.min(ts)));
            }
        }
        let anchor = match anchor {
            Some(a) => a,
            None => break,
        };
        let mut bucket = Vec::new();
        for (stream, pos) in points.iter_mut().zip(positions.iter_mut()) {
            while let Some(&(ts, value)) = stream.get(*pos) {
                if ts - anchor >= sample_interval {
                    break;
                }
                bucket.push(value);
                *pos += 1;
            }
        }
        if !bucket.is_empty() {
            output.push(Value::double(anchor, reduce(kind, &mut bucket)));
        }
    }
    output
}

/// Build the output variable for a partition: the group-by label (if any)
/// pinned to the partition value, plus every other label that has exactly
/// one distinct value across the partition's input streams.
fn partition_variable(
    streams: &[&ValueStream],
    group_label: Option<(&str, &str)>,
) -> Variable {
    let mut variable = Variable::new(streams[0].variable.name());
    if let Some((label, value)) = group_label {
        variable.set_label(label, value);
    }
    let mut distinct: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for stream in streams {
        for (label, value) in stream.variable.labels() {
            distinct.entry(label).or_default().insert(value);
        }
    }
    for (label, values) in distinct {
        if Some(label) == group_label.map(|(l, _)| l) {
            continue;
        }
        if values.len() == 1 {
            if let Some(value) = values.first() {
                variable.set_label(label, value);
            }
        }
    }
    variable
}

/// Apply one aggregation across streams, yielding one stream per partition.
pub fn aggregate(aggregation: &Aggregation, streams: &[ValueStream]) -> Vec<ValueStream> {
    let sample_interval = aggregation
        .sample_interval
        .filter(|&i| i > 0)
        .unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS);
    let mut outputs = Vec::new();
    if streams.is_empty() {
        return outputs;
    }
    if aggregation.labels.is_empty() {
        let all: Vec<&ValueStream> = streams.iter().collect();
        let mut out = ValueStream::new(partition_variable(&all, None));
        out.values = reduce_partition(aggregation.kind, sample_interval, &all);
        outputs.push(out);
        return outputs;
    }
    for label in &aggregation.labels {
        let mut distinct: BTreeSet<&str> = BTreeSet::new();
        for stream in streams {
            if let Some(value) = stream.variable.get_label(label) {
                distinct.insert(value);
            }
        }
        for value in distinct {
            let members: Vec<&ValueStream> = streams
                .iter()
                .filter(|s| s.variable.get_label(label) == Some(value))
                .collect();
            let variable = partition_variable(&members, Some((label.as_str(), value)));
            let mut out = ValueStream::new(variable);
            out.values = reduce_partition(aggregation.kind, sample_interval, &members);
            outputs.push(out);
        }
    }
    outputs
}

/// Apply each requested aggregation over the full mutated stream set.
pub fn apply_aggregations(
    aggregations: &[Aggregation],
    streams: &[ValueStream],
) -> Vec<ValueStream> {
    let mut outputs = Vec::new();
    for aggregation in aggregations {
        outputs.extend(aggregate(aggregation, streams));
    }
    outputs
}
