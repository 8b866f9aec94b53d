//! Assignment planning: given the partitions the coordinator just granted
//! and the table of partitions currently held, decide where every partition
//! resumes and which stream hosts are orphaned.
//!
//! Kept free of broker and processor types so the rebalance arithmetic can
//! be exercised directly; the consumer context supplies the timestamp and
//! offset-lookup callbacks and applies the resulting plan.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rdkafka::Offset;

use crate::kafka::types::StreamPartitionOffset;

#[derive(Debug, Default)]
pub struct AssignmentPlan {
    /// Where each assigned partition resumes, in the order handed to the
    /// broker's assign call.
    pub offsets: Vec<StreamPartitionOffset>,
    /// Streams held before this rebalance but absent from it; their hosts
    /// must be sealed and joined.
    pub removed: Vec<String>,
}

/// Compute the assignment plan for one rebalance.
///
/// `current` maps each held stream to its partition set (streams granted for
/// the first time may be absent or empty). `start_timestamp` is asked once
/// per stream per rebalance, and only when that stream gained partitions.
/// `resolve_offsets` translates a wall time into per-partition offsets; a
/// partition resolved to `None` (lookup failure) falls back to the stored
/// commit, as do partitions that were already held.
pub fn plan_assignment<FTs, FResolve>(
    current: &HashMap<String, BTreeSet<i32>>,
    incoming: &BTreeMap<String, BTreeSet<i32>>,
    mut start_timestamp: FTs,
    mut resolve_offsets: FResolve,
) -> AssignmentPlan
where
    FTs: FnMut(&str) -> Option<DateTime<Utc>>,
    FResolve: FnMut(&str, &BTreeSet<i32>, DateTime<Utc>) -> HashMap<i32, Option<i64>>,
{
    let mut plan = AssignmentPlan::default();
    static EMPTY: BTreeSet<i32> = BTreeSet::new();

    for (stream, partitions_to_assign) in incoming {
        let held = current.get(stream).unwrap_or(&EMPTY);
        let new_partitions: BTreeSet<i32> =
            partitions_to_assign.difference(held).copied().collect();

        if !new_partitions.is_empty() {
            match start_timestamp(stream) {
                Some(timestamp) => {
                    let resolved = resolve_offsets(stream, &new_partitions, timestamp);
                    for partition in &new_partitions {
                        let offset = match resolved.get(partition) {
                            Some(Some(offset)) => Offset::Offset(*offset),
                            // Lookup failed for this partition only
                            _ => Offset::Invalid,
                        };
                        plan.offsets
                            .push(StreamPartitionOffset::new(stream.clone(), *partition, offset));
                    }
                }
                None => {
                    for partition in &new_partitions {
                        plan.offsets.push(StreamPartitionOffset::resume_from_committed(
                            stream.clone(),
                            *partition,
                        ));
                    }
                }
            }
        }

        // Partitions already held re-emit with no position change; the
        // broker keeps fetching from wherever they are.
        for partition in partitions_to_assign.intersection(held) {
            plan.offsets.push(StreamPartitionOffset::resume_from_committed(
                stream.clone(),
                *partition,
            ));
        }
    }

    plan.removed = current
        .keys()
        .filter(|stream| !incoming.contains_key(*stream))
        .cloned()
        .collect();
    plan.removed.sort_unstable();

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::Cell;

    fn set(partitions: &[i32]) -> BTreeSet<i32> {
        partitions.iter().copied().collect()
    }

    fn incoming(groups: &[(&str, &[i32])]) -> BTreeMap<String, BTreeSet<i32>> {
        groups
            .iter()
            .map(|(stream, partitions)| (stream.to_string(), set(partitions)))
            .collect()
    }

    fn no_timestamp(_: &str) -> Option<DateTime<Utc>> {
        None
    }

    fn no_resolution(
        _: &str,
        _: &BTreeSet<i32>,
        _: DateTime<Utc>,
    ) -> HashMap<i32, Option<i64>> {
        panic!("offset resolution should not run without a start timestamp")
    }

    #[test]
    fn test_cold_start_resumes_from_committed() {
        let current = HashMap::new();
        let incoming = incoming(&[("traces-T", &[0, 1])]);

        let plan = plan_assignment(&current, &incoming, no_timestamp, no_resolution);

        assert_eq!(
            plan.offsets,
            vec![
                StreamPartitionOffset::new("traces-T", 0, Offset::Invalid),
                StreamPartitionOffset::new("traces-T", 1, Offset::Invalid),
            ]
        );
        assert!(plan.removed.is_empty());
    }

    #[test]
    fn test_timestamp_seek_with_partial_failure() {
        let current = HashMap::new();
        let incoming = incoming(&[("traces-T", &[0, 1])]);
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let plan = plan_assignment(
            &current,
            &incoming,
            |_| Some(since),
            |stream, partitions, timestamp| {
                assert_eq!(stream, "traces-T");
                assert_eq!(partitions, &set(&[0, 1]));
                assert_eq!(timestamp, since);
                // Partition 0 resolves, partition 1 errors
                HashMap::from([(0, Some(500)), (1, None)])
            },
        );

        assert_eq!(
            plan.offsets,
            vec![
                StreamPartitionOffset::new("traces-T", 0, Offset::Offset(500)),
                StreamPartitionOffset::new("traces-T", 1, Offset::Invalid),
            ]
        );
    }

    #[test]
    fn test_partition_expansion_seeks_only_new() {
        let current = HashMap::from([("traces-T".to_string(), set(&[0, 1]))]);
        let incoming = incoming(&[("traces-T", &[0, 1, 2])]);
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let plan = plan_assignment(
            &current,
            &incoming,
            |_| Some(since),
            |_, partitions, _| {
                // Only the expansion partition goes through the lookup
                assert_eq!(partitions, &set(&[2]));
                HashMap::from([(2, Some(77))])
            },
        );

        assert_eq!(
            plan.offsets,
            vec![
                StreamPartitionOffset::new("traces-T", 2, Offset::Offset(77)),
                StreamPartitionOffset::new("traces-T", 0, Offset::Invalid),
                StreamPartitionOffset::new("traces-T", 1, Offset::Invalid),
            ]
        );
    }

    #[test]
    fn test_identical_reassignment_skips_timestamp_path() {
        let current = HashMap::from([("traces-T".to_string(), set(&[0, 1]))]);
        let incoming = incoming(&[("traces-T", &[0, 1])]);

        let asked = Cell::new(false);
        let plan = plan_assignment(
            &current,
            &incoming,
            |_| {
                asked.set(true);
                None
            },
            no_resolution,
        );

        // No new partitions, so the processor is not asked for a timestamp
        assert!(!asked.get());
        assert_eq!(
            plan.offsets,
            vec![
                StreamPartitionOffset::new("traces-T", 0, Offset::Invalid),
                StreamPartitionOffset::new("traces-T", 1, Offset::Invalid),
            ]
        );
        assert!(plan.removed.is_empty());
    }

    #[test]
    fn test_stream_removed_is_orphaned() {
        let current = HashMap::from([
            ("traces-T".to_string(), set(&[0])),
            ("metrics-T".to_string(), set(&[0])),
        ]);
        let incoming = incoming(&[("traces-T", &[0])]);

        let plan = plan_assignment(&current, &incoming, no_timestamp, no_resolution);

        assert_eq!(plan.removed, vec!["metrics-T".to_string()]);
        assert_eq!(
            plan.offsets,
            vec![StreamPartitionOffset::new("traces-T", 0, Offset::Invalid)]
        );
    }

    #[test]
    fn test_zero_partition_group_keeps_entry() {
        let current = HashMap::from([("traces-T".to_string(), set(&[0, 1]))]);
        let incoming = incoming(&[("traces-T", &[])]);

        let plan = plan_assignment(&current, &incoming, no_timestamp, no_resolution);

        // The stream is still present in the assignment, so it is not
        // orphaned; it just emits no partitions.
        assert!(plan.removed.is_empty());
        assert!(plan.offsets.is_empty());
    }

    #[test]
    fn test_timestamp_asked_once_per_stream() {
        let current = HashMap::new();
        let incoming = incoming(&[("metrics-T", &[0]), ("traces-T", &[0, 1, 2])]);
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let mut asked: Vec<String> = Vec::new();
        let plan = plan_assignment(
            &current,
            &incoming,
            |stream| {
                asked.push(stream.to_string());
                Some(since)
            },
            |_, partitions, _| partitions.iter().map(|p| (*p, Some(i64::from(*p)))).collect(),
        );

        assert_eq!(asked, vec!["metrics-T".to_string(), "traces-T".to_string()]);
        assert_eq!(plan.offsets.len(), 4);
    }
}
