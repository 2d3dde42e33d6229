use crate::{bench::RunStatistic, sampler::ProcMetrics};
use itertools::{Itertools, MinMaxResult};
use std::collections::{BTreeMap, BTreeSet};
use tracing::error;

/// Latency distribution of one command, in whole milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommandStats {
    pub min: u64,
    pub max: u64,
    pub avg: f64,
    pub median: f64,
    pub stddev: f64,
    pub errors: u32,
}

/// Resource usage of a daemon over one run. Memory in bytes, CPU in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSummary {
    pub min_mem: u64,
    pub max_mem: u64,
    pub avg_mem: f64,
    pub min_cpu: f64,
    pub max_cpu: f64,
    pub avg_cpu: f64,
}

pub fn filter_iterations(stats: &[RunStatistic]) -> Vec<&RunStatistic> {
    stats.iter().filter(|stat| !stat.is_sample()).collect()
}

pub fn filter_samples(stats: &[RunStatistic]) -> Vec<ProcMetrics> {
    stats
        .iter()
        .filter_map(|stat| match stat {
            RunStatistic::Sample { metrics, .. } => Some(*metrics),
            RunStatistic::Iteration { .. } => None,
        })
        .collect()
}

/// Builds the per-command latency distributions of a run. Resource samples are ignored.
///
/// Every command that appears in any iteration gets an entry. An iteration only contributes to
/// the commands it actually timed, so a command that always failed still has an entry with its
/// error count and zero timings.
pub fn parse_stats(stats: &[RunStatistic]) -> BTreeMap<String, CommandStats> {
    let iterations = filter_iterations(stats);
    if iterations.is_empty() {
        error!("No iteration statistics to aggregate");
        return BTreeMap::new();
    }

    let keys = iterations
        .iter()
        .flat_map(|stat| match stat {
            RunStatistic::Iteration { durations, errors } => {
                durations.keys().chain(errors.keys()).cloned().collect_vec()
            }
            RunStatistic::Sample { .. } => vec![],
        })
        .collect::<BTreeSet<_>>();

    keys.into_iter()
        .map(|key| {
            let mut millis = vec![];
            let mut errors = 0;
            for stat in &iterations {
                if let RunStatistic::Iteration {
                    durations,
                    errors: errs,
                } = stat
                {
                    if let Some(duration) = durations.get(&key) {
                        millis.push(duration.as_millis() as u64);
                    }
                    errors += errs.get(&key).copied().unwrap_or(0);
                }
            }

            let (min, max) = min_max(&millis);
            let stats = CommandStats {
                min,
                max,
                avg: mean(&millis),
                median: median(&millis),
                stddev: std_dev(&millis),
                errors,
            };
            (key, stats)
        })
        .collect()
}

/// Summarises the resource samples of a run. Iteration records are ignored.
pub fn parse_metrics(stats: &[RunStatistic]) -> MetricsSummary {
    let samples = filter_samples(stats);
    if samples.is_empty() {
        error!("No resource samples to aggregate");
        return MetricsSummary::default();
    }

    let mem = samples.iter().map(|s| s.mem).collect_vec();
    let cpu = samples.iter().map(|s| s.cpu).collect_vec();
    let (min_mem, max_mem) = min_max(&mem);
    let (min_cpu, max_cpu) = match cpu.iter().copied().minmax_by(f64::total_cmp) {
        MinMaxResult::NoElements => (0.0, 0.0),
        MinMaxResult::OneElement(v) => (v, v),
        MinMaxResult::MinMax(min, max) => (min, max),
    };

    MetricsSummary {
        min_mem,
        max_mem,
        avg_mem: mean(&mem),
        min_cpu,
        max_cpu,
        avg_cpu: cpu.iter().sum::<f64>() / cpu.len() as f64,
    }
}

/// Ratio of `after` to `before`. Two zeros are no change, a zero baseline against a non-zero
/// value is an unbounded increase.
pub fn get_delta(before: f64, after: f64) -> f64 {
    if before != 0.0 {
        after / before
    } else if after == 0.0 {
        1.0
    } else {
        f64::INFINITY
    }
}

/// Compares a run against a baseline run.
///
/// # Returns
///
/// The percentage change in average memory and the multiplier on average CPU.
pub fn overhead(baseline: &MetricsSummary, comparison: &MetricsSummary) -> (f64, f64) {
    let mem_percent = 100.0 * get_delta(baseline.avg_mem, comparison.avg_mem) - 100.0;
    let cpu_multiplier = get_delta(baseline.avg_cpu, comparison.avg_cpu);
    (mem_percent, cpu_multiplier)
}

fn min_max(values: &[u64]) -> (u64, u64) {
    match values.iter().minmax() {
        MinMaxResult::NoElements => {
            error!("min/max of an empty set");
            (0, 0)
        }
        MinMaxResult::OneElement(v) => (*v, *v),
        MinMaxResult::MinMax(min, max) => (*min, *max),
    }
}

fn mean(values: &[u64]) -> f64 {
    if values.is_empty() {
        error!("mean of an empty set");
        return 0.0;
    }
    values.iter().sum::<u64>() as f64 / values.len() as f64
}

fn median(values: &[u64]) -> f64 {
    if values.is_empty() {
        error!("median of an empty set");
        return 0.0;
    }
    let sorted = values.iter().copied().sorted().collect_vec();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    }
}

/// Population standard deviation.
fn std_dev(values: &[u64]) -> f64 {
    if values.is_empty() {
        error!("standard deviation of an empty set");
        return 0.0;
    }
    let avg = mean(values);
    let variance = values
        .iter()
        .map(|v| (*v as f64 - avg).powi(2))
        .sum::<f64>()
        / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::{collections::HashMap, time::Duration};

    fn iteration(durations: &[(&str, u64)], errors: &[(&str, u32)]) -> RunStatistic {
        RunStatistic::Iteration {
            durations: durations
                .iter()
                .map(|(k, ms)| (k.to_string(), Duration::from_millis(*ms)))
                .collect::<HashMap<_, _>>(),
            errors: errors
                .iter()
                .map(|(k, n)| (k.to_string(), *n))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn sample(secs: i64, mem: u64, cpu: f64) -> RunStatistic {
        RunStatistic::Sample {
            timestamp: Utc.timestamp_opt(secs, 0).single().unwrap_or_default(),
            metrics: ProcMetrics { mem, cpu },
        }
    }

    #[test]
    fn run_distribution_matches_known_values() {
        let stats = vec![
            iteration(&[("run", 10)], &[]),
            iteration(&[("run", 20)], &[]),
            iteration(&[("run", 30)], &[]),
        ];
        let parsed = parse_stats(&stats);
        let run = parsed["run"];

        assert_eq!(run.min, 10);
        assert_eq!(run.max, 30);
        assert_eq!(run.avg, 20.0);
        assert_eq!(run.median, 20.0);
        assert!((run.stddev - 8.1649).abs() < 0.001);
        assert_eq!(run.errors, 0);
    }

    #[test]
    fn sub_millisecond_durations_are_truncated() {
        let stats = vec![RunStatistic::Iteration {
            durations: HashMap::from([("run".to_string(), Duration::from_micros(2_900))]),
            errors: HashMap::new(),
        }];
        assert_eq!(parse_stats(&stats)["run"].max, 2);
    }

    #[test]
    fn keys_missing_from_the_first_iteration_are_kept() {
        let stats = vec![
            iteration(&[], &[("run", 1), ("stop", 1)]),
            iteration(&[("run", 5), ("stop", 7)], &[]),
            iteration(&[("run", 15), ("stop", 9)], &[]),
        ];
        let parsed = parse_stats(&stats);

        // no zero padding from the failed iteration
        assert_eq!(parsed["run"].min, 5);
        assert_eq!(parsed["run"].avg, 10.0);
        assert_eq!(parsed["run"].errors, 1);
        assert_eq!(parsed["stop"].median, 8.0);
    }

    #[test]
    fn always_failing_command_is_reported() {
        let stats = vec![
            iteration(&[("run", 5), ("stop", 40)], &[("stop", 1)]),
            iteration(&[("run", 5), ("stop", 60)], &[("stop", 1)]),
        ];
        let parsed = parse_stats(&stats);
        let stop = parsed["stop"];

        // time spent failing is still latency
        assert_eq!(stop.errors, 2);
        assert_eq!(stop.min, 40);
        assert_eq!(stop.max, 60);
        assert_eq!(stop.avg, 50.0);
        assert_eq!(parsed["run"].errors, 0);
    }

    #[test]
    fn empty_input_yields_zeros() {
        assert!(parse_stats(&[]).is_empty());
        assert_eq!(parse_metrics(&[]), MetricsSummary::default());
    }

    #[test]
    fn delta_edge_cases() {
        assert_eq!(get_delta(0.0, 0.0), 1.0);
        assert_eq!(get_delta(0.0, 5.0), f64::INFINITY);
        assert_eq!(get_delta(10.0, 20.0), 2.0);

        let baseline = MetricsSummary {
            avg_mem: 10.0,
            avg_cpu: 10.0,
            ..Default::default()
        };
        let comparison = MetricsSummary {
            avg_mem: 20.0,
            avg_cpu: 20.0,
            ..Default::default()
        };
        assert_eq!(overhead(&baseline, &comparison), (100.0, 2.0));
    }

    #[test]
    fn samples_and_iterations_never_mix() {
        let iterations = vec![
            iteration(&[("run", 10), ("stop", 3)], &[]),
            iteration(&[("run", 30), ("stop", 1)], &[("remove", 1)]),
        ];
        let samples = vec![
            sample(1, 100, 1.0),
            sample(2, 300, 3.0),
            sample(3, 200, 5.0),
        ];
        let mixed = iterations
            .iter()
            .cloned()
            .interleave(samples.iter().cloned())
            .collect_vec();

        assert_eq!(parse_stats(&mixed), parse_stats(&iterations));
        assert_eq!(parse_metrics(&mixed), parse_metrics(&samples));

        let metrics = parse_metrics(&mixed);
        assert_eq!((metrics.min_mem, metrics.max_mem), (100, 300));
        assert_eq!(metrics.avg_mem, 200.0);
        assert_eq!((metrics.min_cpu, metrics.max_cpu), (1.0, 5.0));
        assert_eq!(metrics.avg_cpu, 3.0);
    }
}
