use crate::{
    runner::BenchResult,
    stats::{self, parse_metrics, parse_stats},
};
use colored::*;
use itertools::Itertools;
use term_table::{row::Row, table_cell::*, Table, TableStyle};

const MB: f64 = 1024.0 * 1024.0;

/// Prints every table for a completed sweep to stdout.
pub fn print_report(results: &[BenchResult], overhead: bool) {
    println!("\n{}", " SUMMARY TIMINGS/THREAD RATES ".reversed().green());
    println!("{}", summary_table(results));

    println!("\n{}", " DETAILED COMMAND TIMINGS/STATISTICS ".reversed().green());
    for result in results.iter().filter(|res| !res.is_limit) {
        for (idx, run_stats) in result.statistics.iter().enumerate() {
            println!("{}", detail_table(result, idx + 1, run_stats));
        }
    }

    if overhead {
        println!("\n{}", " OVERHEAD ".reversed().green());
        println!("{}", overhead_table(results));
    }
}

fn header(title: impl ToString) -> TableCell {
    TableCell::builder(title.to_string().bold()).build()
}

/// One row per benchmark, one column per thread count, holding iterations per second.
pub fn summary_table(results: &[BenchResult]) -> String {
    let max_threads = results.iter().map(|res| res.threads).max().unwrap_or(1);

    let mut heading = vec![TableCell::new(""), header("Iter/Thd"), header("1 thrd")];
    heading.extend((2..=max_threads).map(|n| header(format!("{n} thrds"))));

    let mut rows = vec![Row::new(heading)];
    for result in results {
        let mut cells = vec![
            TableCell::new(&result.name),
            TableCell::new(result.iterations),
        ];
        cells.extend(
            (0..max_threads).map(|idx| match result.thread_rates.get(idx) {
                Some(rate) => TableCell::new(format!("{rate:7.2}")),
                None => TableCell::new("--"),
            }),
        );
        rows.push(Row::new(cells));
    }

    Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build()
        .render()
}

/// Latency distribution of each command for one thread count of one benchmark. Commands appear
/// in the order the benchmark lists them.
pub fn detail_table(
    result: &BenchResult,
    threads: usize,
    run_stats: &[crate::bench::RunStatistic],
) -> String {
    let timings = parse_stats(run_stats);

    let mut rows = vec![Row::new(vec![
        TableCell::new(format!("{}:{threads}", result.name).green()),
        header("Min"),
        header("Max"),
        header("Avg"),
        header("Median"),
        header("Stddev"),
        header("Errors"),
    ])];
    for cmd in result.commands.iter().unique() {
        let Some(stats) = timings.get(cmd) else {
            continue;
        };
        let errors = match stats.errors {
            0 => TableCell::new(0),
            n => TableCell::new(n.to_string().red()),
        };
        rows.push(Row::new(vec![
            TableCell::new(cmd),
            TableCell::new(format!("{:6.2}", stats.min as f64)),
            TableCell::new(format!("{:6.2}", stats.max as f64)),
            TableCell::new(format!("{:6.2}", stats.avg)),
            TableCell::new(format!("{:6.2}", stats.median)),
            TableCell::new(format!("{:6.2}", stats.stddev)),
            errors,
        ]));
    }

    Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build()
        .render()
}

/// Daemon resource usage per benchmark and thread count. Every benchmark after the first is
/// compared against the first at the same thread count.
pub fn overhead_table(results: &[BenchResult]) -> String {
    let results = results.iter().filter(|res| !res.is_limit).collect_vec();
    if results.is_empty() {
        return "No data".to_string();
    }

    let metrics = results
        .iter()
        .map(|res| res.statistics.iter().map(|s| parse_metrics(s)).collect_vec())
        .collect_vec();

    let mut rows = vec![Row::new(vec![
        header("Bench / driver / threads"),
        header("Min mem"),
        header("Max mem"),
        header("Avg mem"),
        header("Min CPU"),
        header("Max CPU"),
        header("Avg CPU"),
        header("Mem %"),
        header("CPU x"),
    ])];
    for (i, res) in results.iter().enumerate() {
        for (j, m) in metrics[i].iter().enumerate() {
            let (mem_delta, cpu_delta) = match metrics[0].get(j) {
                Some(baseline) if i > 0 => {
                    let (mem, cpu) = stats::overhead(baseline, m);
                    (format!("{mem:+.2}%"), format!("{cpu:+.2}x"))
                }
                _ => (String::new(), String::new()),
            };
            rows.push(Row::new(vec![
                TableCell::new(format!("{}:{}", res.name, j + 1)),
                TableCell::new(format!("{} MB", (m.min_mem as f64 / MB) as u64)),
                TableCell::new(format!("{} MB", (m.max_mem as f64 / MB) as u64)),
                TableCell::new(format!("{} MB", (m.avg_mem / MB) as u64)),
                TableCell::new(format!("{:.2} %", m.min_cpu)),
                TableCell::new(format!("{:.2} %", m.max_cpu)),
                TableCell::new(format!("{:.2} %", m.avg_cpu)),
                TableCell::new(mem_delta),
                TableCell::new(cpu_delta),
            ]));
        }
    }

    Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build()
        .render()
}
