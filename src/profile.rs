//! Phase timings for `commit --profile`.

use std::time::{Duration, Instant};

const RULE_WIDTH: usize = 40;

/// Named phase timings, reported slowest first.
#[derive(Debug, Default)]
pub struct Profiler {
    phases: Vec<(&'static str, Vec<Duration>)>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time `f` under `name` and record the duration.
    pub fn time<F, T>(&mut self, name: &'static str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let start = Instant::now();
        let result = f();
        self.record(name, start.elapsed());
        result
    }

    pub fn record(&mut self, name: &'static str, elapsed: Duration) {
        match self.phases.iter_mut().find(|(phase, _)| *phase == name) {
            Some((_, samples)) => samples.push(elapsed),
            None => self.phases.push((name, vec![elapsed])),
        }
    }

    pub fn total(&self) -> Duration {
        self.phases
            .iter()
            .flat_map(|(_, samples)| samples.iter())
            .sum()
    }

    /// Per-phase average and share of the total, slowest phase first.
    pub fn report(&self) -> String {
        let total = self.total().as_secs_f64();
        let mut phases: Vec<_> = self
            .phases
            .iter()
            .map(|(name, samples)| {
                let sum: Duration = samples.iter().sum();
                (*name, sum.as_secs_f64(), samples.len())
            })
            .collect();
        phases.sort_by(|a, b| b.1.total_cmp(&a.1));

        let rule = "-".repeat(RULE_WIDTH);
        let mut lines = vec!["Performance Report:".to_string(), rule.clone()];
        for (name, sum, count) in phases {
            let avg = sum / count as f64;
            let pct = if total > 0.0 { sum / total * 100.0 } else { 0.0 };
            lines.push(format!("{name:25} {avg:6.2}s ({pct:5.1}%)"));
        }
        lines.push(rule);
        lines.push(format!("{:25} {total:6.2}s", "Total"));
        lines.join("\n")
    }
}
