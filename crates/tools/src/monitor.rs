//! Per-tool latency and error telemetry.
//!
//! Each call records start/end/success; the monitor keeps a rolling window of
//! the last N latencies per tool plus lifetime counters, and exposes a
//! dashboard snapshot through the diagnostics tools.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolMetrics {
    pub calls: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub rolling_mean_ms: f64,
    pub max_ms: u64,
    pub error_rate_pct: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub total_calls: u64,
    pub total_errors: u64,
    pub error_rate_pct: f32,
    pub rolling_mean_ms: f64,
    pub slow_calls: u64,
    pub per_tool: BTreeMap<String, ToolMetrics>,
}

struct ToolWindow {
    latencies: VecDeque<u64>,
    calls: u64,
    errors: u64,
    cache_hits: u64,
    max_ms: u64,
}

pub struct PerfMonitor {
    window: usize,
    slow_call_ms: u64,
    slow_calls: u64,
    tools: BTreeMap<String, ToolWindow>,
}

impl PerfMonitor {
    pub fn new(window: usize, slow_call_ms: u64) -> Self {
        Self {
            window: window.max(1),
            slow_call_ms,
            slow_calls: 0,
            tools: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, tool: &str, duration_ms: u64, success: bool, cache_hit: bool) {
        let entry = self.tools.entry(tool.to_string()).or_insert_with(|| ToolWindow {
            latencies: VecDeque::new(),
            calls: 0,
            errors: 0,
            cache_hits: 0,
            max_ms: 0,
        });

        entry.calls += 1;
        if !success {
            entry.errors += 1;
        }
        if cache_hit {
            entry.cache_hits += 1;
        }
        entry.max_ms = entry.max_ms.max(duration_ms);
        entry.latencies.push_back(duration_ms);
        while entry.latencies.len() > self.window {
            entry.latencies.pop_front();
        }

        if duration_ms >= self.slow_call_ms {
            self.slow_calls += 1;
            tracing::warn!(tool, duration_ms, "slow tool call");
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let mut per_tool = BTreeMap::new();
        let mut total_calls = 0u64;
        let mut total_errors = 0u64;
        let mut all_latencies: Vec<u64> = Vec::new();

        for (name, window) in &self.tools {
            total_calls += window.calls;
            total_errors += window.errors;
            all_latencies.extend(window.latencies.iter().copied());

            let mean = if window.latencies.is_empty() {
                0.0
            } else {
                window.latencies.iter().sum::<u64>() as f64 / window.latencies.len() as f64
            };
            per_tool.insert(
                name.clone(),
                ToolMetrics {
                    calls: window.calls,
                    errors: window.errors,
                    cache_hits: window.cache_hits,
                    rolling_mean_ms: mean,
                    max_ms: window.max_ms,
                    error_rate_pct: if window.calls == 0 {
                        0.0
                    } else {
                        (window.errors as f32 / window.calls as f32) * 100.0
                    },
                },
            );
        }

        MonitorSnapshot {
            total_calls,
            total_errors,
            error_rate_pct: if total_calls == 0 {
                0.0
            } else {
                (total_errors as f32 / total_calls as f32) * 100.0
            },
            rolling_mean_ms: if all_latencies.is_empty() {
                0.0
            } else {
                all_latencies.iter().sum::<u64>() as f64 / all_latencies.len() as f64
            },
            slow_calls: self.slow_calls,
            per_tool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_rolling_mean_per_tool() {
        let mut monitor = PerfMonitor::new(3, 1_000);
        monitor.record("search", 10, true, false);
        monitor.record("search", 20, true, false);
        monitor.record("search", 30, true, true);
        // The window holds only the last 3; a fourth pushes the first out.
        monitor.record("search", 60, true, false);

        let snap = monitor.snapshot();
        let search = &snap.per_tool["search"];
        assert_eq!(search.calls, 4);
        assert_eq!(search.cache_hits, 1);
        assert!((search.rolling_mean_ms - (20.0 + 30.0 + 60.0) / 3.0).abs() < 1e-9);
        assert_eq!(search.max_ms, 60);
    }

    #[test]
    fn error_rate_accumulates() {
        let mut monitor = PerfMonitor::new(10, 1_000);
        monitor.record("sync", 5, true, false);
        monitor.record("sync", 5, false, false);

        let snap = monitor.snapshot();
        assert_eq!(snap.total_errors, 1);
        assert!((snap.per_tool["sync"].error_rate_pct - 50.0).abs() < 1e-3);
    }

    #[test]
    fn slow_calls_are_counted() {
        let mut monitor = PerfMonitor::new(10, 50);
        monitor.record("sync", 100, true, false);
        monitor.record("sync", 10, true, false);
        assert_eq!(monitor.snapshot().slow_calls, 1);
    }
}
