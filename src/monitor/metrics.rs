// src/monitor/metrics.rs

use super::*;

/// 单个 backend 的计数
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackendCounters {
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub cycles_skipped: u64,
    pub events_published: u64,
}

/// 采集计数，按 backend 分开记，互不干扰
#[derive(Default)]
pub struct Metrics {
    backends: DashMap<String, BackendCounters>,
    /// (backend, 命令名) -> 慢命令次数
    command_stats: DashMap<(String, String), u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    fn update(&self, backend: &str, f: impl FnOnce(&mut BackendCounters)) {
        let mut counters = self.backends.entry(backend.to_string()).or_default();
        f(counters.value_mut());
    }

    pub fn record_cycle_ok(&self, backend: &str) {
        self.update(backend, |c| c.cycles_ok += 1);
    }

    pub fn record_failure(&self, backend: &str) {
        self.update(backend, |c| c.cycles_failed += 1);
    }

    pub fn record_skipped(&self, backend: &str) {
        self.update(backend, |c| c.cycles_skipped += 1);
    }

    pub fn record_event(&self, backend: &str, command: &str) {
        self.update(backend, |c| c.events_published += 1);
        self.command_stats
            .entry((backend.to_string(), command.to_uppercase()))
            .and_modify(|c| *c += 1)
            .or_insert(1);
    }

    pub fn backend(&self, backend: &str) -> BackendCounters {
        self.backends.get(backend).map(|c| *c).unwrap_or_default()
    }

    pub fn command_count(&self, backend: &str, command: &str) -> u64 {
        self.command_stats
            .get(&(backend.to_string(), command.to_uppercase()))
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP slowbeat_cycles_total Collection cycles per backend and result\n");
        output.push_str("# TYPE slowbeat_cycles_total counter\n");
        for entry in self.backends.iter() {
            let c = entry.value();
            for (result, value) in [
                ("ok", c.cycles_ok),
                ("failed", c.cycles_failed),
                ("skipped", c.cycles_skipped),
            ] {
                output.push_str(&format!(
                    "slowbeat_cycles_total{{backend=\"{}\",result=\"{}\"}} {}\n",
                    escape_label(entry.key()),
                    result,
                    value
                ));
            }
        }

        output.push_str("# HELP slowbeat_events_published_total Slow log events handed to the sink\n");
        output.push_str("# TYPE slowbeat_events_published_total counter\n");
        for entry in self.backends.iter() {
            output.push_str(&format!(
                "slowbeat_events_published_total{{backend=\"{}\"}} {}\n",
                escape_label(entry.key()),
                entry.value().events_published
            ));
        }

        output.push_str("# HELP slowbeat_slow_commands_total Slow commands seen per backend and command\n");
        output.push_str("# TYPE slowbeat_slow_commands_total counter\n");
        for entry in self.command_stats.iter() {
            let (backend, command) = entry.key();
            output.push_str(&format!(
                "slowbeat_slow_commands_total{{backend=\"{}\",command=\"{}\"}} {}\n",
                escape_label(backend),
                escape_label(command),
                entry.value()
            ));
        }

        output
    }
}

/// 标签值里的 \ " 和换行需要转义
fn escape_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}
