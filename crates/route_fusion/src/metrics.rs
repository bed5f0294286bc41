//! In-process counters for route execution and cache behavior.
//!
//! Counters are lock-free on the hot path; the two keyed breakdowns take a
//! short mutex only when a miss or failure is recorded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::ErrorKind;

/// Aggregated executor counters.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    /// Top-level requests received.
    requests: AtomicU64,
    /// Route runs answered from the cache (dependencies included).
    cache_hits: AtomicU64,
    /// Route runs that consulted the cache and missed.
    cache_misses: AtomicU64,
    /// Route runs with caching disabled.
    cache_bypasses: AtomicU64,
    /// Page sets committed to the store.
    materializations: AtomicU64,
    /// Materializations discarded because another writer held the entry.
    lost_races: AtomicU64,
    /// Rows returned to top-level callers.
    rows_returned: AtomicU64,
    /// Query sessions opened.
    engine_sessions: AtomicU64,
    /// Queries executed.
    engine_executions: AtomicU64,
    /// Requests cut off by the request timeout.
    timeouts: AtomicU64,
    /// Misses keyed by reason.
    misses_by_reason: Mutex<BTreeMap<&'static str, u64>>,
    /// Failed top-level requests keyed by error kind.
    errors_by_kind: Mutex<BTreeMap<&'static str, u64>>,
}

/// Immutable snapshot of [`ExecutorMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorMetricsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_bypasses: u64,
    pub materializations: u64,
    pub lost_races: u64,
    pub rows_returned: u64,
    pub engine_sessions: u64,
    pub engine_executions: u64,
    pub timeouts: u64,
    pub misses_by_reason: BTreeMap<&'static str, u64>,
    pub errors_by_kind: BTreeMap<&'static str, u64>,
}

impl ExecutorMetrics {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, reason: &'static str) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let mut by_reason = self
            .misses_by_reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *by_reason.entry(reason).or_default() += 1;
    }

    pub fn record_bypass(&self) {
        self.cache_bypasses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_materialization(&self, committed: bool) {
        if committed {
            self.materializations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.lost_races.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rows_returned(&self, rows: usize) {
        self.rows_returned.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_engine_session(&self) {
        self.engine_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_engine_execution(&self) {
        self.engine_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: ErrorKind) {
        let mut by_kind = self
            .errors_by_kind
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *by_kind.entry(kind.as_str()).or_default() += 1;
    }

    /// Captures a point-in-time copy of all counters.
    pub fn snapshot(&self) -> ExecutorMetricsSnapshot {
        ExecutorMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_bypasses: self.cache_bypasses.load(Ordering::Relaxed),
            materializations: self.materializations.load(Ordering::Relaxed),
            lost_races: self.lost_races.load(Ordering::Relaxed),
            rows_returned: self.rows_returned.load(Ordering::Relaxed),
            engine_sessions: self.engine_sessions.load(Ordering::Relaxed),
            engine_executions: self.engine_executions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            misses_by_reason: self
                .misses_by_reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            errors_by_kind: self
                .errors_by_kind
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }

    /// Renders metrics in a plain-text format suitable for `/metrics`.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            "route_requests={}\nroute_cache_hits={}\nroute_cache_misses={}\nroute_cache_bypasses={}\nroute_cache_materializations={}\nroute_cache_lost_races={}\nroute_rows_returned={}\nroute_engine_sessions={}\nroute_engine_executions={}\nroute_timeouts={}\n",
            s.requests,
            s.cache_hits,
            s.cache_misses,
            s.cache_bypasses,
            s.materializations,
            s.lost_races,
            s.rows_returned,
            s.engine_sessions,
            s.engine_executions,
            s.timeouts,
        );
        for (reason, count) in &s.misses_by_reason {
            out.push_str(&format!("route_cache_misses_{reason}={count}\n"));
        }
        for (kind, count) in &s.errors_by_kind {
            out.push_str(&format!("route_errors_{kind}={count}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_breakdowns() {
        let metrics = ExecutorMetrics::default();
        metrics.record_request();
        metrics.record_miss("uncovered");
        metrics.record_miss("uncovered");
        metrics.record_materialization(false);
        metrics.record_error(ErrorKind::Recursion);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cache_misses, 2);
        assert_eq!(snapshot.lost_races, 1);
        let text = metrics.render_text();
        assert!(text.contains("route_requests=1\n"));
        assert!(text.contains("route_cache_misses_uncovered=2\n"));
        assert!(text.contains("route_errors_recursion=1\n"));
    }
}
