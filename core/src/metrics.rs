use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct QueryMetrics {
    pub total_queries: u64,
    pub no_permission_count: u64,
    pub latencies: VecDeque<u64>, // microseconds
}

#[derive(Debug, Clone, Default)]
pub struct IngestionMetrics {
    pub chunks_indexed: u64,
    pub chunks_failed: u64,
    pub documents_partially_indexed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiterMetrics {
    pub denied_count: u64,
    pub degraded_mode_count: u64,
}

pub struct MetricsCollector {
    state: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    query_metrics: QueryMetrics,
    ingestion_metrics: IngestionMetrics,
    rate_limiter_metrics: RateLimiterMetrics,
    max_history: usize,
}

impl MetricsCollector {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MetricsState {
                query_metrics: QueryMetrics::default(),
                ingestion_metrics: IngestionMetrics::default(),
                rate_limiter_metrics: RateLimiterMetrics::default(),
                max_history,
            })),
        }
    }

    pub fn record_query(&self, latency_us: u64, no_permission: bool) {
        let mut state = self.state.lock().unwrap();
        state.query_metrics.total_queries += 1;
        if no_permission {
            state.query_metrics.no_permission_count += 1;
        }
        state.query_metrics.latencies.push_back(latency_us);
        if state.query_metrics.latencies.len() > state.max_history {
            state.query_metrics.latencies.pop_front();
        }
    }

    pub fn record_chunk_indexed(&self) {
        self.state.lock().unwrap().ingestion_metrics.chunks_indexed += 1;
    }

    pub fn record_chunk_failed(&self) {
        self.state.lock().unwrap().ingestion_metrics.chunks_failed += 1;
    }

    pub fn record_rate_limit_denied(&self) {
        self.state.lock().unwrap().rate_limiter_metrics.denied_count += 1;
    }

    pub fn record_rate_limiter_degraded(&self) {
        self.state.lock().unwrap().rate_limiter_metrics.degraded_mode_count += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap();
        let q = &state.query_metrics;

        let mut sorted_latencies: Vec<u64> = q.latencies.iter().copied().collect();
        sorted_latencies.sort_unstable();

        let p50 = percentile(&sorted_latencies, 50.0);
        let p95 = percentile(&sorted_latencies, 95.0);
        let p99 = percentile(&sorted_latencies, 99.0);

        MetricsSnapshot {
            total_queries: q.total_queries,
            no_permission_count: q.no_permission_count,
            p50,
            p95,
            p99,
            history_count: q.latencies.len(),
            chunks_indexed: state.ingestion_metrics.chunks_indexed,
            chunks_failed: state.ingestion_metrics.chunks_failed,
            rate_limit_denied: state.rate_limiter_metrics.denied_count,
            rate_limiter_degraded_mode_count: state.rate_limiter_metrics.degraded_mode_count,
        }
    }
}

fn percentile(sorted: &[u64], p: f32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((p / 100.0) * (sorted.len() as f32)).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub no_permission_count: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub history_count: usize,
    pub chunks_indexed: u64,
    pub chunks_failed: u64,
    pub rate_limit_denied: u64,
    pub rate_limiter_degraded_mode_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_query_latency_percentiles() {
        let collector = MetricsCollector::new(100);
        for latency in [10, 20, 30, 40, 50] {
            collector.record_query(latency, false);
        }
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_queries, 5);
        assert_eq!(snapshot.p50, 30);
    }

    #[test]
    fn caps_latency_history() {
        let collector = MetricsCollector::new(2);
        collector.record_query(1, false);
        collector.record_query(2, false);
        collector.record_query(3, false);
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.history_count, 2);
    }
}
