//! Per-client request metrics.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// EMA weight for the average response time.
const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Default)]
struct Inner {
    requests: u64,
    successes: u64,
    errors: u64,
    min_response_ms: Option<u64>,
    avg_response_ms: f64,
    max_response_ms: u64,
    circuit_opens: u64,
    last_request_at: Option<DateTime<Utc>>,
}

/// Point-in-time metrics snapshot exposed by every provider client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientMetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub min_response_ms: Option<u64>,
    pub avg_response_ms: f64,
    pub max_response_ms: u64,
    pub circuit_opens: u64,
    pub last_request_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct ClientMetrics {
    inner: RwLock<Inner>,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, elapsed: Duration, success: bool) {
        let ms = elapsed.as_millis() as u64;
        let mut inner = self.inner.write().unwrap();
        inner.requests += 1;
        if success {
            inner.successes += 1;
        } else {
            inner.errors += 1;
        }
        inner.min_response_ms = Some(inner.min_response_ms.map_or(ms, |m| m.min(ms)));
        inner.max_response_ms = inner.max_response_ms.max(ms);
        inner.avg_response_ms = if inner.requests == 1 {
            ms as f64
        } else {
            EMA_ALPHA * ms as f64 + (1.0 - EMA_ALPHA) * inner.avg_response_ms
        };
        inner.last_request_at = Some(Utc::now());
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.record(elapsed, true);
    }

    pub fn record_error(&self, elapsed: Duration) {
        self.record(elapsed, false);
    }

    pub fn record_circuit_open(&self) {
        self.inner.write().unwrap().circuit_opens += 1;
    }

    pub fn average_response_ms(&self) -> f64 {
        self.inner.read().unwrap().avg_response_ms
    }

    pub fn snapshot(&self) -> ClientMetricsSnapshot {
        let inner = self.inner.read().unwrap();
        ClientMetricsSnapshot {
            requests: inner.requests,
            successes: inner.successes,
            errors: inner.errors,
            min_response_ms: inner.min_response_ms,
            avg_response_ms: inner.avg_response_ms,
            max_response_ms: inner.max_response_ms,
            circuit_opens: inner.circuit_opens,
            last_request_at: inner.last_request_at,
        }
    }
}
