//! Per-endpoint request telemetry: counts, error totals, latency bounds.

use std::collections::BTreeMap;

use {dashmap::DashMap, serde::Serialize, tracing::trace};

/// One finished request, as reported by route code or the logging middleware.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub endpoint: String,
    pub status: u16,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl RequestRecord {
    pub fn new(endpoint: impl Into<String>, status: u16, duration_ms: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            status,
            duration_ms,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone)]
struct Accumulated {
    count: u64,
    errors: u64,
    total_duration_ms: u64,
    min_duration_ms: u64,
    max_duration_ms: u64,
    last_error: Option<String>,
}

/// Derived view of one endpoint's accumulated numbers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStats {
    pub count: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub total_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&Accumulated> for EndpointStats {
    fn from(acc: &Accumulated) -> Self {
        let count = acc.count.max(1) as f64;
        Self {
            count: acc.count,
            errors: acc.errors,
            error_rate: acc.errors as f64 / count,
            avg_duration_ms: acc.total_duration_ms as f64 / count,
            min_duration_ms: acc.min_duration_ms,
            max_duration_ms: acc.max_duration_ms,
            total_duration_ms: acc.total_duration_ms,
            last_error: acc.last_error.clone(),
        }
    }
}

/// Accumulates [`RequestRecord`]s until [`RequestLogger::clear`].
#[derive(Debug, Default)]
pub struct RequestLogger {
    endpoints: DashMap<String, Accumulated>,
}

impl RequestLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self, record: RequestRecord) {
        let is_error = record.status >= 400;
        trace!(
            endpoint = %record.endpoint,
            status = record.status,
            duration_ms = record.duration_ms,
            "request logged"
        );

        #[cfg(feature = "metrics")]
        {
            let endpoint = record.endpoint.clone();
            metrics::counter!("switchboard_requests_total", "endpoint" => endpoint.clone())
                .increment(1);
            if is_error {
                metrics::counter!("switchboard_request_errors_total", "endpoint" => endpoint.clone())
                    .increment(1);
            }
            metrics::histogram!("switchboard_request_duration_ms", "endpoint" => endpoint)
                .record(record.duration_ms as f64);
        }

        let mut acc = self
            .endpoints
            .entry(record.endpoint)
            .or_insert(Accumulated {
                count: 0,
                errors: 0,
                total_duration_ms: 0,
                min_duration_ms: record.duration_ms,
                max_duration_ms: record.duration_ms,
                last_error: None,
            });
        acc.count += 1;
        if is_error {
            acc.errors += 1;
        }
        acc.total_duration_ms = acc.total_duration_ms.saturating_add(record.duration_ms);
        acc.min_duration_ms = acc.min_duration_ms.min(record.duration_ms);
        acc.max_duration_ms = acc.max_duration_ms.max(record.duration_ms);
        if let Some(error) = record.error {
            acc.last_error = Some(error);
        }
    }

    pub fn get_stats(&self, endpoint: &str) -> Option<EndpointStats> {
        self.endpoints.get(endpoint).map(|acc| EndpointStats::from(&*acc))
    }

    /// Snapshot of every endpoint, ordered by endpoint name.
    pub fn get_all_stats(&self) -> BTreeMap<String, EndpointStats> {
        self.endpoints
            .iter()
            .map(|entry| (entry.key().clone(), EndpointStats::from(entry.value())))
            .collect()
    }

    pub fn clear(&self) {
        self.endpoints.clear();
    }
}
