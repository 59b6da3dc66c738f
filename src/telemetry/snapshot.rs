//! Persisted telemetry shape and its pure update rules

use super::{ErrorRecord, SuccessRecord};
use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Most recent outcomes kept in the history
pub const HISTORY_LIMIT: usize = 100;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Aggregate counters, kept overall and per calendar day
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Counters {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_response_time_ms: u64,
    pub total_tokens_used: u64,
}

impl Counters {
    fn add(&mut self, other: &Counters) {
        self.total_requests += other.total_requests;
        self.successful_requests += other.successful_requests;
        self.failed_requests += other.failed_requests;
        self.total_response_time_ms += other.total_response_time_ms;
        self.total_tokens_used += other.total_tokens_used;
    }

    fn record_success(&mut self, record: &SuccessRecord) {
        self.successful_requests += 1;
        self.total_response_time_ms += record.response_time.as_millis() as u64;
        self.total_tokens_used += record.tokens_used;
    }
}

/// One request outcome in the bounded history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    /// Unix epoch milliseconds
    pub timestamp: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Everything persisted under the telemetry key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySnapshot {
    #[serde(flatten)]
    pub counters: Counters,
    /// Unix epoch milliseconds of the last started request
    pub last_request_time: Option<i64>,
    pub request_history: VecDeque<HistoryEntry>,
    pub errors_by_type: BTreeMap<String, u64>,
    pub daily_stats: BTreeMap<String, Counters>,
}

impl TelemetrySnapshot {
    fn today(&mut self, now: DateTime<Local>) -> &mut Counters {
        self.daily_stats
            .entry(now.format(DATE_FORMAT).to_string())
            .or_default()
    }

    fn push_history(&mut self, entry: HistoryEntry) {
        self.request_history.push_back(entry);
        while self.request_history.len() > HISTORY_LIMIT {
            self.request_history.pop_front();
        }
    }

    pub(crate) fn apply_start(&mut self, now: DateTime<Local>) {
        self.counters.total_requests += 1;
        self.last_request_time = Some(now.timestamp_millis());
        self.today(now).total_requests += 1;
    }

    pub(crate) fn apply_success(&mut self, id: String, record: SuccessRecord, now: DateTime<Local>) {
        self.counters.record_success(&record);
        self.today(now).record_success(&record);
        self.push_history(HistoryEntry {
            id,
            timestamp: now.timestamp_millis(),
            success: true,
            response_time_ms: Some(record.response_time.as_millis() as u64),
            tokens_used: Some(record.tokens_used),
            model: Some(record.model),
            error_type: None,
            error_message: None,
        });
    }

    pub(crate) fn apply_error(&mut self, id: String, record: ErrorRecord, now: DateTime<Local>) {
        self.counters.failed_requests += 1;
        *self
            .errors_by_type
            .entry(record.error_type.clone())
            .or_insert(0) += 1;
        self.today(now).failed_requests += 1;
        self.push_history(HistoryEntry {
            id,
            timestamp: now.timestamp_millis(),
            success: false,
            response_time_ms: None,
            tokens_used: None,
            model: None,
            error_type: Some(record.error_type),
            error_message: Some(record.error_message),
        });
    }

    /// `successful / total * 100`, or 0 with no requests
    pub fn success_rate(&self) -> f64 {
        if self.counters.total_requests == 0 {
            return 0.0;
        }
        self.counters.successful_requests as f64 / self.counters.total_requests as f64 * 100.0
    }

    /// Mean success latency in ms, or 0 with no successes
    pub fn average_response_time(&self) -> f64 {
        if self.counters.successful_requests == 0 {
            return 0.0;
        }
        self.counters.total_response_time_ms as f64 / self.counters.successful_requests as f64
    }

    /// Sum the daily buckets whose date lies in `[start, end]`.
    pub fn date_range(&self, start: NaiveDate, end: NaiveDate) -> Counters {
        let start = start.format(DATE_FORMAT).to_string();
        let end = end.format(DATE_FORMAT).to_string();
        let mut total = Counters::default();
        for (_, day) in self
            .daily_stats
            .iter()
            .filter(|(date, _)| date.as_str() >= start.as_str() && date.as_str() <= end.as_str())
        {
            total.add(day);
        }
        total
    }

    pub fn summary(&self) -> TelemetrySummary {
        let today = Local::now().format(DATE_FORMAT).to_string();
        TelemetrySummary {
            counters: self.counters.clone(),
            success_rate: self.success_rate(),
            average_response_time_ms: self.average_response_time(),
            errors_by_type: self.errors_by_type.clone(),
            today: self.daily_stats.get(&today).cloned().unwrap_or_default(),
            last_request_time: self.last_request_time,
        }
    }
}

/// Human-oriented view of the telemetry
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySummary {
    pub counters: Counters,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub errors_by_type: BTreeMap<String, u64>,
    pub today: Counters,
    pub last_request_time: Option<i64>,
}

impl std::fmt::Display for TelemetrySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Telemetry ===")?;
        writeln!(f, "Total requests: {}", self.counters.total_requests)?;
        writeln!(f, "Successful: {}", self.counters.successful_requests)?;
        writeln!(f, "Failed: {}", self.counters.failed_requests)?;
        writeln!(f, "Success rate: {:.1}%", self.success_rate)?;
        writeln!(f, "Avg response time: {:.0}ms", self.average_response_time_ms)?;
        writeln!(f, "Tokens used: {}", self.counters.total_tokens_used)?;
        writeln!(
            f,
            "Today: {} requests, {} failed",
            self.today.total_requests, self.today.failed_requests
        )?;
        if let Some(last) = self
            .last_request_time
            .and_then(DateTime::from_timestamp_millis)
        {
            writeln!(
                f,
                "Last request: {}",
                last.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            )?;
        }
        if !self.errors_by_type.is_empty() {
            writeln!(f, "Errors by type:")?;
            for (kind, count) in &self.errors_by_type {
                writeln!(f, "  {kind}: {count}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn success(ms: u64) -> SuccessRecord {
        SuccessRecord {
            response_time: Duration::from_millis(ms),
            tokens_used: 3,
            model: "m".to_string(),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = TelemetrySnapshot::default();
        let now = at(2024, 5, 1);
        for i in 0..(HISTORY_LIMIT + 5) {
            snapshot.apply_start(now);
            snapshot.apply_success(format!("req-{i}"), success(10), now);
        }
        assert_eq!(snapshot.request_history.len(), HISTORY_LIMIT);
        assert_eq!(snapshot.request_history.front().unwrap().id, "req-5");
        assert_eq!(snapshot.counters.successful_requests, (HISTORY_LIMIT + 5) as u64);
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let mut snapshot = TelemetrySnapshot::default();
        for (day, ms) in [(1, 100), (2, 200), (3, 300), (10, 400)] {
            let now = at(2024, 5, day);
            snapshot.apply_start(now);
            snapshot.apply_success(format!("d{day}"), success(ms), now);
        }

        let range = snapshot.date_range(
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
        );
        assert_eq!(range.total_requests, 3);
        assert_eq!(range.total_response_time_ms, 900);
    }

    #[test]
    fn test_wire_shape_is_camel_case() {
        let mut snapshot = TelemetrySnapshot::default();
        let now = at(2024, 5, 1);
        snapshot.apply_start(now);
        snapshot.apply_error(
            "x".into(),
            ErrorRecord {
                error_type: "network".into(),
                error_message: "Network error: reset".into(),
            },
            now,
        );

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["totalRequests"], json!(1));
        assert_eq!(value["failedRequests"], json!(1));
        assert_eq!(value["errorsByType"]["network"], json!(1));
        assert_eq!(value["dailyStats"]["2024-05-01"]["failedRequests"], json!(1));
        assert_eq!(value["requestHistory"][0]["errorType"], json!("network"));

        let back: TelemetrySnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_partial_blob_loads_with_defaults() {
        let snapshot: TelemetrySnapshot =
            serde_json::from_value(json!({"totalRequests": 4, "successfulRequests": 1})).unwrap();
        assert_eq!(snapshot.success_rate(), 25.0);
        assert!(snapshot.daily_stats.is_empty());
    }
}
