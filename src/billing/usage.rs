//! Best-effort usage reporting
//!
//! Records are queued in process memory and flushed in batches: immediately
//! once the batch size is reached, otherwise after a short delay. Failed
//! flushes log and discard; durability across restarts is out of scope.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Flush as soon as this many records are queued
pub const FLUSH_BATCH: usize = 50;
/// Otherwise flush this long after the first queued record
pub const FLUSH_DELAY: Duration = Duration::from_secs(5);

/// One usage record. Immutable after enqueue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Process-wide usage queue with a single pending-flush timer
pub struct UsageReporter {
    endpoint: Option<String>,
    service_token: Option<String>,
    http: reqwest::Client,
    queue: Mutex<VecDeque<UsageRecord>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl UsageReporter {
    pub fn new(base_url: Option<String>, service_token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            endpoint: base_url
                .map(|u| format!("{}/v1/usage/events", u.trim_end_matches('/'))),
            service_token,
            http,
            queue: Mutex::new(VecDeque::new()),
            timer: Mutex::new(None),
        }
    }

    /// Reporter that silently drops everything (commerce not configured)
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("usage queue lock").len()
    }

    /// Enqueue a record. Never blocks on the network.
    pub fn report(self: &Arc<Self>, record: UsageRecord) {
        if !self.is_enabled() {
            return;
        }

        let queued = {
            let mut queue = self.queue.lock().expect("usage queue lock");
            queue.push_back(record);
            queue.len()
        };

        if queued >= FLUSH_BATCH {
            let reporter = Arc::clone(self);
            tokio::spawn(async move { reporter.flush().await });
            return;
        }

        let mut timer = self.timer.lock().expect("usage timer lock");
        if timer.is_none() {
            let reporter = Arc::clone(self);
            *timer = Some(tokio::spawn(async move {
                tokio::time::sleep(FLUSH_DELAY).await;
                // Drop our own handle before flushing so the flush cannot
                // cancel the task it is running on
                *reporter.timer.lock().expect("usage timer lock") = None;
                reporter.flush().await;
            }));
        }
    }

    /// Send one batch of queued records.
    ///
    /// The batch is removed from the queue before the post; a failed post
    /// logs and discards it.
    pub async fn flush(&self) {
        if let Some(handle) = self.timer.lock().expect("usage timer lock").take() {
            handle.abort();
        }

        let batch: Vec<UsageRecord> = {
            let mut queue = self.queue.lock().expect("usage queue lock");
            let take = queue.len().min(FLUSH_BATCH);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }

        let Some(ref endpoint) = self.endpoint else {
            return;
        };

        let mut request = self
            .http
            .post(endpoint)
            .json(&serde_json::json!({ "events": batch }));
        if let Some(ref token) = self.service_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(count = batch.len(), "usage batch reported");
            }
            Ok(response) => {
                warn!(
                    count = batch.len(),
                    status = %response.status(),
                    "usage report rejected, discarding batch"
                );
            }
            Err(e) => {
                warn!(count = batch.len(), error = %e, "usage report failed, discarding batch");
            }
        }
    }

    /// Drain the queue before exit
    pub async fn shutdown(&self) {
        loop {
            if self.queue_len() == 0 {
                return;
            }
            self.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tokens: u64) -> UsageRecord {
        UsageRecord {
            tenant: Some("acme".into()),
            model: Some("scout".into()),
            provider: Some("anthropic".into()),
            input_tokens: tokens,
            output_tokens: tokens,
            cache_read_tokens: None,
            cache_write_tokens: None,
            total_tokens: tokens * 2,
            duration_ms: Some(120),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_disabled_reporter_drops() {
        let reporter = Arc::new(UsageReporter::disabled());
        reporter.report(record(10));
        assert_eq!(reporter.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_report_queues_until_flush() {
        // Unroutable endpoint: flushes fail, which still discards the batch
        let reporter = Arc::new(UsageReporter::new(
            Some("http://127.0.0.1:1".into()),
            None,
        ));
        reporter.report(record(10));
        reporter.report(record(20));
        assert_eq!(reporter.queue_len(), 2);

        reporter.flush().await;
        assert_eq!(reporter.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_flush_takes_at_most_a_batch() {
        let reporter = Arc::new(UsageReporter::new(
            Some("http://127.0.0.1:1".into()),
            None,
        ));
        {
            let mut queue = reporter.queue.lock().unwrap();
            for i in 0..(FLUSH_BATCH + 5) {
                queue.push_back(record(i as u64));
            }
        }

        reporter.flush().await;
        assert_eq!(reporter.queue_len(), 5);
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let reporter = Arc::new(UsageReporter::new(
            Some("http://127.0.0.1:1".into()),
            None,
        ));
        {
            let mut queue = reporter.queue.lock().unwrap();
            for i in 0..(FLUSH_BATCH * 2 + 3) {
                queue.push_back(record(i as u64));
            }
        }

        reporter.shutdown().await;
        assert_eq!(reporter.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_serialized_record_shape() {
        let json = serde_json::to_value(record(10)).unwrap();
        assert_eq!(json["inputTokens"], 10);
        assert_eq!(json["totalTokens"], 20);
        assert!(json.get("cacheReadTokens").is_none());
    }
}
