use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use llmgate_common::MetricsSettings;

use crate::config::TransportKind;

/// Aggregation key for one metrics bucket. `window_start` is the wall
/// clock rounded down to the configured bucket width, UTC.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleKey {
    pub provider_id: String,
    pub logical_model: String,
    pub transport: TransportKind,
    pub is_stream: bool,
    pub user_id: Option<String>,
    pub api_key_id: Option<String>,
    pub window_start: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleCounters {
    pub total: u64,
    pub success: u64,
    pub error: u64,
}

#[derive(Debug, Default)]
struct Bucket {
    counters: SampleCounters,
    /// Bounded latency reservoir (classic reservoir sampling).
    latencies_ms: Vec<f64>,
    latencies_seen: u64,
}

/// One flushed bucket, handed to the external rollup store.
#[derive(Debug, Clone)]
pub struct MetricsRecord {
    pub key: SampleKey,
    pub counters: SampleCounters,
    pub latencies_ms: Vec<f64>,
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn upsert(&self, records: Vec<MetricsRecord>) -> Result<(), String>;
}

/// Log-only sink: the persistent rollup store is an external collaborator.
pub struct TracingMetricsSink;

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn upsert(&self, records: Vec<MetricsRecord>) -> Result<(), String> {
        for record in records {
            debug!(
                provider = %record.key.provider_id,
                logical_model = %record.key.logical_model,
                transport = record.key.transport.as_str(),
                is_stream = record.key.is_stream,
                window_start = record.key.window_start,
                total = record.counters.total,
                success = record.counters.success,
                error = record.counters.error,
                samples = record.latencies_ms.len(),
                "metrics bucket flushed"
            );
        }
        Ok(())
    }
}

/// Process-wide bounded metrics aggregator.
///
/// Sample recording never blocks on the sink; a background flusher drains
/// buckets on an interval and failed flushes are merged back for the next
/// tick.
pub struct MetricsBuffer {
    settings: MetricsSettings,
    sink: Arc<dyn MetricsSink>,
    buckets: Mutex<HashMap<SampleKey, Bucket>>,
}

impl MetricsBuffer {
    pub fn new(settings: MetricsSettings, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            settings,
            sink,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_sample(
        &self,
        provider_id: &str,
        logical_model: &str,
        transport: TransportKind,
        is_stream: bool,
        user_id: Option<&str>,
        api_key_id: Option<&str>,
        success: bool,
        latency_ms: f64,
        now_unix: i64,
    ) {
        let bucket_secs = self.settings.bucket_secs.max(1) as i64;
        let key = SampleKey {
            provider_id: provider_id.to_string(),
            logical_model: logical_model.to_string(),
            transport,
            is_stream,
            user_id: user_id.map(str::to_string),
            api_key_id: api_key_id.map(str::to_string),
            window_start: now_unix - now_unix.rem_euclid(bucket_secs),
        };

        if !self.settings.buffered {
            let record = MetricsRecord {
                key,
                counters: SampleCounters {
                    total: 1,
                    success: u64::from(success),
                    error: u64::from(!success),
                },
                latencies_ms: vec![latency_ms],
            };
            if let Err(err) = self.sink.upsert(vec![record]).await {
                warn!(error = %err, "immediate metrics upsert failed");
            }
            return;
        }

        let overflow = {
            let mut buckets = self.buckets.lock().await;
            let bucket = buckets.entry(key).or_default();
            bucket.counters.total += 1;
            if success {
                bucket.counters.success += 1;
            } else {
                bucket.counters.error += 1;
            }
            if self.keep_latency_sample(success) {
                push_reservoir(bucket, latency_ms, self.settings.reservoir_size);
            }

            if buckets.len() > self.settings.max_buckets {
                pop_oldest(&mut buckets)
            } else {
                None
            }
        };

        // Oldest bucket is force-flushed outside the lock when full.
        if let Some(record) = overflow
            && let Err(err) = self.sink.upsert(vec![record]).await
        {
            warn!(error = %err, "force flush of oldest metrics bucket failed");
        }
    }

    /// Drain everything and upsert; failed records are merged back.
    pub async fn flush(&self) {
        let records = {
            let mut buckets = self.buckets.lock().await;
            let drained: Vec<MetricsRecord> = buckets
                .drain()
                .map(|(key, bucket)| MetricsRecord {
                    key,
                    counters: bucket.counters,
                    latencies_ms: bucket.latencies_ms,
                })
                .collect();
            drained
        };
        if records.is_empty() {
            return;
        }
        if let Err(err) = self.sink.upsert(records.clone()).await {
            warn!(error = %err, "metrics flush failed; retrying next tick");
            let mut buckets = self.buckets.lock().await;
            for record in records {
                let bucket = buckets.entry(record.key).or_default();
                bucket.counters.total += record.counters.total;
                bucket.counters.success += record.counters.success;
                bucket.counters.error += record.counters.error;
                for latency in record.latencies_ms {
                    push_reservoir(bucket, latency, self.settings.reservoir_size);
                }
            }
        }
    }

    /// Periodic flusher; hold the handle and abort it on shutdown after a
    /// final manual `flush`.
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let buffer = Arc::clone(self);
        let interval = Duration::from_secs(buffer.settings.flush_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                buffer.flush().await;
            }
        })
    }

    pub async fn bucket_count(&self) -> usize {
        self.buckets.lock().await.len()
    }

    fn keep_latency_sample(&self, success: bool) -> bool {
        if !success || self.settings.success_sample_rate >= 1.0 {
            return true;
        }
        rand::rng().random_bool(self.settings.success_sample_rate.clamp(0.0, 1.0))
    }
}

fn push_reservoir(bucket: &mut Bucket, latency_ms: f64, size: usize) {
    bucket.latencies_seen += 1;
    if bucket.latencies_ms.len() < size.max(1) {
        bucket.latencies_ms.push(latency_ms);
        return;
    }
    let slot = rand::rng().random_range(0..bucket.latencies_seen);
    if (slot as usize) < bucket.latencies_ms.len() {
        bucket.latencies_ms[slot as usize] = latency_ms;
    }
}

fn pop_oldest(buckets: &mut HashMap<SampleKey, Bucket>) -> Option<MetricsRecord> {
    let oldest = buckets
        .keys()
        .min_by_key(|key| key.window_start)
        .cloned()?;
    let bucket = buckets.remove(&oldest)?;
    Some(MetricsRecord {
        key: oldest,
        counters: bucket.counters,
        latencies_ms: bucket.latencies_ms,
    })
}
