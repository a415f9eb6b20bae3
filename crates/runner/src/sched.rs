// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Distributed periodic publisher.
//!
//! Every node runs the same loop; the KV `sched` bucket arbitrates.
//! The key holds the next-run time as 8 bytes little-endian epoch-ms; a
//! revision-checked update decides the single winner per interval, and
//! losers simply observe the new timestamp and go back to sleep.

use bytes::Bytes;
use pm3_broker::{BrokerClient, BrokerError, KvBucket, KV_SCHED};
use pm3_manifest::ScheduleEntry;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Jitter bound as a fraction of the sleep.
const JITTER_FRACTION: f64 = 0.10;

pub struct Scheduler {
    broker: Arc<dyn BrokerClient>,
    cancel: CancellationToken,
}

/// What one arbitration round decided.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FireOutcome {
    /// We won the CAS and published.
    Fired { next_run_ms: u64 },
    /// Someone else advanced the clock, or it is not due yet.
    Sleep { until_ms: u64 },
}

impl Scheduler {
    pub fn new(broker: Arc<dyn BrokerClient>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self { broker, cancel })
    }

    /// Launch the loop for one schedule entry.
    pub fn spawn_entry(self: &Arc<Self>, subject: String, queue: String, index: usize, entry: ScheduleEntry) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let key = format!("{subject}.{queue}.{index}");
            let topic = entry.topic.clone().unwrap_or_else(|| subject.clone());
            let payload = Bytes::from(entry.payload.clone().unwrap_or_default());

            loop {
                if scheduler.cancel.is_cancelled() {
                    return;
                }
                let now_ms = epoch_ms();
                let outcome = scheduler
                    .try_fire(&key, &topic, &payload, entry.interval, now_ms)
                    .await;
                let until_ms = match outcome {
                    Ok(FireOutcome::Fired { next_run_ms }) => {
                        debug!(%key, %topic, "scheduled publish fired");
                        next_run_ms
                    }
                    Ok(FireOutcome::Sleep { until_ms }) => until_ms,
                    Err(err) => {
                        warn!(%key, %err, "scheduler round failed");
                        now_ms + entry.interval.as_millis() as u64
                    }
                };

                let sleep = jittered(Duration::from_millis(until_ms.saturating_sub(epoch_ms()).max(1)));
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => return,
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
        });
    }

    /// One arbitration round. Public to the crate for tests.
    pub(crate) async fn try_fire(
        &self,
        key: &str,
        topic: &str,
        payload: &Bytes,
        interval: Duration,
        now_ms: u64,
    ) -> Result<FireOutcome, BrokerError> {
        let kv = self.broker.kv(KV_SCHED).await?;
        let interval_ms = interval.as_millis() as u64;

        let Some(entry) = kv.get(key).await? else {
            // First node to see the key seeds it; nobody fires on seed.
            let next = now_ms + interval_ms;
            match kv.create(key, encode(next)).await {
                Ok(_) => return Ok(FireOutcome::Sleep { until_ms: next }),
                // Lost the seed race; re-read on the next round.
                Err(BrokerError::KeyExists { .. }) => {
                    return Ok(FireOutcome::Sleep { until_ms: now_ms })
                }
                Err(err) => return Err(err),
            }
        };

        let next_run = decode(&entry.value);
        if next_run > now_ms {
            return Ok(FireOutcome::Sleep { until_ms: next_run });
        }

        let new_next = now_ms + interval_ms;
        match kv.update(key, encode(new_next), entry.revision).await {
            Ok(_) => {
                self.broker
                    .publish(topic, Vec::new(), payload.clone())
                    .await?;
                Ok(FireOutcome::Fired { next_run_ms: new_next })
            }
            // Another node won this interval.
            Err(BrokerError::RevisionMismatch { .. }) => {
                let until = read_next(&*kv, key).await.unwrap_or(new_next);
                Ok(FireOutcome::Sleep { until_ms: until })
            }
            Err(err) => Err(err),
        }
    }
}

fn encode(ms: u64) -> Bytes {
    Bytes::copy_from_slice(&ms.to_le_bytes())
}

fn decode(value: &Bytes) -> u64 {
    let mut buf = [0u8; 8];
    let len = value.len().min(8);
    buf[..len].copy_from_slice(&value[..len]);
    u64::from_le_bytes(buf)
}

async fn read_next(kv: &dyn KvBucket, key: &str) -> Option<u64> {
    kv.get(key).await.ok().flatten().map(|e| decode(&e.value))
}

/// Apply up to ±10% jitter from a truncated normal distribution.
fn jittered(base: Duration) -> Duration {
    let normal = match Normal::new(0.0, JITTER_FRACTION / 2.0) {
        Ok(normal) => normal,
        Err(_) => return base,
    };
    let mut rng = rand::thread_rng();
    let factor: f64 = normal.sample(&mut rng);
    let factor = factor.clamp(-JITTER_FRACTION, JITTER_FRACTION);
    let jittered = base.as_secs_f64() * (1.0 + factor);
    Duration::from_secs_f64(jittered.max(0.001))
}

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "sched_tests.rs"]
mod tests;
