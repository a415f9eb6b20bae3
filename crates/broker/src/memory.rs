// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process broker satisfying [`BrokerClient`].
//!
//! Backs the embedded gateway in single-node setups and every test that
//! needs broker semantics: wildcard subjects, queue groups, durable streams
//! with ack/nak/term and redelivery, revision-checked KV buckets.

use crate::client::{
    AckHandle, BrokerClient, BrokerError, KvBucket, KvEntry, Msg, MsgMeta, Subscription,
};
use crate::subject;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Ack window before an unacked delivery becomes redeliverable.
const ACK_WAIT: Duration = Duration::from_secs(30);
/// Poll granularity of the consumer pump.
const PUMP_TICK: Duration = Duration::from_millis(25);
const CHANNEL_DEPTH: usize = 64;

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct CoreSub {
    pattern: String,
    queue: Option<String>,
    tx: mpsc::Sender<Msg>,
}

#[derive(Clone)]
struct StoredMsg {
    seq: u64,
    subject: String,
    headers: Vec<(String, String)>,
    payload: Bytes,
    published_ms: u64,
}

struct Pending {
    deliveries: u32,
    /// Epoch-ms after which the delivery may go out again.
    redeliver_at: u64,
}

#[derive(Default)]
struct GroupState {
    /// Next never-delivered sequence.
    cursor: u64,
    consumer_seq: u64,
    pending: HashMap<u64, Pending>,
}

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    messages: Vec<StoredMsg>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Bucket {
    rev: u64,
    entries: HashMap<String, (Bytes, u64)>,
}

#[derive(Default)]
struct Inner {
    subs: Mutex<Vec<CoreSub>>,
    streams: Mutex<HashMap<String, StreamState>>,
    buckets: Mutex<HashMap<String, Bucket>>,
    objects: Mutex<HashMap<String, HashMap<String, Bytes>>>,
}

/// See module docs.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the delivery targets for one published message: every plain
    /// subscriber plus one member per matching queue group.
    fn fan_out(&self, subject_name: &str) -> Vec<mpsc::Sender<Msg>> {
        let mut subs = self.inner.subs.lock();
        subs.retain(|s| !s.tx.is_closed());

        let mut plain = Vec::new();
        let mut grouped: HashMap<&str, Vec<&CoreSub>> = HashMap::new();
        for sub in subs.iter() {
            if !subject::matches(&sub.pattern, subject_name) {
                continue;
            }
            match &sub.queue {
                None => plain.push(sub.tx.clone()),
                Some(queue) => grouped.entry(queue.as_str()).or_default().push(sub),
            }
        }
        let mut rng = rand::thread_rng();
        for members in grouped.values() {
            if let Some(chosen) = members.choose(&mut rng) {
                plain.push(chosen.tx.clone());
            }
        }
        plain
    }

    /// Pop the next deliverable message for a group: a redeliverable pending
    /// entry wins over fresh messages so retries are not starved.
    fn next_deliverable(
        inner: &Inner,
        stream: &str,
        filter: &str,
        group: &str,
    ) -> Option<(StoredMsg, MsgMeta)> {
        let now = epoch_ms();
        let mut streams = inner.streams.lock();
        let state = streams.get_mut(stream)?;

        // Split borrows: find the candidate seq first, then mutate.
        let redeliver_seq = {
            let gs = state.groups.entry(group.to_string()).or_default();
            let mut due: Vec<u64> = gs
                .pending
                .iter()
                .filter(|(_, p)| p.redeliver_at <= now)
                .map(|(seq, _)| *seq)
                .collect();
            due.sort_unstable();
            due.first().copied()
        };

        if let Some(seq) = redeliver_seq {
            let msg = state.messages.iter().find(|m| m.seq == seq)?.clone();
            let gs = state.groups.entry(group.to_string()).or_default();
            gs.consumer_seq += 1;
            let pending = gs.pending.entry(seq).or_insert(Pending { deliveries: 0, redeliver_at: 0 });
            pending.deliveries += 1;
            pending.redeliver_at = now + ACK_WAIT.as_millis() as u64;
            let meta = MsgMeta {
                stream: stream.to_string(),
                consumer: group.to_string(),
                stream_seq: seq,
                consumer_seq: gs.consumer_seq,
                deliveries: pending.deliveries,
                published_ms: msg.published_ms,
            };
            return Some((msg, meta));
        }

        let cursor = state.groups.entry(group.to_string()).or_default().cursor;
        let fresh = state
            .messages
            .iter()
            .find(|m| m.seq >= cursor && (filter.is_empty() || subject::matches(filter, &m.subject)))
            .cloned()?;
        let gs = state.groups.entry(group.to_string()).or_default();
        gs.cursor = fresh.seq + 1;
        gs.consumer_seq += 1;
        gs.pending.insert(
            fresh.seq,
            Pending { deliveries: 1, redeliver_at: now + ACK_WAIT.as_millis() as u64 },
        );
        let meta = MsgMeta {
            stream: stream.to_string(),
            consumer: group.to_string(),
            stream_seq: fresh.seq,
            consumer_seq: gs.consumer_seq,
            deliveries: 1,
            published_ms: fresh.published_ms,
        };
        Some((fresh, meta))
    }

    fn make_durable_msg(&self, stored: StoredMsg, meta: MsgMeta) -> Msg {
        let acker = MemAcker {
            inner: Arc::clone(&self.inner),
            stream: meta.stream.clone(),
            group: meta.consumer.clone(),
            seq: meta.stream_seq,
        };
        Msg {
            subject: stored.subject,
            reply: None,
            headers: stored.headers,
            payload: stored.payload,
            meta: Some(meta),
            acker: Some(Arc::new(acker)),
        }
    }
}

struct MemAcker {
    inner: Arc<Inner>,
    stream: String,
    group: String,
    seq: u64,
}

impl MemAcker {
    fn with_group(&self, f: impl FnOnce(&mut GroupState)) {
        let mut streams = self.inner.streams.lock();
        if let Some(state) = streams.get_mut(&self.stream) {
            if let Some(gs) = state.groups.get_mut(&self.group) {
                f(gs);
            }
        }
    }
}

#[async_trait]
impl AckHandle for MemAcker {
    async fn ack(&self) {
        self.with_group(|gs| {
            gs.pending.remove(&self.seq);
        });
    }

    async fn nak(&self, delay: Option<Duration>) {
        let at = epoch_ms() + delay.unwrap_or_default().as_millis() as u64;
        self.with_group(|gs| {
            if let Some(p) = gs.pending.get_mut(&self.seq) {
                p.redeliver_at = at;
            }
        });
    }

    async fn in_progress(&self) {
        let at = epoch_ms() + ACK_WAIT.as_millis() as u64;
        self.with_group(|gs| {
            if let Some(p) = gs.pending.get_mut(&self.seq) {
                p.redeliver_at = at;
            }
        });
    }

    async fn term(&self) {
        self.with_group(|gs| {
            gs.pending.remove(&self.seq);
        });
    }
}

struct MemKv {
    inner: Arc<Inner>,
    bucket: String,
}

impl MemKv {
    fn with_bucket<T>(
        &self,
        f: impl FnOnce(&mut Bucket) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        let mut buckets = self.inner.buckets.lock();
        let bucket = buckets
            .get_mut(&self.bucket)
            .ok_or_else(|| BrokerError::UnknownBucket(self.bucket.clone()))?;
        f(bucket)
    }
}

#[async_trait]
impl KvBucket for MemKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, BrokerError> {
        self.with_bucket(|b| {
            Ok(b.entries
                .get(key)
                .map(|(value, revision)| KvEntry { value: value.clone(), revision: *revision }))
        })
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64, BrokerError> {
        self.with_bucket(|b| {
            b.rev += 1;
            b.entries.insert(key.to_string(), (value, b.rev));
            Ok(b.rev)
        })
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64, BrokerError> {
        let bucket = self.bucket.clone();
        self.with_bucket(|b| {
            if b.entries.contains_key(key) {
                return Err(BrokerError::KeyExists { bucket, key: key.to_string() });
            }
            b.rev += 1;
            b.entries.insert(key.to_string(), (value, b.rev));
            Ok(b.rev)
        })
    }

    async fn update(&self, key: &str, value: Bytes, expected: u64) -> Result<u64, BrokerError> {
        let bucket = self.bucket.clone();
        self.with_bucket(|b| {
            let found = b.entries.get(key).map(|(_, rev)| *rev).unwrap_or(0);
            if found != expected {
                return Err(BrokerError::RevisionMismatch {
                    bucket,
                    key: key.to_string(),
                    expected,
                    found,
                });
            }
            b.rev += 1;
            b.entries.insert(key.to_string(), (value, b.rev));
            Ok(b.rev)
        })
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        self.with_bucket(|b| {
            b.entries.remove(key);
            Ok(())
        })
    }

    async fn keys(&self) -> Result<Vec<String>, BrokerError> {
        self.with_bucket(|b| {
            let mut keys: Vec<String> = b.entries.keys().cloned().collect();
            keys.sort();
            Ok(keys)
        })
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn publish(
        &self,
        subject_name: &str,
        headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<(), BrokerError> {
        if subject_name.is_empty() {
            return Err(BrokerError::BadSubject(subject_name.to_string()));
        }

        if let Some((stream, _)) = subject::jet_parts(subject_name) {
            let mut streams = self.inner.streams.lock();
            let state = streams
                .get_mut(stream)
                .ok_or_else(|| BrokerError::UnknownStream(stream.to_string()))?;
            state.next_seq += 1;
            state.messages.push(StoredMsg {
                seq: state.next_seq,
                subject: subject_name.to_string(),
                headers: headers.clone(),
                payload: payload.clone(),
                published_ms: epoch_ms(),
            });
        }

        let targets = self.fan_out(subject_name);
        for tx in targets {
            let msg = Msg {
                subject: subject_name.to_string(),
                reply: None,
                headers: headers.clone(),
                payload: payload.clone(),
                meta: None,
                acker: None,
            };
            let _ = tx.send(msg).await;
        }
        Ok(())
    }

    async fn request(
        &self,
        subject_name: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Msg, BrokerError> {
        let inbox = format!("_inbox.{}", nanoid::nanoid!(12));
        let mut sub = self.subscribe(&inbox, None).await?;

        // Hand the reply inbox to whichever subscriber picks this up.
        let has_responder = {
            let subs = self.inner.subs.lock();
            subs.iter().any(|s| subject::matches(&s.pattern, subject_name) && !s.tx.is_closed())
        };
        if !has_responder {
            return Err(BrokerError::NoResponders(subject_name.to_string()));
        }

        let targets = self.fan_out(subject_name);
        for tx in targets {
            let msg = Msg {
                subject: subject_name.to_string(),
                reply: Some(inbox.clone()),
                headers: Vec::new(),
                payload: payload.clone(),
                meta: None,
                acker: None,
            };
            let _ = tx.send(msg).await;
        }

        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) | Err(_) => Err(BrokerError::Timeout(subject_name.to_string())),
        }
    }

    async fn subscribe(
        &self,
        pattern: &str,
        queue: Option<&str>,
    ) -> Result<Subscription, BrokerError> {
        if pattern.is_empty() {
            return Err(BrokerError::BadSubject(pattern.to_string()));
        }
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.inner.subs.lock().push(CoreSub {
            pattern: pattern.to_string(),
            queue: queue.map(str::to_string),
            tx,
        });
        Ok(Subscription { rx })
    }

    async fn consume(
        &self,
        stream: &str,
        filter: &str,
        group: &str,
    ) -> Result<Subscription, BrokerError> {
        if !self.inner.streams.lock().contains_key(stream) {
            return Err(BrokerError::UnknownStream(stream.to_string()));
        }
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let broker = self.clone();
        let (stream, filter, group) = (stream.to_string(), filter.to_string(), group.to_string());
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PUMP_TICK);
            loop {
                tick.tick().await;
                if tx.is_closed() {
                    return;
                }
                while let Some((stored, meta)) =
                    Self::next_deliverable(&broker.inner, &stream, &filter, &group)
                {
                    let msg = broker.make_durable_msg(stored, meta);
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(Subscription { rx })
    }

    async fn fetch(
        &self,
        stream: &str,
        filter: &str,
        group: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Msg>, BrokerError> {
        if !self.inner.streams.lock().contains_key(stream) {
            return Err(BrokerError::UnknownStream(stream.to_string()));
        }
        let deadline = tokio::time::Instant::now() + wait;
        let mut out = Vec::new();
        while out.len() < max {
            match Self::next_deliverable(&self.inner, stream, filter, group) {
                Some((stored, meta)) => out.push(self.make_durable_msg(stored, meta)),
                None if out.is_empty() && tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(PUMP_TICK).await;
                }
                None => break,
            }
        }
        Ok(out)
    }

    async fn ensure_stream(&self, name: &str) -> Result<(), BrokerError> {
        self.inner.streams.lock().entry(name.to_string()).or_default();
        Ok(())
    }

    async fn ensure_kv(&self, bucket: &str) -> Result<(), BrokerError> {
        self.inner.buckets.lock().entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn ensure_object_store(&self, name: &str) -> Result<(), BrokerError> {
        self.inner.objects.lock().entry(name.to_string()).or_default();
        Ok(())
    }

    async fn kv(&self, bucket: &str) -> Result<Arc<dyn KvBucket>, BrokerError> {
        if !self.inner.buckets.lock().contains_key(bucket) {
            return Err(BrokerError::UnknownBucket(bucket.to_string()));
        }
        Ok(Arc::new(MemKv { inner: Arc::clone(&self.inner), bucket: bucket.to_string() }))
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
