// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The client-side broker contract.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("no responders on {0}")]
    NoResponders(String),

    #[error("request timed out on {0}")]
    Timeout(String),

    #[error("unknown stream {0}")]
    UnknownStream(String),

    #[error("unknown kv bucket {0}")]
    UnknownBucket(String),

    #[error("kv {bucket}/{key}: revision conflict (expected {expected}, found {found})")]
    RevisionMismatch {
        bucket: String,
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("kv {bucket}/{key}: key already exists")]
    KeyExists { bucket: String, key: String },

    #[error("invalid subject {0:?}")]
    BadSubject(String),
}

/// Delivery metadata present on durable-stream messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgMeta {
    pub stream: String,
    pub consumer: String,
    pub stream_seq: u64,
    pub consumer_seq: u64,
    /// 1-based delivery attempt.
    pub deliveries: u32,
    /// Publish time, epoch milliseconds.
    pub published_ms: u64,
}

/// Explicit-ack surface for durable deliveries.
///
/// Core (non-stream) messages carry no handle; acking them is a no-op.
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// Positive acknowledgement; the message will not be redelivered.
    async fn ack(&self);
    /// Negative acknowledgement; redeliver after `delay` (broker default
    /// when `None`).
    async fn nak(&self, delay: Option<Duration>);
    /// Extend the ack window while a handler is still working.
    async fn in_progress(&self);
    /// Terminate: permanent failure, no redelivery.
    async fn term(&self);
}

/// One delivered message.
pub struct Msg {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Vec<(String, String)>,
    pub payload: Bytes,
    pub meta: Option<MsgMeta>,
    pub(crate) acker: Option<Arc<dyn AckHandle>>,
}

impl Msg {
    pub fn core(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Vec::new(),
            payload,
            meta: None,
            acker: None,
        }
    }

    pub async fn ack(&self) {
        if let Some(acker) = &self.acker {
            acker.ack().await;
        }
    }

    pub async fn nak(&self, delay: Option<Duration>) {
        if let Some(acker) = &self.acker {
            acker.nak(delay).await;
        }
    }

    pub async fn in_progress(&self) {
        if let Some(acker) = &self.acker {
            acker.in_progress().await;
        }
    }

    pub async fn term(&self) {
        if let Some(acker) = &self.acker {
            acker.term().await;
        }
    }

    /// Shared ack handle, for helpers (heartbeats) outliving the borrow.
    pub fn ack_handle(&self) -> Option<Arc<dyn AckHandle>> {
        self.acker.clone()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Debug for Msg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Msg")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// A live subscription. Dropping it cancels delivery.
pub struct Subscription {
    pub(crate) rx: mpsc::Receiver<Msg>,
}

impl Subscription {
    /// Next message, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Msg> {
        self.rx.recv().await
    }
}

/// A KV entry with its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Bytes,
    pub revision: u64,
}

/// Revision-checked key-value bucket.
#[async_trait]
pub trait KvBucket: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, BrokerError>;
    /// Unconditional write; returns the new revision.
    async fn put(&self, key: &str, value: Bytes) -> Result<u64, BrokerError>;
    /// Write only if the key does not exist yet.
    async fn create(&self, key: &str, value: Bytes) -> Result<u64, BrokerError>;
    /// Compare-and-swap on the revision; returns the new revision.
    async fn update(&self, key: &str, value: Bytes, expected: u64) -> Result<u64, BrokerError>;
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;
    async fn keys(&self) -> Result<Vec<String>, BrokerError>;
}

/// The full client contract the node consumes.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Publish on a subject. `jet.`-prefixed subjects are also appended to
    /// their stream.
    async fn publish(
        &self,
        subject: &str,
        headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<(), BrokerError>;

    /// Request/reply with a timeout.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Msg, BrokerError>;

    /// Core subscription; `queue` joins a queue group.
    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Subscription, BrokerError>;

    /// Push consumer over a durable stream with explicit acks.
    async fn consume(
        &self,
        stream: &str,
        filter: &str,
        group: &str,
    ) -> Result<Subscription, BrokerError>;

    /// Pull up to `max` messages from a durable stream, waiting up to
    /// `wait` for the first one.
    async fn fetch(
        &self,
        stream: &str,
        filter: &str,
        group: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Msg>, BrokerError>;

    async fn ensure_stream(&self, name: &str) -> Result<(), BrokerError>;
    async fn ensure_kv(&self, bucket: &str) -> Result<(), BrokerError>;
    async fn ensure_object_store(&self, name: &str) -> Result<(), BrokerError>;

    async fn kv(&self, bucket: &str) -> Result<Arc<dyn KvBucket>, BrokerError>;
}
