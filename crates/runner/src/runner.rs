// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subject -> handler-pipeline binding with at-least-once delivery.

use bytes::Bytes;
use pm3_broker::{subject, BrokerClient, BrokerError, Msg, KV_RESULTS};
use pm3_core::new_ray_id;
use pm3_manifest::RunnerSpec;
use pm3_proxy::{ClientSession, Exchange, Flow, Pipeline, Scheme};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// In-progress heartbeat cadence while a handler is still working.
const HEARTBEAT_EVERY: Duration = Duration::from_secs(10);
/// Pull-mode fetch wait.
const PULL_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// One live runner.
pub struct MessageRunner {
    spec: RunnerSpec,
    pipeline: Pipeline,
    broker: Arc<dyn BrokerClient>,
    session: Arc<ClientSession>,
    machine_id: String,
    cancel: CancellationToken,
}

impl MessageRunner {
    pub fn new(
        spec: RunnerSpec,
        pipeline: Pipeline,
        broker: Arc<dyn BrokerClient>,
        session: Arc<ClientSession>,
        machine_id: String,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self { spec, pipeline, broker, session, machine_id, cancel })
    }

    pub fn subject(&self) -> &str {
        &self.spec.subject
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Subscribe and consume until cancelled.
    pub fn spawn(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = runner.run().await {
                warn!(subject = %runner.spec.subject, %err, "runner stopped");
            }
        });
    }

    async fn run(self: &Arc<Self>) -> Result<(), RunnerError> {
        let native = subject::native(&self.spec.subject, &self.machine_id);
        let group = subject::queue_group(&self.spec.subject);

        match subject::jet_parts(&native) {
            Some((stream, filter)) if self.spec.rate.is_some() => {
                self.pull_loop(stream, filter, &group).await
            }
            Some((stream, filter)) => self.push_loop(stream, filter, &group).await,
            None => self.core_loop(&native, &group).await,
        }
    }

    /// Durable push consumption.
    async fn push_loop(&self, stream: &str, filter: &str, group: &str) -> Result<(), RunnerError> {
        let filter = if filter.is_empty() {
            String::new()
        } else {
            format!("{}{stream}.{filter}", subject::JET_PREFIX)
        };
        let mut sub = self.broker.consume(stream, &filter, group).await?;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                msg = sub.next() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Rate-limited pull consumption: at most `count` messages per
    /// `period`, sleeping out the window on exhaustion.
    async fn pull_loop(&self, stream: &str, filter: &str, group: &str) -> Result<(), RunnerError> {
        // Presence checked in run().
        let Some(rate) = self.spec.rate.clone() else {
            return Ok(());
        };
        let filter = if filter.is_empty() {
            String::new()
        } else {
            format!("{}{stream}.{filter}", subject::JET_PREFIX)
        };
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let window_started = tokio::time::Instant::now();
            let mut consumed: u64 = 0;
            while consumed < rate.count {
                let budget = (rate.count - consumed) as usize;
                let msgs = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    msgs = self.broker.fetch(stream, &filter, group, budget, PULL_WAIT) => msgs?,
                };
                if msgs.is_empty() {
                    if window_started.elapsed() >= rate.period {
                        break;
                    }
                    continue;
                }
                for msg in msgs {
                    consumed += 1;
                    self.handle(msg).await;
                }
            }
            // Sleep out whatever remains of the window.
            let elapsed = window_started.elapsed();
            if elapsed < rate.period {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(rate.period - elapsed) => {}
                }
            }
        }
    }

    /// Core (non-durable) subscription.
    async fn core_loop(&self, native: &str, group: &str) -> Result<(), RunnerError> {
        let mut sub = self.broker.subscribe(native, Some(group)).await?;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                msg = sub.next() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Process one delivery: synthesize the request, run the pipeline
    /// under a heartbeat, map the status.
    pub async fn handle(&self, msg: Msg) {
        let heartbeat = {
            let cancel = CancellationToken::new();
            let stop = cancel.clone();
            // Extend the ack window while the handler works; stops the
            // moment the handler returns.
            let acker_msg = MsgProgress::from(&msg);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(HEARTBEAT_EVERY);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tick.tick() => acker_msg.in_progress().await,
                    }
                }
            });
            cancel
        };

        let status = self.dispatch(&msg).await;
        heartbeat.cancel();

        let attempt = msg.meta.as_ref().map(|m| m.deliveries).unwrap_or(1);
        match status {
            (code, body) if (200..300).contains(&code) => {
                if self.spec.store_results {
                    self.store_result(&msg, body).await;
                }
                msg.ack().await;
            }
            (code, _) if (400..500).contains(&code) => {
                debug!(subject = %msg.subject, code, "permanent handler failure");
                if self.spec.store_results {
                    let blob = format!("{{\"error\":{code}}}");
                    self.store_result(&msg, Bytes::from(blob)).await;
                }
                msg.term().await;
            }
            (code, _) => {
                if self.spec.retry.retryable(attempt) {
                    debug!(subject = %msg.subject, code, attempt, "transient failure; nak");
                    msg.nak(Some(self.spec.retry.step)).await;
                } else {
                    warn!(subject = %msg.subject, code, attempt, "retry budget exhausted; terminating");
                    msg.term().await;
                }
            }
        }
    }

    /// Run the pipeline over the synthesized request, returning the
    /// buffered status and body.
    async fn dispatch(&self, msg: &Msg) -> (u16, Bytes) {
        let mut cx = match self.synthesize(msg) {
            Ok(cx) => cx,
            Err(err) => {
                warn!(subject = %msg.subject, %err, "unmappable message");
                return (400, Bytes::new());
            }
        };

        match self.pipeline.run(&mut cx).await {
            Ok(Flow::Done) => match cx.response {
                Some(resp) => (resp.status, resp.body),
                None => (204, Bytes::new()),
            },
            Ok(Flow::Continue) => (404, Bytes::new()),
            Ok(Flow::Drop) => (404, Bytes::new()),
            Err(edge) if (200..600).contains(&edge.code) => (edge.code, Bytes::new()),
            Err(_) => (500, Bytes::new()),
        }
    }

    /// Build the HTTP-shaped request for one message.
    fn synthesize(&self, msg: &Msg) -> Result<Exchange, http::Error> {
        let topic = if self.spec.strip_tokens > 0 {
            msg.subject
                .splitn(self.spec.strip_tokens + 1, '.')
                .last()
                .unwrap_or("")
                .to_string()
        } else {
            msg.subject.clone()
        };
        let path = subject::as_path(&topic);
        let uri: http::Uri = http::Uri::builder()
            .scheme("http")
            .authority("worker")
            .path_and_query(path)
            .build()?;

        let method = if msg.payload.is_empty() {
            http::Method::GET
        } else {
            http::Method::POST
        };

        let mut headers = http::HeaderMap::new();
        if let Ok(v) = http::HeaderValue::from_str("worker") {
            headers.insert(http::header::HOST, v);
        }
        for (name, value) in &msg.headers {
            if let (Ok(n), Ok(v)) = (
                http::HeaderName::try_from(name.as_str()),
                http::HeaderValue::from_str(value),
            ) {
                headers.append(n, v);
            }
        }
        if let Some(meta) = &msg.meta {
            let pairs: [(&str, String); 6] = [
                ("p-consumer", meta.consumer.clone()),
                ("p-consumer-seq", meta.consumer_seq.to_string()),
                ("p-stream", meta.stream.clone()),
                ("p-stream-seq", meta.stream_seq.to_string()),
                ("p-attempt", meta.deliveries.to_string()),
                ("p-timestamp", meta.published_ms.to_string()),
            ];
            for (name, value) in pairs {
                if let (Ok(n), Ok(v)) = (
                    http::HeaderName::try_from(name),
                    http::HeaderValue::from_str(&value),
                ) {
                    headers.insert(n, v);
                }
            }
        }

        Ok(Exchange::new(
            method,
            uri,
            headers,
            msg.payload.clone(),
            Scheme::Http,
            Arc::clone(&self.session),
            new_ray_id(),
        ))
    }

    async fn store_result(&self, msg: &Msg, body: Bytes) {
        let Some(meta) = &msg.meta else { return };
        let key = format!("{}-{}", meta.stream, meta.stream_seq);
        match self.broker.kv(KV_RESULTS).await {
            Ok(kv) => {
                if let Err(err) = kv.put(&key, body).await {
                    warn!(%err, key, "failed to store runner result");
                }
            }
            Err(err) => warn!(%err, "results bucket unavailable"),
        }
    }
}

/// The slice of a message the heartbeat task needs. `Msg` itself is not
/// `Clone`; the ack handle is.
struct MsgProgress {
    acker: Option<Arc<dyn pm3_broker::AckHandle>>,
}

impl MsgProgress {
    async fn in_progress(&self) {
        if let Some(acker) = &self.acker {
            acker.in_progress().await;
        }
    }
}

impl From<&Msg> for MsgProgress {
    fn from(msg: &Msg) -> Self {
        Self { acker: msg.ack_handle() }
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
