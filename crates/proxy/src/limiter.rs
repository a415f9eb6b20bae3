// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rate enforcement against a client session.
//!
//! Fixed window per limit spec, advanced by CAS on the session's bucket.
//! Local sessions are exempt.

use crate::session::ClientSession;
use pm3_core::RateLimit;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// What the enforcer decided for this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitOutcome {
    Allow,
    /// Over the limit: answer 429 with this Retry-After.
    Throttle { retry_after: Duration },
    /// Over the limit with a block configured: the session is now blocked.
    Block { until_ms: u64 },
}

/// Enforce `limit` for one request at `now_ms`.
pub fn enforce(session: &ClientSession, limit: &RateLimit, now_ms: u64) -> LimitOutcome {
    if session.local {
        return LimitOutcome::Allow;
    }

    let key = limit.to_string();
    let bucket = session
        .buckets
        .entry(key)
        .or_insert_with(|| Arc::new(crate::session::RateBucket::default()))
        .clone();

    let period_ms = limit.period.as_millis() as u64;
    loop {
        let start = bucket.window_start.load(Ordering::Relaxed);
        if now_ms.saturating_sub(start) >= period_ms {
            // Window expired; one winner rolls it over.
            if bucket
                .window_start
                .compare_exchange(start, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                bucket.count.store(1, Ordering::Relaxed);
                return LimitOutcome::Allow;
            }
            continue;
        }

        let seen = bucket.count.fetch_add(1, Ordering::Relaxed) + 1;
        if seen <= limit.count {
            return LimitOutcome::Allow;
        }

        return match limit.block {
            Some(block) => {
                session.block_for(block, now_ms);
                LimitOutcome::Block { until_ms: now_ms + block.as_millis() as u64 }
            }
            None => {
                let elapsed = now_ms.saturating_sub(start);
                let retry_after = Duration::from_millis(period_ms.saturating_sub(elapsed).max(1));
                LimitOutcome::Throttle { retry_after }
            }
        };
    }
}

#[cfg(test)]
#[path = "limiter_tests.rs"]
mod tests;
