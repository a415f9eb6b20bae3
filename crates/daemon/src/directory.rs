// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The service map: reloads swap whole snapshots, readers never block.

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use pm3_proxy::{Handler, ServiceDirectory};
use pm3_supervisor::ServiceState;
use std::sync::Arc;

type Snapshot = IndexMap<String, Arc<ServiceState>>;

/// Atomic-pointer snapshot map of live services.
#[derive(Default)]
pub struct ServiceMap {
    inner: ArcSwap<Snapshot>,
}

impl ServiceMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.load_full()
    }

    pub fn install(&self, next: Snapshot) {
        self.inner.store(Arc::new(next));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceState>> {
        self.snapshot().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl ServiceDirectory for ServiceMap {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.get(name).map(|state| state as Arc<dyn Handler>)
    }
}
