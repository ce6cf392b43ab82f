use std::sync::Arc;

use anyhow::Result;

use super::credentials::{CredentialPool, CredentialStats};
use super::store::{JobStore, QueueCounts};

/// Read-only views over the queue and the credential ledger. Nothing here
/// claims jobs or reserves credentials.
#[derive(Clone)]
pub(crate) struct Monitor {
    store: Arc<dyn JobStore>,
    pool: CredentialPool,
}

impl Monitor {
    pub(crate) fn new(store: Arc<dyn JobStore>, pool: CredentialPool) -> Self {
        Self { store, pool }
    }

    pub(crate) async fn queue_stats(&self) -> Result<QueueCounts> {
        self.store.counts().await
    }

    pub(crate) async fn credential_stats(&self) -> Result<Vec<CredentialStats>> {
        self.pool.stats().await
    }
}
