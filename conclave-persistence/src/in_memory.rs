use async_trait::async_trait;
use conclave_core::store::{CoordinationStore, PersistedCoordinationState};
use conclave_core::{ClusterState, ConclaveError, Result, Term};
use parking_lot::RwLock;
use std::sync::Arc;

struct Inner {
    record: Option<PersistedCoordinationState>,
    fail_writes: bool,
}

/// In-memory coordination store.
///
/// Holds the `(current_term, last_accepted)` record in process memory, so it
/// provides the store ordering guarantees without surviving restarts. Meant
/// for tests and single-process experiments.
///
/// Writes can be made to fail on demand, which tests use to drive the
/// engine's storage-failure handling.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                record: None,
                fail_writes: false,
            })),
        }
    }

    /// Make every subsequent write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.write().fail_writes = fail;
    }

    fn check_writable(&self) -> Result<()> {
        if self.inner.read().fail_writes {
            return Err(ConclaveError::durability("injected write failure"));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn load(&self) -> Result<Option<PersistedCoordinationState>> {
        Ok(self.inner.read().record.clone())
    }

    async fn store_term(&self, term: Term) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let record = inner.record.get_or_insert_with(PersistedCoordinationState::default);
        record.current_term = term;
        Ok(())
    }

    async fn store_accepted_state(&self, state: &ClusterState) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let record = inner.record.get_or_insert_with(PersistedCoordinationState::default);
        record.last_accepted = Some(state.clone());
        Ok(())
    }
}
