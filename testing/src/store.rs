//! In-memory request store for fast, deterministic tests.

use settlement_core::{Request, RequestId, RequestStatus, RequestStore, StoreError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct StoreState {
    requests: HashMap<RequestId, Request>,
    failing_creates: u32,
    failing_saves: u32,
    bind_delay: Option<Duration>,
    creates: usize,
    saves: usize,
}

/// `HashMap`-backed [`RequestStore`] with injectable write failures.
///
/// Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRequestStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryRequestStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls to `create` fail with a database error.
    pub fn fail_creates(&self, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_creates = times;
        }
    }

    /// Make the next `times` calls to `save` fail with a database error.
    pub fn fail_saves(&self, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_saves = times;
        }
    }

    /// Hold every write that binds a run (status `started`) for `delay`
    /// before applying it.
    pub fn delay_binds(&self, delay: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.bind_delay = Some(delay);
        }
    }

    /// Snapshot of a stored request.
    #[must_use]
    pub fn get(&self, id: RequestId) -> Option<Request> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.requests.get(&id).cloned())
    }

    /// Number of stored requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.requests.len()).unwrap_or(0)
    }

    /// Whether nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful `save` calls so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.state.lock().map(|state| state.saves).unwrap_or(0)
    }

    /// Successful `create` calls so far.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.state.lock().map(|state| state.creates).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Database("request store lock poisoned".to_string()))
    }

    async fn write(
        &self,
        request: Request,
        expected: Option<RequestStatus>,
    ) -> Result<(), StoreError> {
        if request.status == RequestStatus::Started {
            let delay = self.lock()?.bind_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        let mut state = self.lock()?;
        if state.failing_saves > 0 {
            state.failing_saves -= 1;
            return Err(StoreError::Database("injected save failure".to_string()));
        }
        let stored = state
            .requests
            .get_mut(&request.id)
            .ok_or(StoreError::NotFound(request.id))?;
        if let Some(expected) = expected {
            if stored.status != expected {
                return Err(StoreError::ConcurrencyConflict {
                    id: request.id,
                    expected,
                    actual: stored.status,
                });
            }
        }
        stored.status = request.status;
        stored.run_id = request.run_id;
        state.saves += 1;
        Ok(())
    }
}

impl RequestStore for InMemoryRequestStore {
    fn create(
        &self,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.lock()?;
            if state.failing_creates > 0 {
                state.failing_creates -= 1;
                return Err(StoreError::Database("injected create failure".to_string()));
            }
            if state.requests.contains_key(&request.id) {
                return Err(StoreError::Duplicate(request.id));
            }
            state.requests.insert(request.id, request);
            state.creates += 1;
            Ok(())
        })
    }

    fn find_by_id(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Request, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.lock()?
                .requests
                .get(&id)
                .cloned()
                .ok_or(StoreError::NotFound(id))
        })
    }

    fn save(
        &self,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(self.write(request, None))
    }

    fn save_if(
        &self,
        request: Request,
        expected: RequestStatus,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(self.write(request, Some(expected)))
    }
}
