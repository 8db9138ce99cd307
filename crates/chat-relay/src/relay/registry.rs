//! Cancellation registry: request id → cancellation signal.
//!
//! One [`CancellationRegistry`] is shared (cheaply cloned) between the relay
//! and whoever calls [`cancel`](CancellationRegistry::cancel). The table is
//! guarded by a mutex; signals themselves are lock-free once handed out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Single-writer, many-reader cancellation flag with an async wait.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal(CancellationToken);

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Idempotent.
    pub fn set(&self) {
        self.0.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolve once the flag is raised (immediately if it already is).
    pub async fn wait(&self) {
        self.0.cancelled().await;
    }
}

#[derive(Debug)]
struct Entry {
    signal: CancellationSignal,
    generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

/// Process-wide table of in-flight request ids and their signals.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<Inner>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a fresh signal for `id`, replacing any existing entry.
    pub fn register(&self, id: &str) -> CancellationSignal {
        self.insert(id).0
    }

    fn insert(&self, id: &str) -> (CancellationSignal, u64) {
        let signal = CancellationSignal::new();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.entries().insert(
            id.to_string(),
            Entry {
                signal: signal.clone(),
                generation,
            },
        );
        if previous.is_some() {
            debug!("Replaced lingering cancellation registration: request_id={id}");
        }
        (signal, generation)
    }

    /// Register `id` and return a guard that releases it when dropped.
    ///
    /// The guard only removes the entry it created: if the id was
    /// re-registered in the meantime, the newer entry survives.
    pub fn register_scoped(&self, id: &str) -> Registration {
        let (signal, generation) = self.insert(id);
        Registration {
            registry: self.clone(),
            id: id.to_string(),
            signal,
            generation,
        }
    }

    /// Raise the signal for `id`. Returns whether an active registration was found.
    pub fn cancel(&self, id: &str) -> bool {
        match self.entries().get(id) {
            Some(entry) => {
                entry.signal.set();
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `id`. No-op if absent.
    pub fn release(&self, id: &str) {
        self.entries().remove(id);
    }

    fn release_generation(&self, id: &str, generation: u64) {
        let mut entries = self.entries();
        if entries.get(id).is_some_and(|e| e.generation == generation) {
            entries.remove(id);
        }
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    /// Number of active registrations.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scoped registration. Dropping it releases the registry entry exactly once.
#[derive(Debug)]
pub struct Registration {
    registry: CancellationRegistry,
    id: String,
    signal: CancellationSignal,
    generation: u64,
}

impl Registration {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn signal(&self) -> &CancellationSignal {
        &self.signal
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release_generation(&self.id, self.generation);
        debug!("Released cancellation registration: request_id={}", self.id);
    }
}

/// Generate a unique request id for callers that do not bring their own.
pub fn generate_request_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Counter disambiguates calls within the same clock tick.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("rq-{ts:x}-{count:04x}")
}
