//! The worker directory.
//!
//! Workers self-register with a TTL and refresh it by heartbeat; an
//! entry whose heartbeat lapses is treated as absent. The engine only
//! observes the directory, it never allocates addresses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use conveyor_core::Result;

use crate::worker::Worker;

/// Read side of the registry, as consumed by the pool. Implementations
/// must re-read live state per call; the pool does not cache.
#[async_trait]
pub trait WorkerDirectory: Send + Sync {
    async fn running_workers(&self) -> Result<Vec<Worker>>;

    async fn worker(&self, addr: &str) -> Result<Option<Worker>>;
}

struct Entry {
    worker: Worker,
    expires_at: Instant,
}

/// In-process directory with TTL expiry.
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers) a worker for `ttl`.
    pub fn register(&self, worker: Worker, ttl: Duration) {
        info!(worker = %worker.addr(), ttl = ?ttl, "worker registered");
        self.entries.lock().insert(
            worker.addr().to_string(),
            Entry {
                worker,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Refreshes a worker's TTL, updating its container count if the
    /// heartbeat reports one. Returns false for unknown or expired
    /// workers, which must re-register.
    pub fn heartbeat(&self, addr: &str, ttl: Duration, active_containers: Option<usize>) -> bool {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get_mut(addr) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + ttl;
                if let Some(count) = active_containers {
                    let mut info = entry.worker.info().clone();
                    info.active_containers = count;
                    entry.worker =
                        Worker::new(info, entry.worker.runtime(), entry.worker.volume_manager());
                }
                true
            }
            _ => {
                debug!(worker = %addr, "heartbeat from unknown or expired worker");
                entries.remove(addr);
                false
            }
        }
    }
}

#[async_trait]
impl WorkerDirectory for InMemoryDirectory {
    async fn running_workers(&self) -> Result<Vec<Worker>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        let mut workers: Vec<Worker> = entries.values().map(|e| e.worker.clone()).collect();
        workers.sort_by(|a, b| a.addr().cmp(b.addr()));
        Ok(workers)
    }

    async fn worker(&self, addr: &str) -> Result<Option<Worker>> {
        let now = Instant::now();
        let entries = self.entries.lock();
        Ok(entries
            .get(addr)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.worker.clone()))
    }
}

/// Convenience for wiring a directory behind the trait object the pool
/// wants.
pub fn shared(directory: InMemoryDirectory) -> Arc<dyn WorkerDirectory> {
    Arc::new(directory)
}
