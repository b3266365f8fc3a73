//! Volumes and the per-worker volume manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use conveyor_core::Result;

/// Parameters for a new volume.
#[derive(Debug, Clone, Default)]
pub struct VolumeSpec {
    pub privileged: bool,
    /// Bootstrap TTL; refreshed while the client holds a reference and
    /// replaced when ownership transfers to a container.
    pub ttl: Option<Duration>,
    pub properties: HashMap<String, String>,
}

/// Per-worker volume allocator.
///
/// Volumes are reference-counted from the client side: `hold` bumps the
/// count, `release` drops it and optionally rewrites the TTL. Dropping to
/// zero never deletes anything; the worker reaps expired volumes on its
/// own schedule.
#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Allocates a volume and returns its handle, held once on behalf of
    /// the caller.
    async fn create(&self, spec: VolumeSpec) -> Result<String>;

    /// Whether the handle names a volume on this worker.
    async fn lookup(&self, handle: &str) -> Result<bool>;

    async fn hold(&self, handle: &str) -> Result<()>;

    async fn release(&self, handle: &str, ttl: Option<Duration>) -> Result<()>;
}

/// Client-side handle to a volume on a specific worker.
#[derive(Clone)]
pub struct Volume {
    handle: String,
    worker_addr: String,
    manager: Arc<dyn VolumeManager>,
}

impl Volume {
    pub fn new(
        handle: impl Into<String>,
        worker_addr: impl Into<String>,
        manager: Arc<dyn VolumeManager>,
    ) -> Self {
        Self {
            handle: handle.into(),
            worker_addr: worker_addr.into(),
            manager,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn worker_addr(&self) -> &str {
        &self.worker_addr
    }

    pub async fn hold(&self) -> Result<()> {
        self.manager.hold(&self.handle).await
    }

    /// Drops this reference. Passing a TTL rewrites the volume's expiry,
    /// used when ownership transfers to a container.
    pub async fn release(&self, ttl: Option<Duration>) -> Result<()> {
        self.manager.release(&self.handle, ttl).await
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("handle", &self.handle)
            .field("worker_addr", &self.worker_addr)
            .finish()
    }
}
