//! The per-build source repository.
//!
//! Producer steps register artifact sources by name; consumer steps look
//! them up. Scoped to one build execution; there is no cross-build
//! sharing.

use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::RwLock;

use conveyor_core::Result;
use conveyor_worker::{ArtifactDestination, ArtifactSource};

/// Registry mapping artifact names to their sources for one build.
/// Plans are static trees, so two steps registering the same name is a
/// plan-compilation error; within a build the last writer wins.
#[derive(Default)]
pub struct SourceRepository {
    sources: RwLock<BTreeMap<String, ArtifactSource>>,
}

impl SourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, source: ArtifactSource) {
        self.sources.write().insert(name.into(), source);
    }

    pub fn source_for(&self, name: &str) -> Option<ArtifactSource> {
        self.sources.read().get(name).cloned()
    }

    /// Names of all registered sources, in name order.
    pub fn names(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    /// All registered sources with their names, in name order.
    pub fn sources(&self) -> Vec<(String, ArtifactSource)> {
        self.sources
            .read()
            .iter()
            .map(|(name, source)| (name.clone(), source.clone()))
            .collect()
    }

    /// Streams every registered source into the destination, each under
    /// a directory named after its source.
    pub async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<()> {
        for (name, source) in self.sources() {
            let scoped = ScopedDestination {
                inner: destination,
                prefix: name,
            };
            source.stream_to(&scoped).await?;
        }
        Ok(())
    }
}

struct ScopedDestination<'a> {
    inner: &'a dyn ArtifactDestination,
    prefix: String,
}

#[async_trait::async_trait]
impl ArtifactDestination for ScopedDestination<'_> {
    async fn stream_in(&self, dest_path: &str, tar: Bytes) -> Result<()> {
        let path = if dest_path == "." {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, dest_path)
        };
        self.inner.stream_in(&path, tar).await
    }
}
