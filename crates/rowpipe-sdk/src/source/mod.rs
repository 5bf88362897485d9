//! Artifact sources enumerate entities and fetch them to local storage

mod file;

pub use file::{FileSourceConfig, FileSystemSource};

use crate::artifact::{ArtifactInfo, DownloadedArtifactInfo};
use crate::pattern::Layout;
use crate::state::{CollectionState, Granularity};
use async_trait::async_trait;
use rowpipe_common::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Handle a source uses to report what it discovers
#[async_trait]
pub trait ArtifactCallbacks: Send + Sync {
    /// Report one candidate artifact.
    ///
    /// Returns once the artifact has been skipped or admitted for download.
    /// An error means admission failed and discovery should stop.
    async fn on_artifact_discovered(&self, info: ArtifactInfo) -> Result<()>;

    /// State of the collection in progress, for pruning while walking
    fn collection_state(&self) -> Arc<dyn CollectionState>;
}

#[async_trait]
pub trait ArtifactSource: Send + Sync {
    fn identifier(&self) -> &str;

    /// Path layout artifact names follow, if the source has one
    fn layout(&self) -> Option<&Layout> {
        None
    }

    /// Finest time unit the source's artifact naming resolves
    fn granularity(&self) -> Option<Granularity> {
        self.layout().and_then(Granularity::from_layout)
    }

    /// Enumerate candidates, calling `callbacks.on_artifact_discovered` for each
    async fn discover_artifacts(
        &self,
        cancel: &CancellationToken,
        callbacks: &dyn ArtifactCallbacks,
    ) -> anyhow::Result<()>;

    /// Make the artifact's content available locally
    async fn download_artifact(
        &self,
        cancel: &CancellationToken,
        info: &ArtifactInfo,
    ) -> anyhow::Result<DownloadedArtifactInfo>;

    /// Release temporary resources
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
