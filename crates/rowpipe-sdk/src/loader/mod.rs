//! Loaders decode downloaded artifacts into a stream of [`RowData`]

mod line;
mod object;

pub use line::{GzipLineLoader, LineLoader};
pub use object::{GzipObjectLoader, ObjectLoader};

use crate::artifact::{ArtifactInfo, DownloadedArtifactInfo, RowData};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Decodes one downloaded artifact.
///
/// The loader owns `tx`; the receiving side sees the end of the stream when
/// `load` returns and the sender is dropped. A closed receiver means the
/// consumer stopped early and is not an error.
#[async_trait]
pub trait Loader: Send + Sync {
    fn identifier(&self) -> &str;

    async fn load(
        &self,
        cancel: &CancellationToken,
        info: &DownloadedArtifactInfo,
        tx: Sender<RowData>,
    ) -> anyhow::Result<()>;
}

/// The built-in loaders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    Line,
    GzipLine,
    Object,
    GzipObject,
}

impl LoaderKind {
    /// Pick a loader from the artifact name: `.gz` selects gzip
    pub fn infer(info: &ArtifactInfo, whole_object: bool) -> Self {
        let gzip = info.extension().ends_with("gz");
        match (gzip, whole_object) {
            (false, false) => LoaderKind::Line,
            (true, false) => LoaderKind::GzipLine,
            (false, true) => LoaderKind::Object,
            (true, true) => LoaderKind::GzipObject,
        }
    }

    pub fn identifier(self) -> &'static str {
        match self {
            LoaderKind::Line => LineLoader::IDENTIFIER,
            LoaderKind::GzipLine => GzipLineLoader::IDENTIFIER,
            LoaderKind::Object => ObjectLoader::IDENTIFIER,
            LoaderKind::GzipObject => GzipObjectLoader::IDENTIFIER,
        }
    }

    pub fn build(self) -> Arc<dyn Loader> {
        match self {
            LoaderKind::Line => Arc::new(LineLoader::default()),
            LoaderKind::GzipLine => Arc::new(GzipLineLoader),
            LoaderKind::Object => Arc::new(ObjectLoader),
            LoaderKind::GzipObject => Arc::new(GzipObjectLoader),
        }
    }
}

/// Lazily constructed loaders, one per kind, shareable across runs
#[derive(Default)]
pub struct LoaderCache {
    loaders: RwLock<HashMap<LoaderKind, Arc<dyn Loader>>>,
}

impl LoaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: LoaderKind) -> Arc<dyn Loader> {
        {
            let loaders = self.loaders.read().unwrap_or_else(|e| e.into_inner());
            if let Some(loader) = loaders.get(&kind) {
                return loader.clone();
            }
        }

        let mut loaders = self.loaders.write().unwrap_or_else(|e| e.into_inner());
        // another caller may have built it between the two locks
        loaders
            .entry(kind)
            .or_insert_with(|| {
                debug!(loader = kind.identifier(), "Creating loader");
                kind.build()
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.loaders.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LoaderCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderCache")
            .field("loaders", &self.len())
            .finish()
    }
}

/// Send one row unless cancelled; `false` means stop producing
pub(crate) async fn send_row(tx: &Sender<RowData>, cancel: &CancellationToken, row: RowData) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(row) => sent.is_ok(),
    }
}

/// Decode content as JSON when it parses, otherwise as a string
pub(crate) fn object_value(content: &[u8]) -> serde_json::Value {
    serde_json::from_slice(content)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(content).into_owned()))
}

pub(crate) fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}
