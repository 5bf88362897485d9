use super::{ArtifactCallbacks, ArtifactSource};
use crate::artifact::{ArtifactInfo, DownloadedArtifactInfo};
use crate::filter::Filter;
use crate::pattern::Layout;
use anyhow::Context;
use async_trait::async_trait;
use rowpipe_common::types::{CommonFields, SourceEnrichment};
use rowpipe_common::{Result, SdkError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Configuration for collecting files from local directories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSourceConfig {
    /// Directories to walk
    pub paths: Vec<PathBuf>,
    /// Layout of file paths relative to each root, e.g.
    /// `%{YEAR:year}/%{MONTHNUM:month}/%{DATA:name}.log`
    #[serde(default)]
    pub file_layout: Option<String>,
    /// Filter expressions over the layout fields; all must match
    #[serde(default)]
    pub filters: Vec<String>,
    /// Accepted file extensions, without the leading dot; empty accepts all
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl FileSourceConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            paths: vec![path.into()],
            file_layout: None,
            filters: Vec::new(),
            extensions: Vec::new(),
        }
    }

    pub fn layout(mut self, layout: impl Into<String>) -> Self {
        self.file_layout = Some(layout.into());
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    pub fn extension(mut self, ext: impl Into<String>) -> Self {
        self.extensions.push(ext.into());
        self
    }
}

/// Discovers files below one or more local directories.
///
/// Directories are visited in name order. When a layout is configured, a
/// directory is only entered if its path can still match the layout, the
/// filters, and the collection state.
#[derive(Debug)]
pub struct FileSystemSource {
    config: FileSourceConfig,
    layout: Option<Layout>,
    filters: Vec<Filter>,
}

impl FileSystemSource {
    pub const IDENTIFIER: &'static str = "file";

    pub fn new(config: FileSourceConfig) -> Result<Self> {
        if config.paths.is_empty() {
            return Err(SdkError::config("file source needs at least one path"));
        }
        let layout = config.file_layout.as_deref().map(Layout::parse).transpose()?;
        let filters = config
            .filters
            .iter()
            .map(|f| Filter::parse(f))
            .collect::<Result<Vec<_>>>()?;
        if layout.is_none() && !filters.is_empty() {
            return Err(SdkError::config("filters require a file_layout"));
        }
        Ok(Self {
            config,
            layout,
            filters,
        })
    }

    fn accepts_extension(&self, path: &Path) -> bool {
        if self.config.extensions.is_empty() {
            return true;
        }
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        self.config.extensions.iter().any(|ext| {
            let ext = ext.trim_start_matches('.');
            name.to_lowercase().ends_with(&format!(".{}", ext.to_lowercase()))
        })
    }

    /// Properties of a file, or `None` if it is not an artifact
    fn match_file(&self, relative: &str) -> Option<HashMap<String, String>> {
        let Some(layout) = &self.layout else {
            return Some(HashMap::new());
        };
        let properties = layout.match_path(relative)?;
        self.filters
            .iter()
            .all(|f| f.matches(&properties))
            .then_some(properties)
    }

    fn enrichment(&self, root: &Path, path: &Path) -> SourceEnrichment {
        SourceEnrichment::new(CommonFields {
            tp_source_type: Self::IDENTIFIER.to_string(),
            tp_source_name: Some(root.display().to_string()),
            tp_source_location: Some(path.display().to_string()),
            ..Default::default()
        })
    }

    async fn walk(
        &self,
        root: &Path,
        cancel: &CancellationToken,
        callbacks: &dyn ArtifactCallbacks,
    ) -> anyhow::Result<usize> {
        let state = callbacks.collection_state();
        let mut pending = vec![(root.to_path_buf(), String::new())];
        let mut discovered = 0;

        while let Some((dir, relative)) = pending.pop() {
            let mut entries = Vec::new();
            let mut reader = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("Failed to read directory {}", dir.display()))?;
            while let Some(entry) = reader.next_entry().await? {
                let file_type = entry.file_type().await?;
                entries.push((entry.file_name().to_string_lossy().into_owned(), entry.path(), file_type));
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut subdirs = Vec::new();
            for (name, path, file_type) in entries {
                if cancel.is_cancelled() {
                    return Err(SdkError::Cancelled.into());
                }
                let child = if relative.is_empty() {
                    name
                } else {
                    format!("{relative}/{name}")
                };

                if file_type.is_dir() {
                    if let Some(layout) = &self.layout {
                        let Some(properties) = layout.match_prefix(&child) else {
                            trace!(dir = %child, "Directory outside layout");
                            continue;
                        };
                        state.register_path(&child, &properties);
                        if !self.filters.iter().all(|f| f.may_match(&properties)) {
                            debug!(dir = %child, "Directory excluded by filter");
                            continue;
                        }
                        if !state.should_traverse(&child) {
                            debug!(dir = %child, "Directory already collected");
                            continue;
                        }
                    }
                    subdirs.push((path, child));
                } else if file_type.is_file() {
                    if !self.accepts_extension(&path) {
                        continue;
                    }
                    let Some(properties) = self.match_file(&child) else {
                        trace!(file = %child, "File does not match layout or filters");
                        continue;
                    };

                    let mut info = ArtifactInfo::new(path.display().to_string())
                        .with_enrichment(self.enrichment(root, &path))
                        .with_properties(properties);
                    info.original_name = child;
                    callbacks.on_artifact_discovered(info).await?;
                    discovered += 1;
                }
            }

            // pop order visits subdirectories by name
            pending.extend(subdirs.into_iter().rev());
        }

        Ok(discovered)
    }
}

#[async_trait]
impl ArtifactSource for FileSystemSource {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    async fn discover_artifacts(
        &self,
        cancel: &CancellationToken,
        callbacks: &dyn ArtifactCallbacks,
    ) -> anyhow::Result<()> {
        for root in &self.config.paths {
            let discovered = self.walk(root, cancel, callbacks).await?;
            info!(root = %root.display(), discovered, "Discovered files");
        }
        Ok(())
    }

    async fn download_artifact(
        &self,
        _cancel: &CancellationToken,
        info: &ArtifactInfo,
    ) -> anyhow::Result<DownloadedArtifactInfo> {
        let path = PathBuf::from(&info.name);
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        Ok(DownloadedArtifactInfo::new(info.clone(), path, metadata.len()))
    }
}
