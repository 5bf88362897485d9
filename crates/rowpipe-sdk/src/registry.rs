//! Named constructors for runtime-selected plugins
//!
//! Hosts pick sources, tables, loaders and mappers by identifier from
//! configuration. Nothing registers itself: a registry starts empty (or with
//! the built-ins via [`PluginRegistry::with_defaults`]) and every plugin is
//! added explicitly.

use crate::collector::Collector;
use crate::config::CollectorConfig;
use crate::loader::{GzipLineLoader, GzipObjectLoader, LineLoader, Loader, ObjectLoader};
use crate::mapper::{JsonMapper, Mapper, PatternMapper};
use crate::source::{ArtifactSource, FileSourceConfig, FileSystemSource};
use crate::table::{DynamicTable, DynamicTableConfig, Table};
use rowpipe_common::{Result, SdkError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type Factory<T> = Arc<dyn Fn(&Value) -> Result<Arc<T>> + Send + Sync>;

/// A plugin selected by identifier, with its own configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(default)]
    pub config: Value,
}

impl PluginConfig {
    pub fn new(plugin_type: impl Into<String>, config: Value) -> Self {
        Self {
            plugin_type: plugin_type.into(),
            config,
        }
    }
}

/// Everything needed to collect one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub partition: String,
    pub table: PluginConfig,
    pub source: PluginConfig,
    #[serde(default)]
    pub loader: Option<PluginConfig>,
    #[serde(default)]
    pub mappers: Vec<PluginConfig>,
    #[serde(default)]
    pub collector: CollectorConfig,
}

#[derive(Default)]
pub struct PluginRegistry {
    sources: HashMap<String, Factory<dyn ArtifactSource>>,
    tables: HashMap<String, Factory<dyn Table>>,
    loaders: HashMap<String, Factory<dyn Loader>>,
    mappers: HashMap<String, Factory<dyn Mapper>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in file source, dynamic table, loaders and mappers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let builtins = [
            registry.register_source(FileSystemSource::IDENTIFIER, |config| {
                let config: FileSourceConfig = parse_config("source", config)?;
                Ok(Arc::new(FileSystemSource::new(config)?) as Arc<dyn ArtifactSource>)
            }),
            registry.register_table("dynamic", |config| {
                let config: DynamicTableConfig = parse_config("table", config)?;
                Ok(Arc::new(DynamicTable::new(config)?) as Arc<dyn Table>)
            }),
            registry.register_loader(LineLoader::IDENTIFIER, |_| {
                Ok(Arc::new(LineLoader::default()) as Arc<dyn Loader>)
            }),
            registry.register_loader(GzipLineLoader::IDENTIFIER, |_| {
                Ok(Arc::new(GzipLineLoader) as Arc<dyn Loader>)
            }),
            registry.register_loader(ObjectLoader::IDENTIFIER, |_| {
                Ok(Arc::new(ObjectLoader) as Arc<dyn Loader>)
            }),
            registry.register_loader(GzipObjectLoader::IDENTIFIER, |_| {
                Ok(Arc::new(GzipObjectLoader) as Arc<dyn Loader>)
            }),
            registry.register_mapper(JsonMapper::IDENTIFIER, |_| {
                Ok(Arc::new(JsonMapper) as Arc<dyn Mapper>)
            }),
            registry.register_mapper(PatternMapper::IDENTIFIER, |config| {
                let config: PatternMapperConfig = parse_config("mapper", config)?;
                Ok(Arc::new(PatternMapper::new(&config.pattern)?) as Arc<dyn Mapper>)
            }),
        ];
        debug!(plugins = builtins.len(), "Registered built-in plugins");
        registry
    }

    pub fn register_source<F>(&mut self, identifier: &str, factory: F) -> Result<()>
    where
        F: Fn(&Value) -> Result<Arc<dyn ArtifactSource>> + Send + Sync + 'static,
    {
        insert(&mut self.sources, "source", identifier, Arc::new(factory))
    }

    pub fn register_table<F>(&mut self, identifier: &str, factory: F) -> Result<()>
    where
        F: Fn(&Value) -> Result<Arc<dyn Table>> + Send + Sync + 'static,
    {
        insert(&mut self.tables, "table", identifier, Arc::new(factory))
    }

    pub fn register_loader<F>(&mut self, identifier: &str, factory: F) -> Result<()>
    where
        F: Fn(&Value) -> Result<Arc<dyn Loader>> + Send + Sync + 'static,
    {
        insert(&mut self.loaders, "loader", identifier, Arc::new(factory))
    }

    pub fn register_mapper<F>(&mut self, identifier: &str, factory: F) -> Result<()>
    where
        F: Fn(&Value) -> Result<Arc<dyn Mapper>> + Send + Sync + 'static,
    {
        insert(&mut self.mappers, "mapper", identifier, Arc::new(factory))
    }

    pub fn source(&self, identifier: &str, config: &Value) -> Result<Arc<dyn ArtifactSource>> {
        create(&self.sources, "source", identifier, config)
    }

    pub fn table(&self, identifier: &str, config: &Value) -> Result<Arc<dyn Table>> {
        create(&self.tables, "table", identifier, config)
    }

    pub fn loader(&self, identifier: &str, config: &Value) -> Result<Arc<dyn Loader>> {
        create(&self.loaders, "loader", identifier, config)
    }

    pub fn mapper(&self, identifier: &str, config: &Value) -> Result<Arc<dyn Mapper>> {
        create(&self.mappers, "mapper", identifier, config)
    }

    pub fn source_identifiers(&self) -> Vec<String> {
        sorted_keys(&self.sources)
    }

    pub fn table_identifiers(&self) -> Vec<String> {
        sorted_keys(&self.tables)
    }

    /// Resolve every plugin named in `config` and build its collector.
    ///
    /// All configuration errors surface here, before any collection starts.
    pub async fn collector(&self, config: &PartitionConfig) -> Result<Collector> {
        let table = self.table(&config.table.plugin_type, &config.table.config)?;
        let source = self.source(&config.source.plugin_type, &config.source.config)?;

        let mut builder = Collector::builder(table, source)
            .partition(config.partition.clone())
            .config(config.collector.clone());
        if let Some(loader) = &config.loader {
            builder = builder.loader(self.loader(&loader.plugin_type, &loader.config)?);
        }
        for mapper in &config.mappers {
            builder = builder.mapper(self.mapper(&mapper.plugin_type, &mapper.config)?);
        }
        builder.build().await
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("sources", &sorted_keys(&self.sources))
            .field("tables", &sorted_keys(&self.tables))
            .field("loaders", &sorted_keys(&self.loaders))
            .field("mappers", &sorted_keys(&self.mappers))
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct PatternMapperConfig {
    pattern: String,
}

fn parse_config<T: DeserializeOwned>(kind: &str, config: &Value) -> Result<T> {
    serde_json::from_value(config.clone())
        .map_err(|e| SdkError::config(format!("invalid {kind} config: {e}")))
}

fn insert<T: ?Sized>(
    map: &mut HashMap<String, Factory<T>>,
    kind: &'static str,
    identifier: &str,
    factory: Factory<T>,
) -> Result<()> {
    if map.contains_key(identifier) {
        return Err(SdkError::DuplicateIdentifier {
            kind,
            identifier: identifier.to_string(),
        });
    }
    map.insert(identifier.to_string(), factory);
    Ok(())
}

fn create<T: ?Sized>(
    map: &HashMap<String, Factory<T>>,
    kind: &'static str,
    identifier: &str,
    config: &Value,
) -> Result<Arc<T>> {
    let factory = map.get(identifier).ok_or_else(|| SdkError::UnknownIdentifier {
        kind,
        identifier: identifier.to_string(),
    })?;
    factory(config)
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<_> = map.keys().cloned().collect();
    keys.sort();
    keys
}
