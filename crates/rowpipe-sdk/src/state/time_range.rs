use super::{time_bounds, CollectionState, Granularity};
use crate::artifact::ArtifactInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rowpipe_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Collected span of one trunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time: Option<DateTime<Utc>>,
    /// Objects collected in the granule starting at `start_time`
    #[serde(default)]
    start_objects: BTreeSet<String>,
    /// Objects collected in the granule starting at `end_time`
    #[serde(default)]
    end_objects: BTreeSet<String>,
    /// Objects without a timestamp, tracked by name
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    untimed_objects: BTreeSet<String>,
}

impl TimeRange {
    fn should_collect(&self, name: &str, granule: Option<DateTime<Utc>>) -> bool {
        let Some(granule) = granule else {
            return !self.untimed_objects.contains(name);
        };
        let (Some(start), Some(end)) = (self.start_time, self.end_time) else {
            return true;
        };
        if granule < start || granule > end {
            return true;
        }
        if granule == start && !self.start_objects.contains(name) {
            return true;
        }
        if granule == end && !self.end_objects.contains(name) {
            return true;
        }
        false
    }

    fn add(&mut self, name: String, granule: Option<DateTime<Utc>>) {
        let Some(granule) = granule else {
            self.untimed_objects.insert(name);
            return;
        };
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                if granule < start {
                    self.start_time = Some(granule);
                    self.start_objects = BTreeSet::from([name.clone()]);
                } else if granule == start {
                    self.start_objects.insert(name.clone());
                }
                if granule > end {
                    self.end_time = Some(granule);
                    self.end_objects = BTreeSet::from([name]);
                } else if granule == end {
                    self.end_objects.insert(name);
                }
            }
            _ => {
                self.start_time = Some(granule);
                self.end_time = Some(granule);
                self.start_objects = BTreeSet::from([name.clone()]);
                self.end_objects = BTreeSet::from([name]);
            }
        }
    }
}

/// Persisted form: one range per trunk key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    trunks: BTreeMap<String, TimeRange>,
}

#[derive(Debug, Default)]
struct Inner {
    file: StateFile,
    directories: HashMap<String, HashMap<String, String>>,
    dirty: bool,
}

/// Collection state that tracks the span of granules collected so far.
///
/// Artifacts are grouped into trunks by the values of the trunk fields (the
/// layout fields in front of the first time field, see
/// [`Layout::trunk_fields`](crate::pattern::Layout::trunk_fields)). Each trunk
/// keeps its own range: every granule strictly between its start and end
/// granules is considered collected, and the names collected inside the two
/// boundary granules are remembered individually.
#[derive(Debug)]
pub struct TimeRangeCollectionState {
    granularity: Option<Granularity>,
    trunk_fields: Vec<String>,
    from: Option<DateTime<Utc>>,
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl TimeRangeCollectionState {
    /// In-memory state; `save` is a no-op
    pub fn new(granularity: Option<Granularity>) -> Self {
        Self {
            granularity,
            trunk_fields: Vec::new(),
            from: None,
            path: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Load state persisted at `path`, starting empty if the file does not exist
    pub async fn load(path: impl Into<PathBuf>, granularity: Option<Granularity>) -> Result<Self> {
        let path = path.into();
        let file: StateFile = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateFile::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), trunks = file.trunks.len(), "Loaded collection state");

        Ok(Self {
            granularity,
            trunk_fields: Vec::new(),
            from: None,
            path: Some(path),
            inner: Mutex::new(Inner {
                file,
                ..Default::default()
            }),
        })
    }

    /// Fields whose values separate independent timelines
    pub fn with_trunk_fields(mut self, fields: Vec<String>) -> Self {
        self.trunk_fields = fields;
        self
    }

    /// Ignore artifacts older than `from`
    pub fn with_from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Collected `(start, end)` granules of the trunk `properties` belong to
    pub fn time_range(&self, properties: &HashMap<String, String>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let key = self.trunk_key(properties);
        let inner = self.lock();
        let range = inner.file.trunks.get(&key)?;
        Some((range.start_time?, range.end_time?))
    }

    /// Keys of every trunk seen so far
    pub fn trunks(&self) -> Vec<String> {
        self.lock().file.trunks.keys().cloned().collect()
    }

    fn trunk_key(&self, properties: &HashMap<String, String>) -> String {
        self.trunk_fields
            .iter()
            .map(|f| format!("{}={}", f, properties.get(f).map(String::as_str).unwrap_or_default()))
            .collect::<Vec<_>>()
            .join("/")
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn granule(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.granularity.unwrap_or(Granularity::Second).truncate(ts)
    }
}

#[async_trait]
impl CollectionState for TimeRangeCollectionState {
    fn granularity(&self) -> Option<Granularity> {
        self.granularity
    }

    fn should_collect(&self, info: &ArtifactInfo) -> bool {
        if let (Some(ts), Some(from)) = (info.timestamp, self.from) {
            if ts < from {
                return false;
            }
        }
        let key = self.trunk_key(&info.properties);
        let granule = info.timestamp.map(|ts| self.granule(ts));
        let inner = self.lock();
        match inner.file.trunks.get(&key) {
            Some(range) => range.should_collect(&info.name, granule),
            None => true,
        }
    }

    fn on_collected(&self, info: &ArtifactInfo) -> Result<()> {
        let key = self.trunk_key(&info.properties);
        let granule = info.timestamp.map(|ts| self.granule(ts));
        let mut inner = self.lock();
        inner.dirty = true;
        inner
            .file
            .trunks
            .entry(key)
            .or_default()
            .add(info.name.clone(), granule);
        Ok(())
    }

    fn register_path(&self, path: &str, metadata: &HashMap<String, String>) {
        self.lock()
            .directories
            .insert(path.to_string(), metadata.clone());
    }

    fn should_traverse(&self, path: &str) -> bool {
        let inner = self.lock();
        let Some(metadata) = inner.directories.get(path) else {
            return true;
        };
        let Some((dir_start, dir_end)) = time_bounds(metadata) else {
            return true;
        };
        if self.from.is_some_and(|from| dir_end <= from) {
            return false;
        }

        // skip directories whose granules all lie strictly inside their trunk's range
        let Some(range) = inner.file.trunks.get(&self.trunk_key(metadata)) else {
            return true;
        };
        let (Some(start), Some(end)) = (range.start_time, range.end_time) else {
            return true;
        };
        let last = dir_end - chrono::TimeDelta::nanoseconds(1);
        !(dir_start > start && self.granule(last) < end)
    }

    async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = {
            let mut inner = self.lock();
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            serde_json::to_vec_pretty(&inner.file)?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;

        info!(path = %path.display(), bytes = bytes.len(), "Saved collection state");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn artifact(name: &str, day: u32) -> ArtifactInfo {
        let mut info = ArtifactInfo::new(name);
        info.timestamp = Some(Utc.with_ymd_and_hms(2024, 6, day, 12, 0, 0).unwrap());
        info
    }

    fn org_artifact(org: &str, name: &str, month: u32) -> ArtifactInfo {
        let mut info = ArtifactInfo::new(name);
        info.properties = props(&[("org", org)]);
        info.timestamp = Some(Utc.with_ymd_and_hms(2024, month, 1, 0, 0, 0).unwrap());
        info
    }

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_should_collect_is_idempotent_until_collected() {
        let state = TimeRangeCollectionState::new(Some(Granularity::Day));
        let info = artifact("a.log", 1);
        assert!(state.should_collect(&info));
        assert!(state.should_collect(&info));
        state.on_collected(&info).unwrap();
        assert!(!state.should_collect(&info));
        assert!(!state.should_collect(&info));
    }

    #[test]
    fn test_boundary_granules_track_names() {
        let state = TimeRangeCollectionState::new(Some(Granularity::Day));
        state.on_collected(&artifact("d1-a.log", 1)).unwrap();
        state.on_collected(&artifact("d3-a.log", 3)).unwrap();

        // interior granule counts as collected
        assert!(!state.should_collect(&artifact("d2-x.log", 2)));
        // same boundary granule, different object
        assert!(state.should_collect(&artifact("d1-b.log", 1)));
        assert!(state.should_collect(&artifact("d3-b.log", 3)));
        // outside the range
        assert!(state.should_collect(&artifact("d4-a.log", 4)));
    }

    #[test]
    fn test_trunks_keep_separate_ranges() {
        let state = TimeRangeCollectionState::new(Some(Granularity::Month))
            .with_trunk_fields(vec!["org".to_string()]);
        state.on_collected(&org_artifact("org1", "org1/2024/06/a", 6)).unwrap();
        state.on_collected(&org_artifact("org1", "org1/2024/08/b", 8)).unwrap();

        assert!(!state.should_collect(&org_artifact("org1", "org1/2024/07/x", 7)));
        assert!(state.should_collect(&org_artifact("org2", "org2/2024/07/c", 7)));

        let month = |org: &str| props(&[("org", org), ("year", "2024"), ("month", "07")]);
        state.register_path("org1/2024/07", &month("org1"));
        state.register_path("org2/2024/07", &month("org2"));
        assert!(!state.should_traverse("org1/2024/07"));
        assert!(state.should_traverse("org2/2024/07"));

        assert_eq!(state.trunks(), vec!["org=org1"]);
        assert!(state.time_range(&props(&[("org", "org2")])).is_none());
    }

    #[test]
    fn test_from_excludes_older_artifacts() {
        let state = TimeRangeCollectionState::new(Some(Granularity::Day))
            .with_from(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
        assert!(!state.should_collect(&artifact("old.log", 1)));
        assert!(state.should_collect(&artifact("new.log", 2)));

        state.register_path("2024/05", &props(&[("year", "2024"), ("month", "05")]));
        assert!(!state.should_traverse("2024/05"));
        state.register_path("2024/06", &props(&[("year", "2024"), ("month", "06")]));
        assert!(state.should_traverse("2024/06"));
    }

    #[test]
    fn test_untimed_artifacts_tracked_by_name() {
        let state = TimeRangeCollectionState::new(None);
        let info = ArtifactInfo::new("plain.log");
        assert!(state.should_collect(&info));
        state.on_collected(&info).unwrap();
        assert!(!state.should_collect(&info));
    }

    #[test]
    fn test_should_traverse_skips_interior_directories() {
        let state = TimeRangeCollectionState::new(Some(Granularity::Day));
        state.on_collected(&artifact("a", 1)).unwrap();
        state.on_collected(&artifact("b", 20)).unwrap();

        let day = |d: &str| props(&[("year", "2024"), ("month", "06"), ("day", d)]);
        state.register_path("06/10", &day("10"));
        state.register_path("06/01", &day("01"));
        state.register_path("06/20", &day("20"));
        assert!(!state.should_traverse("06/10"));
        assert!(state.should_traverse("06/01"));
        assert!(state.should_traverse("06/20"));
        assert!(state.should_traverse("unregistered"));
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("partition.json");

        let state = TimeRangeCollectionState::load(&path, Some(Granularity::Day))
            .await
            .unwrap();
        state.on_collected(&artifact("a.log", 5)).unwrap();
        state.save().await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = TimeRangeCollectionState::load(&path, Some(Granularity::Day))
            .await
            .unwrap();
        assert!(!reloaded.should_collect(&artifact("a.log", 5)));
        assert!(reloaded.should_collect(&artifact("b.log", 5)));
        assert_eq!(
            reloaded.time_range(&HashMap::new()),
            state.time_range(&HashMap::new())
        );
    }
}
