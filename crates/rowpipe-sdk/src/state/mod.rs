//! Collection state: the persisted cursor that makes collection incremental

mod time_range;

pub use time_range::TimeRangeCollectionState;

use crate::artifact::ArtifactInfo;
use crate::pattern::Layout;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, TimeDelta, TimeZone, Timelike, Utc};
use rowpipe_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Decides whether an artifact needs collecting and remembers what was collected.
///
/// `should_collect` must return the same answer for the same artifact until
/// `on_collected` is called for it.
#[async_trait]
pub trait CollectionState: Send + Sync {
    /// Finest time unit the artifact naming resolves, if any
    fn granularity(&self) -> Option<Granularity>;

    fn should_collect(&self, info: &ArtifactInfo) -> bool;

    fn on_collected(&self, info: &ArtifactInfo) -> Result<()>;

    /// Record the metadata parsed from a directory while walking a tree
    fn register_path(&self, path: &str, metadata: &HashMap<String, String>);

    /// Whether a registered directory can contain artifacts still to collect
    fn should_traverse(&self, path: &str) -> bool;

    /// Persist the cursor
    async fn save(&self) -> Result<()>;
}

/// Time resolution of artifact naming, coarsest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl Granularity {
    const ORDER: [(Granularity, &'static str); 6] = [
        (Granularity::Year, "year"),
        (Granularity::Month, "month"),
        (Granularity::Day, "day"),
        (Granularity::Hour, "hour"),
        (Granularity::Minute, "minute"),
        (Granularity::Second, "second"),
    ];

    /// Finest unit for which every coarser unit is also present.
    ///
    /// `year/day` resolves to `Year`: a day without its month says nothing.
    pub fn from_fields<'a>(fields: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let fields: Vec<&str> = fields.into_iter().collect();
        let mut finest = None;
        for (granularity, name) in Self::ORDER {
            if !fields.contains(&name) {
                break;
            }
            finest = Some(granularity);
        }
        finest
    }

    pub fn from_layout(layout: &Layout) -> Option<Self> {
        Self::from_fields(layout.fields())
    }

    pub fn from_properties(properties: &HashMap<String, String>) -> Option<Self> {
        Self::from_fields(properties.keys().map(String::as_str))
    }

    /// Start of the granule containing `ts`
    pub fn truncate(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let (month, day, hour, minute, second) = match self {
            Granularity::Year => (1, 1, 0, 0, 0),
            Granularity::Month => (ts.month(), 1, 0, 0, 0),
            Granularity::Day => (ts.month(), ts.day(), 0, 0, 0),
            Granularity::Hour => (ts.month(), ts.day(), ts.hour(), 0, 0),
            Granularity::Minute => (ts.month(), ts.day(), ts.hour(), ts.minute(), 0),
            Granularity::Second => (ts.month(), ts.day(), ts.hour(), ts.minute(), ts.second()),
        };
        Utc.with_ymd_and_hms(ts.year(), month, day, hour, minute, second)
            .single()
            .unwrap_or(ts)
    }

    /// Start of the granule after the one starting at `start`
    pub fn next(self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Granularity::Year => start.checked_add_months(Months::new(12)),
            Granularity::Month => start.checked_add_months(Months::new(1)),
            Granularity::Day => start.checked_add_signed(TimeDelta::days(1)),
            Granularity::Hour => start.checked_add_signed(TimeDelta::hours(1)),
            Granularity::Minute => start.checked_add_signed(TimeDelta::minutes(1)),
            Granularity::Second => start.checked_add_signed(TimeDelta::seconds(1)),
        }
    }
}

/// Half-open time span covered by partially parsed path metadata.
///
/// `{year: 2024, month: 06}` covers June 2024. Returns `None` without a year.
pub fn time_bounds(properties: &HashMap<String, String>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let granularity = Granularity::from_properties(properties)?;
    let mut known = HashMap::new();
    for (g, name) in Granularity::ORDER {
        if g > granularity {
            break;
        }
        known.insert(name.to_string(), properties.get(name)?.clone());
    }
    let start = crate::pattern::timestamp_from_properties(&known)?;
    let end = granularity.next(start)?;
    Some((start, end))
}
