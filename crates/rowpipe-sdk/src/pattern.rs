//! Grok-style layout patterns
//!
//! Patterns are literal text with `%{NAME}` or `%{NAME:field}` placeholders.
//! `NAME` selects one of the built-in sub-expressions and `field` names the
//! capture. A [`Layout`] applies one pattern per `/`-separated path segment so
//! directory prefixes can be matched while walking a tree.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use rowpipe_common::{Result, SdkError};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Built-in placeholder patterns
/// Fields that carry time rather than identify a source path
pub const TIME_FIELDS: [&str; 7] = ["year", "month", "day", "hour", "minute", "second", "timestamp"];

const BUILTIN_PATTERNS: &[(&str, &str)] = &[
    ("DATA", r".*?"),
    ("GREEDYDATA", r".*"),
    ("NOTSPACE", r"\S+"),
    ("WORD", r"\w+"),
    ("INT", r"[+-]?\d+"),
    ("NUMBER", r"[+-]?(?:\d+(?:\.\d*)?|\.\d+)"),
    ("YEAR", r"\d{4}"),
    ("MONTHNUM", r"(?:0?[1-9]|1[0-2])"),
    ("MONTHDAY", r"(?:0[1-9]|[12]\d|3[01]|[1-9])"),
    ("HOUR", r"(?:2[0-3]|[01]?\d)"),
    ("MINUTE", r"[0-5]\d"),
    ("SECOND", r"(?:[0-5]\d|60)"),
    ("IP", r"(?:\d{1,3}(?:\.\d{1,3}){3}|[0-9A-Fa-f:]*:[0-9A-Fa-f:.]+)"),
    ("HTTPDATE", r"\d{2}/\w{3}/\d{4}:\d{2}:\d{2}:\d{2} [+-]\d{4}"),
    (
        "TIMESTAMP_ISO8601",
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
    ),
];

#[allow(clippy::expect_used)]
fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"%\{(\w+)(?::(\w+))?\}").expect("placeholder regex is valid")
    })
}

fn builtin(name: &str) -> Option<&'static str> {
    BUILTIN_PATTERNS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, p)| *p)
}

/// A compiled single-line pattern
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
    fields: Vec<String>,
}

impl Pattern {
    /// Compile a pattern that must match the whole input
    pub fn compile(source: &str) -> Result<Self> {
        let mut expr = String::from("^");
        let mut fields = Vec::new();
        let mut last = 0;

        for caps in placeholder_regex().captures_iter(source) {
            let Some(whole) = caps.get(0) else { continue };
            expr.push_str(&regex::escape(&source[last..whole.start()]));

            let name = &caps[1];
            let sub = builtin(name)
                .ok_or_else(|| SdkError::Pattern(format!("unknown pattern '{}' in '{}'", name, source)))?;

            match caps.get(2) {
                Some(field) => {
                    let field = field.as_str();
                    if fields.iter().any(|f| f == field) {
                        return Err(SdkError::Pattern(format!(
                            "field '{}' appears more than once in '{}'",
                            field, source
                        )));
                    }
                    expr.push_str(&format!("(?P<{}>{})", field, sub));
                    fields.push(field.to_string());
                }
                None => expr.push_str(&format!("(?:{})", sub)),
            }
            last = whole.end();
        }
        expr.push_str(&regex::escape(&source[last..]));
        expr.push('$');

        let regex = Regex::new(&expr)
            .map_err(|e| SdkError::Pattern(format!("'{}': {}", source, e)))?;

        Ok(Self {
            source: source.to_string(),
            regex,
            fields,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of the captured fields, in pattern order
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Match the whole input, returning the captured fields
    pub fn captures(&self, input: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(input)?;
        Some(
            self.fields
                .iter()
                .filter_map(|f| caps.name(f).map(|m| (f.clone(), m.as_str().to_string())))
                .collect(),
        )
    }
}

/// A path layout: one [`Pattern`] per path segment
#[derive(Debug, Clone)]
pub struct Layout {
    source: String,
    segments: Vec<Pattern>,
}

impl Layout {
    pub fn parse(source: &str) -> Result<Self> {
        let trimmed = source.trim_matches('/');
        if trimmed.is_empty() {
            return Err(SdkError::Pattern("layout is empty".to_string()));
        }
        let segments = trimmed
            .split('/')
            .map(Pattern::compile)
            .collect::<Result<Vec<_>>>()?;

        let mut seen = std::collections::HashSet::new();
        for field in segments.iter().flat_map(|s| s.fields()) {
            if !seen.insert(field) {
                return Err(SdkError::Pattern(format!(
                    "field '{}' appears more than once in '{}'",
                    field, source
                )));
            }
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Every captured field name across all segments
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().flat_map(|s| s.fields().iter().map(String::as_str))
    }

    /// Fields captured by the segments before the first one holding a time field.
    ///
    /// For `%{DATA:org}/%{YEAR:year}/%{DATA:name}.log` this is `["org"]`:
    /// every `org` value starts its own independent timeline.
    pub fn trunk_fields(&self) -> Vec<String> {
        self.segments
            .iter()
            .take_while(|s| !s.fields().iter().any(|f| TIME_FIELDS.contains(&f.as_str())))
            .flat_map(|s| s.fields().iter().cloned())
            .collect()
    }

    /// Match a relative path against the complete layout
    pub fn match_path(&self, relative: &str) -> Option<HashMap<String, String>> {
        let parts = split_path(relative);
        if parts.len() != self.segments.len() {
            return None;
        }
        self.match_segments(&parts)
    }

    /// Match a relative directory against the leading segments of the layout.
    ///
    /// Returns `None` when the directory is as deep as the layout or deeper,
    /// since no file below it could match.
    pub fn match_prefix(&self, relative_dir: &str) -> Option<HashMap<String, String>> {
        let parts = split_path(relative_dir);
        if parts.len() >= self.segments.len() {
            return None;
        }
        self.match_segments(&parts)
    }

    fn match_segments(&self, parts: &[&str]) -> Option<HashMap<String, String>> {
        let mut properties = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            properties.extend(segment.captures(part)?);
        }
        Some(properties)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// Parse a timestamp string in one of the formats logs commonly use.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, Apache `HTTPDATE`, and unix
/// epoch seconds or milliseconds.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(value, "%d/%b/%Y:%H:%M:%S %z") {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ts.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|d| d.and_utc());
    }
    let epoch: i64 = value.parse().ok()?;
    epoch_to_datetime(epoch)
}

/// Interpret an integer as epoch seconds, or milliseconds when it is too
/// large to be a plausible number of seconds
pub fn epoch_to_datetime(epoch: i64) -> Option<DateTime<Utc>> {
    if epoch.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(epoch)
    } else {
        DateTime::from_timestamp(epoch, 0)
    }
}

/// Derive a timestamp from layout properties.
///
/// A `timestamp` property wins; otherwise `year` is required and the finer
/// fields default to the start of their range.
pub fn timestamp_from_properties(properties: &HashMap<String, String>) -> Option<DateTime<Utc>> {
    if let Some(ts) = properties.get("timestamp") {
        return parse_timestamp(ts);
    }

    let field = |name: &str, default: u32| -> Option<u32> {
        match properties.get(name) {
            Some(v) => v.parse().ok(),
            None => Some(default),
        }
    };

    let year: i32 = properties.get("year")?.parse().ok()?;
    Utc.with_ymd_and_hms(
        year,
        field("month", 1)?,
        field("day", 1)?,
        field("hour", 0)?,
        field("minute", 0)?,
        field("second", 0)?,
    )
    .single()
}
