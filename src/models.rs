use crate::error::AppError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub const DEFAULT_CATEGORY: &str = "Uncategorized";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Provider {
    #[serde(rename = "AWS")]
    Aws,
    #[serde(rename = "Azure")]
    Azure,
    #[serde(rename = "Atlas")]
    Atlas,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Aws, Provider::Azure, Provider::Atlas];

    pub fn as_label(self) -> &'static str {
        match self {
            Provider::Aws => "AWS",
            Provider::Azure => "Azure",
            Provider::Atlas => "Atlas",
        }
    }

    pub fn parse(input: &str) -> Option<Provider> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_label().eq_ignore_ascii_case(input.trim()))
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Granularity {
    Daily,
    Monthly,
}

impl Granularity {
    pub fn as_label(self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Monthly => "monthly",
        }
    }
}

fn parse_epoch_millis(field: &str, raw: &str) -> Result<DateTime<Utc>, AppError> {
    let millis: i64 = raw
        .trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{field} must be epoch milliseconds, got '{raw}'")))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| AppError::Config(format!("{field} is out of range: {raw}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostQuery {
    pub start_time: String,
    pub end_time: String,
    pub granularity: Granularity,
    pub tags: Vec<String>,
}

impl CostQuery {
    pub fn start(&self) -> Result<DateTime<Utc>, AppError> {
        parse_epoch_millis("start_time", &self.start_time)
    }

    pub fn end(&self) -> Result<DateTime<Utc>, AppError> {
        parse_epoch_millis("end_time", &self.end_time)
    }

    pub fn parsed_tags(&self) -> Vec<Tag> {
        self.tags.iter().map(|raw| Tag::parse(raw)).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TagsQuery {
    pub start_time: String,
    pub end_time: String,
}

impl TagsQuery {
    pub fn start(&self) -> Result<DateTime<Utc>, AppError> {
        parse_epoch_millis("start_time", &self.start_time)
    }

    pub fn end(&self) -> Result<DateTime<Utc>, AppError> {
        parse_epoch_millis("end_time", &self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: Option<String>,
}

impl Tag {
    /// Splits on the first `:`. A missing or empty value is an existence filter.
    pub fn parse(raw: &str) -> Tag {
        match raw.split_once(':') {
            Some((key, value)) => Tag {
                key: key.trim().to_string(),
                value: Some(value.trim())
                    .filter(|v| !v.is_empty())
                    .map(ToString::to_string),
            },
            None => Tag {
                key: raw.trim().to_string(),
                value: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub id: String,
    pub name: String,
    pub service: String,
    pub category: String,
    pub provider: Provider,
    pub reports: BTreeMap<String, f64>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagKeys {
    pub tag_keys: Vec<String>,
    pub provider: Provider,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagValues {
    pub tag_values: Vec<String>,
    pub provider: Provider,
}

/// Injected `service -> category` lookup with a fallback bucket.
#[derive(Debug, Clone)]
pub struct CategoryMap {
    mapping: HashMap<String, String>,
    default_category: String,
}

impl CategoryMap {
    pub fn new(mapping: HashMap<String, String>, default_category: impl Into<String>) -> Self {
        Self {
            mapping,
            default_category: default_category.into(),
        }
    }

    pub fn category_for(&self, service: &str) -> &str {
        self.mapping
            .get(service)
            .map(String::as_str)
            .unwrap_or(&self.default_category)
    }
}

impl Default for CategoryMap {
    fn default() -> Self {
        Self::new(HashMap::new(), DEFAULT_CATEGORY)
    }
}
