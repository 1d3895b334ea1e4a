use crate::canonical::canonicalize;
use crate::models::{CategoryMap, Granularity, Provider, Report};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// How a row's amount lands in its period bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulation {
    /// One row per period and group is expected; the last one wins.
    Overwrite,
    /// Several rows may share a period; amounts are summed.
    Additive,
}

/// What a row's date stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowDating {
    /// The day the usage happened.
    Usage,
    /// The first day of the billing period the row summarizes. A period
    /// counts when it overlaps the window, even if it opens before `start`.
    PeriodStart,
}

/// One normalized billing row, extracted from a provider-native shape.
#[derive(Debug, Clone)]
pub struct CostRow {
    pub date: NaiveDate,
    pub service: String,
    pub amount: f64,
    /// Ordered `(attribute, value)` pairs that also take part in the group key.
    pub dimensions: Vec<(&'static str, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    account: String,
    service: String,
    dimensions: Vec<String>,
}

impl GroupKey {
    fn id(&self) -> String {
        let mut parts = Vec::with_capacity(self.dimensions.len() + 2);
        parts.push(self.account.as_str());
        parts.push(self.service.as_str());
        parts.extend(self.dimensions.iter().map(String::as_str));
        parts.join("/")
    }
}

pub fn period_key(date: NaiveDate, granularity: Granularity) -> String {
    match granularity {
        Granularity::Daily => date.format("%Y-%m-%d").to_string(),
        Granularity::Monthly => date.format("%Y-%m").to_string(),
    }
}

/// Parses a billing amount; malformed input counts as zero.
pub fn parse_amount(provider: Provider, raw: &str) -> f64 {
    let cleaned = raw.trim().trim_start_matches('$').replace(',', "");
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => {
            warn!(provider = %provider, amount = raw, "malformed cost amount, counting as zero");
            0.0
        }
    }
}

/// Parses `"key:value"` static account labels into report attributes.
pub fn static_attributes(tags: &[String]) -> BTreeMap<String, String> {
    tags.iter()
        .filter_map(|raw| {
            let (key, value) = raw.split_once(':').unwrap_or((raw.as_str(), ""));
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Folds rows into reports keyed by account, service and dimensions.
///
/// Reports come out in first-seen order of their group key.
pub struct ReportAccumulator<'a> {
    provider: Provider,
    account_name: &'a str,
    start: NaiveDate,
    granularity: Granularity,
    mode: Accumulation,
    dating: RowDating,
    categories: &'a CategoryMap,
    static_attributes: BTreeMap<String, String>,
    reports: Vec<Report>,
    index: HashMap<GroupKey, usize>,
}

impl<'a> ReportAccumulator<'a> {
    pub fn new(
        provider: Provider,
        account_name: &'a str,
        account_tags: &[String],
        start: DateTime<Utc>,
        granularity: Granularity,
        mode: Accumulation,
        categories: &'a CategoryMap,
    ) -> Self {
        Self {
            provider,
            account_name,
            start: start.date_naive(),
            granularity,
            mode,
            dating: RowDating::Usage,
            categories,
            static_attributes: static_attributes(account_tags),
            reports: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn with_row_dating(mut self, dating: RowDating) -> Self {
        self.dating = dating;
        self
    }

    /// First date a row may carry and still fall inside the window.
    ///
    /// Windows are compared by calendar day in UTC, so a start in the middle
    /// of a day still admits rows dated that day.
    fn earliest_date(&self) -> NaiveDate {
        match (self.dating, self.granularity) {
            (RowDating::PeriodStart, Granularity::Monthly) => {
                self.start.with_day(1).unwrap_or(self.start)
            }
            _ => self.start,
        }
    }

    /// Adds one row; returns false when the row predates the query window.
    pub fn push(&mut self, row: CostRow) -> bool {
        if row.date < self.earliest_date() {
            return false;
        }

        let period = period_key(row.date, self.granularity);
        let key = GroupKey {
            account: self.account_name.to_string(),
            service: row.service.clone(),
            dimensions: row.dimensions.iter().map(|(_, v)| v.clone()).collect(),
        };

        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let service = canonicalize(self.provider, &row.service);
                let category = self.categories.category_for(&service).to_string();
                let mut attributes = self.static_attributes.clone();
                for (name, value) in &row.dimensions {
                    attributes.insert((*name).to_string(), value.clone());
                }
                self.reports.push(Report {
                    id: key.id(),
                    name: format!("{}/{}", self.provider.as_label(), self.account_name),
                    service,
                    category,
                    provider: self.provider,
                    reports: BTreeMap::new(),
                    attributes,
                });
                let slot = self.reports.len() - 1;
                self.index.insert(key, slot);
                slot
            }
        };

        let bucket = &mut self.reports[slot].reports;
        match self.mode {
            Accumulation::Overwrite => {
                bucket.insert(period, row.amount);
            }
            Accumulation::Additive => {
                *bucket.entry(period).or_insert(0.0) += row.amount;
            }
        }
        true
    }

    pub fn finish(self) -> Vec<Report> {
        self.reports
    }
}
