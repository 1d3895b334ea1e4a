use crate::config::{resolve_secret, AccountSettings, AzureAccount};
use crate::error::AppError;
use crate::filters::{self, FilterGrammar};
use crate::models::{
    CategoryMap, CostQuery, Granularity, Provider, Report, Tag, TagKeys, TagValues, TagsQuery,
};
use crate::pagination::{drain_pages, Page};
use crate::providers::ProviderAdapter;
use crate::retry::{send_with_backoff, RetryPolicy, Sleeper, TokioSleeper};
use crate::transform::{parse_amount, Accumulation, CostRow, ReportAccumulator, RowDating};
use async_trait::async_trait;
use azure_core::credentials::{Secret, TokenCredential};
use azure_identity::ClientSecretCredential;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

const MANAGEMENT_URL: &str = "https://management.azure.com";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
const QUERY_API_VERSION: &str = "2023-03-01";
const TAGS_API_VERSION: &str = "2023-05-01";
const QUERY_PATH: &str = "providers/Microsoft.CostManagement/query";

const COST_COLUMNS: &[&str] = &["PreTaxCost", "Cost", "CostUSD", "totalCost"];
const DATE_COLUMNS: &[&str] = &["UsageDate", "BillingMonth"];
const SERVICE_COLUMN: &str = "ServiceName";
const TAG_KEY_COLUMN: &str = "TagKey";
const TAG_VALUE_COLUMN: &str = "TagValue";

/// Builds the token credential for one account from its resolved secret.
pub type CredentialFactory = Arc<
    dyn Fn(&AzureAccount, String) -> azure_core::Result<Arc<dyn TokenCredential>> + Send + Sync,
>;

fn client_secret_credential(
    account: &AzureAccount,
    secret: String,
) -> azure_core::Result<Arc<dyn TokenCredential>> {
    let credential: Arc<dyn TokenCredential> = ClientSecretCredential::new(
        &account.tenant_id,
        account.client_id.clone(),
        Secret::new(secret),
        None,
    )?;
    Ok(credential)
}

pub struct AzureAdapter {
    client: Client,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    credentials: CredentialFactory,
}

pub struct AzureHandle {
    bearer: String,
    base: Url,
    subscription_id: String,
}

impl AzureHandle {
    fn subscription_url(&self, path: &str, api_version: &str) -> Result<Url, AppError> {
        let mut url = self
            .base
            .join(&format!("subscriptions/{}/{}", self.subscription_id, path))?;
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }
}

/// One page of a Cost Management query, kept in its column/row form.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureQueryPage {
    #[serde(default)]
    next_link: Option<String>,
    #[serde(default)]
    columns: Vec<AzureColumn>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
struct AzureColumn {
    name: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    properties: AzureQueryPage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagsResponse {
    #[serde(default)]
    properties: TagsProperties,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagsProperties {
    #[serde(default)]
    tags: Vec<AzureTag>,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AzureTag {
    key: String,
}

struct CostManagementGrammar;

impl FilterGrammar for CostManagementGrammar {
    type Expr = Value;

    fn equality(&self, key: &str, value: Option<&str>) -> Value {
        json!({
            "tags": {
                "name": key,
                "operator": "In",
                "values": value.into_iter().collect::<Vec<_>>(),
            }
        })
    }

    // The query API rejects and/or nodes with fewer than two operands.
    fn or(&self, mut children: Vec<Value>) -> Value {
        if children.len() == 1 {
            return children.remove(0);
        }
        json!({ "or": children })
    }

    fn and(&self, mut children: Vec<Value>) -> Value {
        if children.len() == 1 {
            return children.remove(0);
        }
        json!({ "and": children })
    }
}

fn time_period(start: DateTime<Utc>, end: DateTime<Utc>) -> Value {
    json!({
        "from": start.to_rfc3339(),
        "to": end.to_rfc3339(),
    })
}

fn query_body(query: &CostQuery) -> Result<Value, AppError> {
    let tags: Vec<Tag> = query
        .parsed_tags()
        .into_iter()
        .filter(|tag| {
            if tag.value.is_none() {
                warn!(key = %tag.key, "Azure cost queries cannot filter on tag existence, ignoring tag");
            }
            tag.value.is_some()
        })
        .collect();

    let granularity = match query.granularity {
        Granularity::Daily => "Daily",
        Granularity::Monthly => "Monthly",
    };

    let mut dataset = json!({
        "granularity": granularity,
        "aggregation": {
            "totalCost": { "name": "PreTaxCost", "function": "Sum" }
        },
        "grouping": [
            { "type": "Dimension", "name": SERVICE_COLUMN }
        ],
    });
    if let Some(filter) = filters::build(&CostManagementGrammar, &tags) {
        dataset["filter"] = filter;
    }

    Ok(json!({
        "type": "ActualCost",
        "timeframe": "Custom",
        "timePeriod": time_period(query.start()?, query.end()?),
        "dataset": dataset,
    }))
}

/// Cost totals over the tags window, one row per value of `tag_key`.
fn tag_values_body(query: &TagsQuery, tag_key: &str) -> Result<Value, AppError> {
    Ok(json!({
        "type": "ActualCost",
        "timeframe": "Custom",
        "timePeriod": time_period(query.start()?, query.end()?),
        "dataset": {
            "granularity": "None",
            "aggregation": {
                "totalCost": { "name": "PreTaxCost", "function": "Sum" }
            },
            "grouping": [
                { "type": "TagKey", "name": tag_key }
            ],
        },
    }))
}

/// Values of `tag_key` seen in tag-grouped query pages, first-seen order.
fn tag_values_from_pages(pages: &[AzureQueryPage], tag_key: &str) -> Vec<String> {
    let mut values: Vec<String> = Vec::new();
    for page in pages {
        let Some(value_idx) = column_index(&page.columns, &[TAG_VALUE_COLUMN]) else {
            continue;
        };
        let key_idx = column_index(&page.columns, &[TAG_KEY_COLUMN]);
        for row in &page.rows {
            // Untagged spend comes back with an empty key and value.
            let key_matches = key_idx
                .and_then(|i| row.get(i))
                .and_then(Value::as_str)
                .map_or(true, |k| k.eq_ignore_ascii_case(tag_key));
            let Some(value) = row.get(value_idx).and_then(Value::as_str) else {
                continue;
            };
            let value = value.trim();
            if key_matches && !value.is_empty() && !values.iter().any(|v| v == value) {
                values.push(value.to_string());
            }
        }
    }
    values
}

/// Parses Azure's integer `YYYYMMDD` date; exactly eight digits are required.
pub fn parse_numeric_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
}

fn parse_row_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Number(n) => parse_numeric_date(&n.to_string()),
        Value::String(s) if s.contains('-') => {
            NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok()
        }
        Value::String(s) => parse_numeric_date(s),
        _ => None,
    }
}

fn parse_row_amount(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => parse_amount(Provider::Azure, s),
        _ => 0.0,
    }
}

fn column_index(columns: &[AzureColumn], names: &[&str]) -> Option<usize> {
    columns
        .iter()
        .position(|c| names.iter().any(|n| c.name.eq_ignore_ascii_case(n)))
}

impl AzureAdapter {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryPolicy::azure(),
            sleeper: Arc::new(TokioSleeper),
            credentials: Arc::new(client_secret_credential),
        }
    }

    #[cfg(test)]
    pub fn with_retry(mut self, retry: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        self.retry = retry;
        self.sleeper = sleeper;
        self
    }

    #[cfg(test)]
    pub fn with_credentials(mut self, credentials: CredentialFactory) -> Self {
        self.credentials = credentials;
        self
    }

    /// Runs one Cost Management query, following `nextLink` to the end.
    async fn run_query(
        &self,
        handle: &AzureHandle,
        body: &Value,
        label: &str,
    ) -> Result<Vec<AzureQueryPage>, AppError> {
        let first = handle.subscription_url(QUERY_PATH, QUERY_API_VERSION)?;
        drain_pages(label, |token| {
            let url = token.unwrap_or_else(|| first.to_string());
            async move {
                let response = send_with_backoff(&self.retry, self.sleeper.as_ref(), Provider::Azure, || {
                    self.client
                        .post(&url)
                        .bearer_auth(&handle.bearer)
                        .json(body)
                        .send()
                })
                .await?;
                let mut parsed: QueryResponse = response.json().await?;
                let next = parsed.properties.next_link.take();
                Ok(Page {
                    items: vec![parsed.properties],
                    next,
                })
            }
        })
        .await
    }

    /// Values of one tag on spend inside the window.
    async fn window_tag_values(
        &self,
        handle: &AzureHandle,
        query: &TagsQuery,
        tag_key: &str,
    ) -> Result<Vec<String>, AppError> {
        let body = tag_values_body(query, tag_key)?;
        let pages = self.run_query(handle, &body, "azure tag values").await?;
        Ok(tag_values_from_pages(&pages, tag_key))
    }

    /// Every tag key the subscription knows, regardless of time.
    async fn tag_catalog(&self, handle: &AzureHandle) -> Result<Vec<AzureTag>, AppError> {
        let first = handle.subscription_url("providers/Microsoft.Consumption/tags", TAGS_API_VERSION)?;
        drain_pages("azure tag catalog", |token| {
            let url = token.unwrap_or_else(|| first.to_string());
            async move {
                let response = send_with_backoff(&self.retry, self.sleeper.as_ref(), Provider::Azure, || {
                    self.client.get(&url).bearer_auth(&handle.bearer).send()
                })
                .await?;
                let body: TagsResponse = response.json().await?;
                Ok(Page {
                    next: body.properties.next_link.or(body.next_link),
                    items: body.properties.tags,
                })
            }
        })
        .await
    }
}

#[async_trait]
impl ProviderAdapter for AzureAdapter {
    type Account = AzureAccount;
    type Handle = AzureHandle;
    type RawCosts = Vec<AzureQueryPage>;

    fn provider(&self) -> Provider {
        Provider::Azure
    }

    async fn authenticate(&self, account: &AzureAccount) -> Result<AzureHandle, AppError> {
        let secret = resolve_secret(
            Provider::Azure,
            &account.name,
            "client_secret",
            account.client_secret.as_deref(),
        )?;
        let credential = (self.credentials)(account, secret)
            .map_err(|e| self.auth_error(account, format!("failed to create client secret credential: {e}")))?;

        let token = credential
            .get_token(&[MANAGEMENT_SCOPE], None)
            .await
            .map_err(|e| self.auth_error(account, format!("failed to get Azure token: {e}")))?;
        debug!(account = %account.name, "acquired Azure management token");

        let base = Url::parse(account.management_url.as_deref().unwrap_or(MANAGEMENT_URL))?;
        Ok(AzureHandle {
            bearer: token.token.secret().to_string(),
            base,
            subscription_id: account.subscription_id.clone(),
        })
    }

    /// Keys from the subscription's tag catalog that carry a value on spend
    /// inside the window.
    async fn fetch_tag_keys(
        &self,
        account: &AzureAccount,
        handle: &AzureHandle,
        query: &TagsQuery,
    ) -> Result<TagKeys, AppError> {
        let mut candidates: Vec<String> = Vec::new();
        for tag in self.tag_catalog(handle).await? {
            if !candidates.iter().any(|k| k.eq_ignore_ascii_case(&tag.key)) {
                candidates.push(tag.key);
            }
        }

        let mut tag_keys = Vec::with_capacity(candidates.len());
        for key in candidates {
            if self.window_tag_values(handle, query, &key).await?.is_empty() {
                debug!(account = %account.name, key = %key, "tag key unused in window");
                continue;
            }
            tag_keys.push(key);
        }
        Ok(TagKeys {
            tag_keys,
            provider: Provider::Azure,
        })
    }

    async fn fetch_tag_values(
        &self,
        _account: &AzureAccount,
        handle: &AzureHandle,
        query: &TagsQuery,
        tag_key: &str,
    ) -> Result<TagValues, AppError> {
        Ok(TagValues {
            tag_values: self.window_tag_values(handle, query, tag_key).await?,
            provider: Provider::Azure,
        })
    }

    async fn fetch_costs(
        &self,
        account: &AzureAccount,
        handle: &AzureHandle,
        query: &CostQuery,
    ) -> Result<Vec<AzureQueryPage>, AppError> {
        let body = query_body(query)?;
        let pages = self.run_query(handle, &body, "azure cost query").await?;

        info!(
            account = %account.name,
            pages = pages.len(),
            rows = pages.iter().map(|p| p.rows.len()).sum::<usize>(),
            "fetched Azure cost rows"
        );
        Ok(pages)
    }

    fn transform_costs(
        &self,
        account: &AzureAccount,
        query: &CostQuery,
        raw: Vec<AzureQueryPage>,
        categories: &CategoryMap,
    ) -> Result<Vec<Report>, AppError> {
        let mut acc = ReportAccumulator::new(
            Provider::Azure,
            &account.name,
            account.tags(),
            query.start()?,
            query.granularity,
            Accumulation::Overwrite,
            categories,
        )
        .with_row_dating(RowDating::PeriodStart);

        for page in raw {
            let (Some(cost_idx), Some(date_idx), Some(service_idx)) = (
                column_index(&page.columns, COST_COLUMNS),
                column_index(&page.columns, DATE_COLUMNS),
                column_index(&page.columns, &[SERVICE_COLUMN]),
            ) else {
                warn!(account = %account.name, "Azure page is missing cost, date or service columns");
                continue;
            };

            for row in page.rows {
                let Some(date) = row.get(date_idx).and_then(parse_row_date) else {
                    warn!(account = %account.name, date = ?row.get(date_idx), "skipping Azure row with malformed date");
                    continue;
                };
                let service = row
                    .get(service_idx)
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string();
                acc.push(CostRow {
                    date,
                    service,
                    amount: row.get(cost_idx).map(parse_row_amount).unwrap_or(0.0),
                    dimensions: vec![],
                });
            }
        }

        Ok(acc.finish())
    }
}
