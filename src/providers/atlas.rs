use crate::config::{resolve_secret, AccountSettings, AtlasAccount};
use crate::error::AppError;
use crate::models::{CategoryMap, CostQuery, Provider, Report, TagKeys, TagValues, TagsQuery};
use crate::providers::ProviderAdapter;
use crate::transform::{parse_amount, Accumulation, CostRow, ReportAccumulator};
use async_trait::async_trait;
use chrono::NaiveDate;
use digest_auth::AuthContext;
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

const ATLAS_URL: &str = "https://cloud.mongodb.com";
const JSON_ACCEPT: &str = "application/vnd.atlas.2023-01-01+json";
const CSV_ACCEPT: &str = "application/vnd.atlas.2023-01-01+csv";

/// First header cell of the line-item table inside an invoice CSV.
const HEADER_MARKER: &str = "Organization ID,";
const CREDIT_SKU: &str = "Credit";

const DATE_COLUMNS: &[&str] = &["Usage Date", "Date"];
const SERVICE_COLUMNS: &[&str] = &["Description", "SKU"];
const SKU_COLUMNS: &[&str] = &["SKU"];
const PROJECT_COLUMNS: &[&str] = &["Project", "Project Name"];
const CLUSTER_COLUMNS: &[&str] = &["Cluster"];
const AMOUNT_COLUMNS: &[&str] = &["Amount", "Total"];

pub struct AtlasAdapter {
    client: Client,
}

struct DigestCredentials {
    account: String,
    public_key: String,
    private_key: String,
}

impl DigestCredentials {
    fn auth_error(&self, message: impl Into<String>) -> AppError {
        AppError::Auth {
            provider: Provider::Atlas,
            account: self.account.clone(),
            message: message.into(),
        }
    }
}

pub struct AtlasHandle {
    base: Url,
    org_id: String,
    credentials: Arc<DigestCredentials>,
}

#[derive(Debug, Deserialize)]
struct InvoiceList {
    #[serde(default)]
    results: Vec<InvoiceSummary>,
}

#[derive(Debug, Deserialize)]
struct InvoiceSummary {
    id: String,
}

/// GET with HTTP digest auth: an unauthenticated attempt, then one answered
/// challenge.
async fn digest_get(
    client: &Client,
    credentials: &DigestCredentials,
    url: Url,
    accept: &str,
) -> Result<String, AppError> {
    let unsigned = client.get(url.clone()).header(ACCEPT, accept).send().await?;

    let response = if unsigned.status() == StatusCode::UNAUTHORIZED {
        let challenge = unsigned
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| credentials.auth_error("digest challenge missing from 401 response"))?;
        let mut prompt = digest_auth::parse(challenge)
            .map_err(|e| credentials.auth_error(format!("invalid digest challenge: {e}")))?;

        let uri = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let context = AuthContext::new(
            credentials.public_key.as_str(),
            credentials.private_key.as_str(),
            uri,
        );
        let answer = prompt
            .respond(&context)
            .map_err(|e| credentials.auth_error(format!("failed to answer digest challenge: {e}")))?;

        client
            .get(url)
            .header(ACCEPT, accept)
            .header(AUTHORIZATION, answer.to_header_string())
            .send()
            .await?
    } else {
        unsigned
    };

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(credentials.auth_error("digest credentials rejected"));
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(AppError::Upstream {
            provider: Provider::Atlas,
            status: status.as_u16(),
            message,
        });
    }
    Ok(response.text().await?)
}

fn column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    names
        .iter()
        .find_map(|name| headers.iter().position(|h| h.trim() == *name))
}

/// Concatenates invoice CSVs into one table with a single header.
///
/// Preamble lines before the line-item header and `Credit` rows are dropped.
/// Invoices without a line-item table contribute nothing. The first table's
/// header wins; later tables are realigned to it by column name, with cells
/// for missing columns left empty and unknown columns dropped.
pub fn combine_invoice_csvs(invoices: &[String]) -> Result<String, AppError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    let mut canonical: Option<csv::StringRecord> = None;

    for (index, raw) in invoices.iter().enumerate() {
        let Some(start) = raw
            .lines()
            .position(|line| line.trim_start().starts_with(HEADER_MARKER))
        else {
            debug!(invoice = index, "invoice CSV has no line-item header");
            continue;
        };
        let table: String = raw
            .lines()
            .skip(start)
            .collect::<Vec<_>>()
            .join("\n");

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(table.as_bytes());
        let headers = reader.headers()?.clone();
        let sku = column(&headers, SKU_COLUMNS);

        let layout = match &canonical {
            None => {
                writer.write_record(&headers)?;
                canonical = Some(headers.clone());
                None
            }
            Some(first) if same_columns(first, &headers) => None,
            Some(first) => Some(realign(index, first, &headers)),
        };

        for record in reader.records() {
            let record = record?;
            let is_credit = sku
                .and_then(|i| record.get(i))
                .is_some_and(|v| v.trim() == CREDIT_SKU);
            if is_credit {
                continue;
            }
            match &layout {
                None => writer.write_record(&record)?,
                Some(positions) => writer.write_record(
                    positions
                        .iter()
                        .map(|pos| pos.and_then(|i| record.get(i)).unwrap_or_default()),
                )?,
            }
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::request(Provider::Atlas, e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| AppError::request(Provider::Atlas, e.to_string()))
}

fn same_columns(a: &csv::StringRecord, b: &csv::StringRecord) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.trim() == y.trim())
}

/// For each column of `first`, where that column sits in `headers`.
fn realign(
    invoice: usize,
    first: &csv::StringRecord,
    headers: &csv::StringRecord,
) -> Vec<Option<usize>> {
    let positions: Vec<Option<usize>> = first
        .iter()
        .map(|name| headers.iter().position(|h| h.trim() == name.trim()))
        .collect();
    let missing: Vec<&str> = first
        .iter()
        .zip(&positions)
        .filter(|(_, pos)| pos.is_none())
        .map(|(name, _)| name)
        .collect();
    let extra: Vec<&str> = headers
        .iter()
        .filter(|h| !first.iter().any(|name| name.trim() == h.trim()))
        .collect();
    warn!(
        invoice,
        missing = ?missing,
        extra = ?extra,
        "invoice CSV header differs from the first invoice, realigning by column name"
    );
    positions
}

fn parse_invoice_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let head = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%m/%d/%Y"))
        .ok()
}

impl AtlasAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn invoice_ids(&self, handle: &AtlasHandle) -> Result<Vec<String>, AppError> {
        let url = handle
            .base
            .join(&format!("api/atlas/v2/orgs/{}/invoices", handle.org_id))?;
        let body = digest_get(&self.client, &handle.credentials, url, JSON_ACCEPT).await?;
        let list: InvoiceList = serde_json::from_str(&body)?;
        Ok(list.results.into_iter().map(|i| i.id).collect())
    }

    /// One task per invoice; results are gathered in invoice-list order.
    ///
    /// The first failed download is returned as soon as it lands and the
    /// remaining tasks are aborted with the set.
    async fn download_invoices(
        &self,
        handle: &AtlasHandle,
        ids: Vec<String>,
    ) -> Result<Vec<String>, AppError> {
        let mut tasks = JoinSet::new();
        for (index, id) in ids.iter().enumerate() {
            let url = handle
                .base
                .join(&format!("api/atlas/v2/orgs/{}/invoices/{}/csv", handle.org_id, id))?;
            let client = self.client.clone();
            let credentials = Arc::clone(&handle.credentials);
            tasks.spawn(async move {
                (index, digest_get(&client, &credentials, url, CSV_ACCEPT).await)
            });
        }

        let mut bodies = vec![String::new(); ids.len()];
        while let Some(joined) = tasks.join_next().await {
            let (index, body) = joined.map_err(|e| {
                AppError::request(Provider::Atlas, format!("invoice download task failed: {e}"))
            })?;
            match body {
                Ok(body) => bodies[index] = body,
                Err(err) => {
                    warn!(invoice = %ids[index], error = %err, "invoice download failed, cancelling the rest");
                    return Err(err);
                }
            }
        }
        Ok(bodies)
    }
}

#[async_trait]
impl ProviderAdapter for AtlasAdapter {
    type Account = AtlasAccount;
    type Handle = AtlasHandle;
    /// Combined line-item CSV across every invoice.
    type RawCosts = String;

    fn provider(&self) -> Provider {
        Provider::Atlas
    }

    async fn authenticate(&self, account: &AtlasAccount) -> Result<AtlasHandle, AppError> {
        if account.public_key.trim().is_empty() {
            return Err(self.auth_error(account, "public_key is empty"));
        }
        let private_key = resolve_secret(
            Provider::Atlas,
            &account.name,
            "private_key",
            account.private_key.as_deref(),
        )?;
        let base = Url::parse(account.base_url.as_deref().unwrap_or(ATLAS_URL))?;
        Ok(AtlasHandle {
            base,
            org_id: account.org_id.clone(),
            credentials: Arc::new(DigestCredentials {
                account: account.name.clone(),
                public_key: account.public_key.clone(),
                private_key,
            }),
        })
    }

    async fn fetch_tag_keys(
        &self,
        _account: &AtlasAccount,
        _handle: &AtlasHandle,
        _query: &TagsQuery,
    ) -> Result<TagKeys, AppError> {
        Ok(TagKeys {
            tag_keys: vec![],
            provider: Provider::Atlas,
        })
    }

    async fn fetch_tag_values(
        &self,
        _account: &AtlasAccount,
        _handle: &AtlasHandle,
        _query: &TagsQuery,
        _tag_key: &str,
    ) -> Result<TagValues, AppError> {
        Ok(TagValues {
            tag_values: vec![],
            provider: Provider::Atlas,
        })
    }

    async fn fetch_costs(
        &self,
        account: &AtlasAccount,
        handle: &AtlasHandle,
        query: &CostQuery,
    ) -> Result<String, AppError> {
        if !query.tags.is_empty() {
            debug!(account = %account.name, "Atlas invoices carry no tags, ignoring tag filter");
        }
        let ids = self.invoice_ids(handle).await?;
        let invoices = self.download_invoices(handle, ids).await?;
        info!(account = %account.name, invoices = invoices.len(), "fetched Atlas invoices");
        combine_invoice_csvs(&invoices)
    }

    fn transform_costs(
        &self,
        account: &AtlasAccount,
        query: &CostQuery,
        raw: String,
        categories: &CategoryMap,
    ) -> Result<Vec<Report>, AppError> {
        let mut acc = ReportAccumulator::new(
            Provider::Atlas,
            &account.name,
            account.tags(),
            query.start()?,
            query.granularity,
            Accumulation::Additive,
            categories,
        );
        if raw.trim().is_empty() {
            return Ok(acc.finish());
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(raw.as_bytes());
        let headers = reader.headers()?.clone();
        let (Some(date_idx), Some(service_idx), Some(amount_idx)) = (
            column(&headers, DATE_COLUMNS),
            column(&headers, SERVICE_COLUMNS),
            column(&headers, AMOUNT_COLUMNS),
        ) else {
            return Err(AppError::request(
                Provider::Atlas,
                "invoice CSV lacks date, service or amount columns",
            ));
        };
        let sku_idx = column(&headers, SKU_COLUMNS);
        let project_idx = column(&headers, PROJECT_COLUMNS);
        let cluster_idx = column(&headers, CLUSTER_COLUMNS);
        let cell = |record: &csv::StringRecord, idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };

        for record in reader.records() {
            let record = record?;
            let Some(date) = record.get(date_idx).and_then(parse_invoice_date) else {
                warn!(account = %account.name, date = ?record.get(date_idx), "skipping Atlas row with malformed date");
                continue;
            };
            acc.push(CostRow {
                date,
                service: cell(&record, Some(service_idx)),
                amount: parse_amount(Provider::Atlas, record.get(amount_idx).unwrap_or_default()),
                dimensions: vec![
                    ("sku", cell(&record, sku_idx)),
                    ("project", cell(&record, project_idx)),
                    ("cluster", cell(&record, cluster_idx)),
                ],
            });
        }

        Ok(acc.finish())
    }
}
