use crate::config::{resolve_secret, AccountSettings, AwsAccount};
use crate::error::AppError;
use crate::filters::{self, FilterGrammar};
use crate::models::{
    CategoryMap, CostQuery, Granularity, Provider, Report, TagKeys, TagValues, TagsQuery,
};
use crate::pagination::{drain_pages, Page};
use crate::providers::ProviderAdapter;
use crate::transform::{parse_amount, Accumulation, CostRow, ReportAccumulator, RowDating};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_costexplorer::error::DisplayErrorContext;
use aws_sdk_costexplorer::types::{
    DateInterval, Dimension, DimensionValues, Expression, Granularity as CeGranularity,
    GroupDefinition, GroupDefinitionType, MatchOption, ResultByTime, TagValues as CeTagValues,
};
use aws_sdk_costexplorer::Client;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};

/// Cost Explorer is only served from this region.
const BILLING_REGION: &str = "us-east-1";
const COST_METRIC: &str = "UnblendedCost";
const SESSION_NAME: &str = "cloud-meter";

pub struct AwsAdapter;

pub struct AwsHandle {
    client: Client,
}

/// One service group of one `ResultsByTime` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AwsCostRow {
    pub period_start: String,
    pub service: String,
    pub amount: String,
}

struct CostExplorerGrammar;

impl FilterGrammar for CostExplorerGrammar {
    type Expr = Expression;

    fn equality(&self, key: &str, value: Option<&str>) -> Expression {
        match value {
            Some(value) => Expression::builder()
                .tags(CeTagValues::builder().key(key).values(value).build())
                .build(),
            // "tag is present" is expressed as NOT(tag ABSENT).
            None => Expression::builder()
                .not(
                    Expression::builder()
                        .tags(
                            CeTagValues::builder()
                                .key(key)
                                .match_options(MatchOption::Absent)
                                .build(),
                        )
                        .build(),
                )
                .build(),
        }
    }

    fn or(&self, children: Vec<Expression>) -> Expression {
        Expression::builder().set_or(Some(children)).build()
    }

    fn and(&self, children: Vec<Expression>) -> Expression {
        Expression::builder().set_and(Some(children)).build()
    }
}

fn usage_records_only() -> Expression {
    Expression::builder()
        .dimensions(
            DimensionValues::builder()
                .key(Dimension::RecordType)
                .values("Usage")
                .build(),
        )
        .build()
}

fn cost_filter(query: &CostQuery) -> Expression {
    let grammar = CostExplorerGrammar;
    let tags = filters::build(&grammar, &query.parsed_tags());
    filters::with_base(&grammar, usage_records_only(), tags)
}

/// Cost Explorer wants `YYYY-MM-DD` bounds with an exclusive, later end.
fn date_interval(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<DateInterval, AppError> {
    let start = start.date_naive();
    let mut end = end.date_naive();
    if end <= start {
        end = start + Duration::days(1);
    }
    DateInterval::builder()
        .start(start.format("%Y-%m-%d").to_string())
        .end(end.format("%Y-%m-%d").to_string())
        .build()
        .map_err(|e| AppError::Config(format!("invalid AWS date interval: {e}")))
}

fn ce_granularity(granularity: Granularity) -> CeGranularity {
    match granularity {
        Granularity::Daily => CeGranularity::Daily,
        Granularity::Monthly => CeGranularity::Monthly,
    }
}

fn rows_from_results(results: &[ResultByTime]) -> Vec<AwsCostRow> {
    let mut out = Vec::new();
    for result in results {
        let Some(period_start) = result.time_period().map(|tp| tp.start().to_string()) else {
            continue;
        };
        for group in result.groups() {
            let service = group
                .keys()
                .first()
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string());
            let amount = group
                .metrics()
                .and_then(|m| m.get(COST_METRIC))
                .and_then(|m| m.amount())
                .unwrap_or("0")
                .to_string();
            out.push(AwsCostRow {
                period_start: period_start.clone(),
                service,
                amount,
            });
        }
    }
    out
}

impl AwsAdapter {
    async fn fetch_tags(
        &self,
        handle: &AwsHandle,
        query: &TagsQuery,
        tag_key: Option<&str>,
    ) -> Result<Vec<String>, AppError> {
        let interval = date_interval(query.start()?, query.end()?)?;
        drain_pages("aws tags", |token| {
            let request = handle
                .client
                .get_tags()
                .time_period(interval.clone())
                .set_tag_key(tag_key.map(ToString::to_string))
                .set_next_page_token(token);
            async move {
                let output = request.send().await.map_err(|e| {
                    AppError::request(Provider::Aws, DisplayErrorContext(&e).to_string())
                })?;
                Ok(Page {
                    items: output.tags().to_vec(),
                    next: output.next_page_token().map(ToString::to_string),
                })
            }
        })
        .await
    }
}

#[async_trait]
impl ProviderAdapter for AwsAdapter {
    type Account = AwsAccount;
    type Handle = AwsHandle;
    type RawCosts = Vec<AwsCostRow>;

    fn provider(&self) -> Provider {
        Provider::Aws
    }

    async fn authenticate(&self, account: &AwsAccount) -> Result<AwsHandle, AppError> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(BILLING_REGION));
        if let Some(endpoint) = &account.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some(access_key_id) = &account.access_key_id {
            let secret = resolve_secret(
                Provider::Aws,
                &account.name,
                "secret_access_key",
                account.secret_access_key.as_deref(),
            )?;
            loader = loader.credentials_provider(Credentials::new(
                access_key_id.clone(),
                secret,
                None,
                None,
                "cloud-meter-static",
            ));
        }
        let base = loader.load().await;

        let role_arn = format!(
            "arn:aws:iam::{}:role/{}",
            account.account_id, account.assumed_role_name
        );
        debug!(account = %account.name, role_arn = %role_arn, "assuming AWS role");
        let assumed = aws_sdk_sts::Client::new(&base)
            .assume_role()
            .role_arn(&role_arn)
            .role_session_name(SESSION_NAME)
            .send()
            .await
            .map_err(|e| {
                self.auth_error(
                    account,
                    aws_sdk_sts::error::DisplayErrorContext(&e).to_string(),
                )
            })?;
        let creds = assumed
            .credentials()
            .ok_or_else(|| self.auth_error(account, "AssumeRole returned no credentials"))?;

        let temporary = Credentials::new(
            creds.access_key_id(),
            creds.secret_access_key(),
            Some(creds.session_token().to_string()),
            None,
            "cloud-meter-assume-role",
        );
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(BILLING_REGION))
            .credentials_provider(temporary);
        if let Some(endpoint) = &account.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;

        Ok(AwsHandle {
            client: Client::new(&config),
        })
    }

    async fn fetch_tag_keys(
        &self,
        _account: &AwsAccount,
        handle: &AwsHandle,
        query: &TagsQuery,
    ) -> Result<TagKeys, AppError> {
        Ok(TagKeys {
            tag_keys: self.fetch_tags(handle, query, None).await?,
            provider: Provider::Aws,
        })
    }

    async fn fetch_tag_values(
        &self,
        _account: &AwsAccount,
        handle: &AwsHandle,
        query: &TagsQuery,
        tag_key: &str,
    ) -> Result<TagValues, AppError> {
        Ok(TagValues {
            tag_values: self.fetch_tags(handle, query, Some(tag_key)).await?,
            provider: Provider::Aws,
        })
    }

    async fn fetch_costs(
        &self,
        account: &AwsAccount,
        handle: &AwsHandle,
        query: &CostQuery,
    ) -> Result<Vec<AwsCostRow>, AppError> {
        let interval = date_interval(query.start()?, query.end()?)?;
        let filter = cost_filter(query);
        let granularity = ce_granularity(query.granularity);

        let rows = drain_pages("aws cost and usage", |token| {
            let request = handle
                .client
                .get_cost_and_usage()
                .time_period(interval.clone())
                .granularity(granularity.clone())
                .metrics(COST_METRIC)
                .group_by(
                    GroupDefinition::builder()
                        .r#type(GroupDefinitionType::Dimension)
                        .key("SERVICE")
                        .build(),
                )
                .filter(filter.clone())
                .set_next_page_token(token);
            async move {
                let output = request.send().await.map_err(|e| {
                    AppError::request(Provider::Aws, DisplayErrorContext(&e).to_string())
                })?;
                Ok(Page {
                    items: rows_from_results(output.results_by_time()),
                    next: output.next_page_token().map(ToString::to_string),
                })
            }
        })
        .await?;

        info!(account = %account.name, rows = rows.len(), "fetched AWS cost rows");
        Ok(rows)
    }

    fn transform_costs(
        &self,
        account: &AwsAccount,
        query: &CostQuery,
        raw: Vec<AwsCostRow>,
        categories: &CategoryMap,
    ) -> Result<Vec<Report>, AppError> {
        let mut acc = ReportAccumulator::new(
            Provider::Aws,
            &account.name,
            account.tags(),
            query.start()?,
            query.granularity,
            Accumulation::Overwrite,
            categories,
        )
        .with_row_dating(RowDating::PeriodStart);

        for row in raw {
            let Ok(date) = NaiveDate::parse_from_str(&row.period_start, "%Y-%m-%d") else {
                warn!(account = %account.name, date = %row.period_start, "skipping AWS row with malformed date");
                continue;
            };
            acc.push(CostRow {
                date,
                amount: parse_amount(Provider::Aws, &row.amount),
                service: row.service,
                dimensions: vec![],
            });
        }

        Ok(acc.finish())
    }
}
