use crate::config::{AccountRef, AppConfig};
use crate::error::AppError;
use crate::models::{CategoryMap, CostQuery, Provider, Report, TagKeys, TagValues, TagsQuery};
use crate::providers::atlas::AtlasAdapter;
use crate::providers::aws::AwsAdapter;
use crate::providers::azure::AzureAdapter;
use crate::providers::ProviderAdapter;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One sub-account whose cycle failed; other accounts are unaffected.
#[derive(Debug)]
pub struct AccountFailure {
    pub provider: Provider,
    pub account: String,
    pub error: AppError,
}

/// Concatenated results of a fan-out plus the accounts that failed.
#[derive(Debug)]
pub struct FanOut<T> {
    pub items: Vec<T>,
    pub failures: Vec<AccountFailure>,
    pub attempted: usize,
}

impl<T> FanOut<T> {
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.failures.len() == self.attempted
    }
}

pub struct MeterService {
    aws: AwsAdapter,
    azure: AzureAdapter,
    atlas: AtlasAdapter,
}

async fn cost_cycle<A: ProviderAdapter>(
    adapter: &A,
    account: &A::Account,
    query: &CostQuery,
    categories: &CategoryMap,
) -> Result<Vec<Report>, AppError> {
    let handle = adapter.authenticate(account).await?;
    let raw = adapter.fetch_costs(account, &handle, query).await?;
    adapter.transform_costs(account, query, raw, categories)
}

async fn tag_keys_cycle<A: ProviderAdapter>(
    adapter: &A,
    account: &A::Account,
    query: &TagsQuery,
) -> Result<TagKeys, AppError> {
    let handle = adapter.authenticate(account).await?;
    adapter.fetch_tag_keys(account, &handle, query).await
}

async fn tag_values_cycle<A: ProviderAdapter>(
    adapter: &A,
    account: &A::Account,
    query: &TagsQuery,
    tag_key: &str,
) -> Result<TagValues, AppError> {
    let handle = adapter.authenticate(account).await?;
    adapter.fetch_tag_values(account, &handle, query, tag_key).await
}

fn check_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), AppError> {
    if end <= start {
        return Err(AppError::Config("end time must be after start time".into()));
    }
    Ok(())
}

fn selected(cfg: &AppConfig, provider: Option<Provider>) -> Vec<AccountRef<'_>> {
    cfg.accounts()
        .into_iter()
        .filter(|a| provider.map_or(true, |p| p == a.provider()))
        .collect()
}

/// Runs one cycle per account concurrently and splits successes from failures.
async fn fan_out<'a, T, F, Fut>(accounts: Vec<AccountRef<'a>>, label: &str, run: F) -> FanOut<T>
where
    F: Fn(AccountRef<'a>) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<T>, AppError>>,
{
    let attempted = accounts.len();
    let cycles = accounts.into_iter().map(|account| {
        let fut = run(account);
        async move {
            let started = Instant::now();
            info!(provider = %account.provider(), account = account.name(), "{label} cycle started");
            let result = fut.await;
            match &result {
                Ok(items) => info!(
                    provider = %account.provider(),
                    account = account.name(),
                    items = items.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "{label} cycle finished"
                ),
                Err(error) => warn!(
                    provider = %account.provider(),
                    account = account.name(),
                    %error,
                    "{label} cycle failed"
                ),
            }
            (account, result)
        }
    });

    let mut out = FanOut {
        items: Vec::new(),
        failures: Vec::new(),
        attempted,
    };
    for (account, result) in join_all(cycles).await {
        match result {
            Ok(items) => out.items.extend(items),
            Err(error) => out.failures.push(AccountFailure {
                provider: account.provider(),
                account: account.name().to_string(),
                error,
            }),
        }
    }
    out
}

impl MeterService {
    pub fn new() -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            aws: AwsAdapter,
            azure: AzureAdapter::new(client.clone()),
            atlas: AtlasAdapter::new(client),
        }
    }

    /// Fetches and normalizes costs for every selected account.
    ///
    /// Reports are concatenated in configuration order (AWS, Azure, Atlas).
    pub async fn fetch_costs(
        &self,
        cfg: &AppConfig,
        query: &CostQuery,
        provider: Option<Provider>,
    ) -> Result<FanOut<Report>, AppError> {
        check_window(query.start()?, query.end()?)?;
        let categories = cfg.category_map();
        let categories = &categories;

        Ok(fan_out(selected(cfg, provider), "cost", |account| async move {
            match account {
                AccountRef::Aws(a) => cost_cycle(&self.aws, a, query, categories).await,
                AccountRef::Azure(a) => cost_cycle(&self.azure, a, query, categories).await,
                AccountRef::Atlas(a) => cost_cycle(&self.atlas, a, query, categories).await,
            }
        })
        .await)
    }

    pub async fn fetch_tag_keys(
        &self,
        cfg: &AppConfig,
        query: &TagsQuery,
        provider: Option<Provider>,
    ) -> Result<FanOut<TagKeys>, AppError> {
        check_window(query.start()?, query.end()?)?;

        Ok(fan_out(selected(cfg, provider), "tag keys", |account| async move {
            let keys = match account {
                AccountRef::Aws(a) => tag_keys_cycle(&self.aws, a, query).await,
                AccountRef::Azure(a) => tag_keys_cycle(&self.azure, a, query).await,
                AccountRef::Atlas(a) => tag_keys_cycle(&self.atlas, a, query).await,
            };
            keys.map(|k| vec![k])
        })
        .await)
    }

    pub async fn fetch_tag_values(
        &self,
        cfg: &AppConfig,
        query: &TagsQuery,
        tag_key: &str,
        provider: Option<Provider>,
    ) -> Result<FanOut<TagValues>, AppError> {
        check_window(query.start()?, query.end()?)?;

        Ok(fan_out(selected(cfg, provider), "tag values", |account| async move {
            let values = match account {
                AccountRef::Aws(a) => tag_values_cycle(&self.aws, a, query, tag_key).await,
                AccountRef::Azure(a) => tag_values_cycle(&self.azure, a, query, tag_key).await,
                AccountRef::Atlas(a) => tag_values_cycle(&self.atlas, a, query, tag_key).await,
            };
            values.map(|v| vec![v])
        })
        .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AtlasAccount, AzureAccount};
    use crate::models::Granularity;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CSV: &str = "Organization ID,Project Name,Cluster,SKU,Description,Usage Date,Amount\n\
                       org-ok,alpha,c0,ATLAS_AWS_INSTANCE_M10,AWS Instance M10,2024-04-02,4.00\n";

    fn atlas(name: &str, org: &str, base: &str) -> AtlasAccount {
        AtlasAccount {
            name: name.into(),
            org_id: org.into(),
            public_key: "pub".into(),
            private_key: Some("priv".into()),
            base_url: Some(base.into()),
            tags: vec![],
        }
    }

    fn cost_query() -> CostQuery {
        CostQuery {
            start_time: "1711929600000".into(), // 2024-04-01T00:00:00Z
            end_time: "1714521600000".into(),   // 2024-05-01T00:00:00Z
            granularity: Granularity::Daily,
            tags: vec![],
        }
    }

    async fn atlas_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/atlas/v2/orgs/org-ok/invoices"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "results": [{ "id": "inv-1" }] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/atlas/v2/orgs/org-ok/invoices/inv-1/csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CSV))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/atlas/v2/orgs/org-broken/invoices"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;
        server
    }

    fn config(accounts: Vec<AtlasAccount>) -> AppConfig {
        AppConfig {
            categories: HashMap::from([("Atlas/AWS Instance M10".to_string(), "Database".to_string())]),
            atlas: accounts,
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn failing_account_does_not_sink_the_others() {
        let server = atlas_server().await;
        let cfg = config(vec![
            atlas("broken", "org-broken", &server.uri()),
            atlas("ok", "org-ok", &server.uri()),
        ]);

        let svc = MeterService::with_client(Client::new());
        let out = svc
            .fetch_costs(&cfg, &cost_query(), None)
            .await
            .expect("query is valid");

        assert_eq!(out.attempted, 2);
        assert!(!out.all_failed());
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].name, "Atlas/ok");
        assert_eq!(out.items[0].category, "Database");
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].account, "broken");
        assert!(out.failures[0].error.to_string().contains("upstream down"));
    }

    #[tokio::test]
    async fn azure_auth_failure_leaves_other_accounts_running() {
        let server = atlas_server().await;
        let mut cfg = config(vec![atlas("ok", "org-ok", &server.uri())]);
        cfg.azure = vec![AzureAccount {
            name: "main".into(),
            subscription_id: "sub-1".into(),
            tenant_id: "not a tenant".into(),
            client_id: "client".into(),
            client_secret: Some("secret".into()),
            management_url: Some(server.uri()),
            tags: vec![],
        }];

        let svc = MeterService::with_client(Client::new());
        let out = svc
            .fetch_costs(&cfg, &cost_query(), None)
            .await
            .expect("query is valid");

        assert_eq!(out.attempted, 2);
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].name, "Atlas/ok");
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].provider, Provider::Azure);
        assert!(matches!(
            out.failures[0].error,
            AppError::Auth { provider: Provider::Azure, .. }
        ));
    }

    #[tokio::test]
    async fn provider_filter_skips_other_providers() {
        let server = atlas_server().await;
        let cfg = config(vec![atlas("ok", "org-ok", &server.uri())]);
        let svc = MeterService::with_client(Client::new());

        let out = svc
            .fetch_costs(&cfg, &cost_query(), Some(Provider::Azure))
            .await
            .expect("query is valid");
        assert_eq!(out.attempted, 0);
        assert!(out.items.is_empty());
        assert!(!out.all_failed());
    }

    #[tokio::test]
    async fn inverted_window_is_rejected_before_fan_out() {
        let cfg = config(vec![]);
        let svc = MeterService::with_client(Client::new());
        let mut query = cost_query();
        std::mem::swap(&mut query.start_time, &mut query.end_time);

        let err = svc
            .fetch_costs(&cfg, &query, None)
            .await
            .expect_err("inverted window");
        assert!(err.to_string().contains("end time must be after start time"));
    }

    #[tokio::test]
    async fn tag_keys_collect_one_entry_per_account() {
        let cfg = config(vec![
            atlas("a", "org-a", "http://127.0.0.1:9"),
            atlas("b", "org-b", "http://127.0.0.1:9"),
        ]);
        let svc = MeterService::with_client(Client::new());
        let out = svc
            .fetch_tag_keys(
                &cfg,
                &TagsQuery {
                    start_time: "0".into(),
                    end_time: "1".into(),
                },
                Some(Provider::Atlas),
            )
            .await
            .expect("query is valid");

        assert_eq!(out.items.len(), 2);
        assert!(out.items.iter().all(|k| k.provider == Provider::Atlas));
        assert!(out.failures.is_empty());
    }
}
