use crate::config::AccountSettings;
use crate::error::AppError;
use crate::models::{CategoryMap, CostQuery, Provider, Report, TagKeys, TagValues, TagsQuery};
use async_trait::async_trait;

pub mod atlas;
pub mod aws;
pub mod azure;

/// One billing provider: authentication, tag discovery, cost fetch and the
/// transform from its native rows into [`Report`]s.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    type Account: AccountSettings + Send + Sync;
    /// Authenticated client state for one sub-account's cycle.
    type Handle: Send + Sync;
    /// Provider-native cost rows, consumed only by `transform_costs`.
    type RawCosts: Send;

    fn provider(&self) -> Provider;

    async fn authenticate(&self, account: &Self::Account) -> Result<Self::Handle, AppError>;

    async fn fetch_tag_keys(
        &self,
        account: &Self::Account,
        handle: &Self::Handle,
        query: &TagsQuery,
    ) -> Result<TagKeys, AppError>;

    async fn fetch_tag_values(
        &self,
        account: &Self::Account,
        handle: &Self::Handle,
        query: &TagsQuery,
        tag_key: &str,
    ) -> Result<TagValues, AppError>;

    async fn fetch_costs(
        &self,
        account: &Self::Account,
        handle: &Self::Handle,
        query: &CostQuery,
    ) -> Result<Self::RawCosts, AppError>;

    fn transform_costs(
        &self,
        account: &Self::Account,
        query: &CostQuery,
        raw: Self::RawCosts,
        categories: &CategoryMap,
    ) -> Result<Vec<Report>, AppError>;

    fn auth_error(&self, account: &Self::Account, message: impl Into<String>) -> AppError
    where
        Self: Sized,
    {
        AppError::Auth {
            provider: self.provider(),
            account: account.name().to_string(),
            message: message.into(),
        }
    }
}
