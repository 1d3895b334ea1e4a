use crate::error::AppError;
use crate::models::{CategoryMap, Provider, DEFAULT_CATEGORY};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "cloud-meter";

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("CLOUD_METER_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("com", "cloudmeter", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".cloud-meter"))
}

/// Fields every sub-account carries regardless of provider.
pub trait AccountSettings {
    fn name(&self) -> &str;
    fn tags(&self) -> &[String];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwsAccount {
    pub name: String,
    pub account_id: String,
    pub assumed_role_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AzureAccount {
    pub name: String,
    pub subscription_id: String,
    pub tenant_id: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AtlasAccount {
    pub name: String,
    pub org_id: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

macro_rules! account_settings {
    ($($ty:ty),*) => {
        $(impl AccountSettings for $ty {
            fn name(&self) -> &str {
                &self.name
            }

            fn tags(&self) -> &[String] {
                &self.tags
            }
        })*
    };
}

account_settings!(AwsAccount, AzureAccount, AtlasAccount);

/// A configured sub-account of any provider.
#[derive(Debug, Clone, Copy)]
pub enum AccountRef<'a> {
    Aws(&'a AwsAccount),
    Azure(&'a AzureAccount),
    Atlas(&'a AtlasAccount),
}

impl AccountRef<'_> {
    pub fn provider(&self) -> Provider {
        match self {
            AccountRef::Aws(_) => Provider::Aws,
            AccountRef::Azure(_) => Provider::Azure,
            AccountRef::Atlas(_) => Provider::Atlas,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AccountRef::Aws(a) => a.name(),
            AccountRef::Azure(a) => a.name(),
            AccountRef::Atlas(a) => a.name(),
        }
    }

    pub fn tags(&self) -> &[String] {
        match self {
            AccountRef::Aws(a) => a.tags(),
            AccountRef::Azure(a) => a.tags(),
            AccountRef::Atlas(a) => a.tags(),
        }
    }
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_category")]
    pub default_category: String,
    #[serde(default)]
    pub categories: HashMap<String, String>,
    #[serde(default)]
    pub aws: Vec<AwsAccount>,
    #[serde(default)]
    pub azure: Vec<AzureAccount>,
    #[serde(default)]
    pub atlas: Vec<AtlasAccount>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_category: default_category(),
            categories: HashMap::new(),
            aws: vec![],
            azure: vec![],
            atlas: vec![],
        }
    }
}

impl AppConfig {
    pub fn accounts(&self) -> Vec<AccountRef<'_>> {
        self.aws
            .iter()
            .map(AccountRef::Aws)
            .chain(self.azure.iter().map(AccountRef::Azure))
            .chain(self.atlas.iter().map(AccountRef::Atlas))
            .collect()
    }

    pub fn category_map(&self) -> CategoryMap {
        CategoryMap::new(self.categories.clone(), self.default_category.clone())
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

fn normalize_account(name: &mut String, tags: &mut Vec<String>) -> bool {
    let mut changed = false;

    let trimmed = name.trim();
    if trimmed != name {
        *name = trimmed.to_string();
        changed = true;
    }

    let mut seen = HashSet::new();
    let before = tags.len();
    tags.retain(|t| seen.insert(t.trim().to_string()));
    for tag in tags.iter_mut() {
        let trimmed = tag.trim();
        if trimmed != tag {
            *tag = trimmed.to_string();
            changed = true;
        }
    }
    changed || tags.len() != before
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = false;
    for a in &mut config.aws {
        changed |= normalize_account(&mut a.name, &mut a.tags);
    }
    for a in &mut config.azure {
        changed |= normalize_account(&mut a.name, &mut a.tags);
    }
    for a in &mut config.atlas {
        changed |= normalize_account(&mut a.name, &mut a.tags);
    }
    changed
}

/// Report fields that static tags would shadow in the flattened JSON.
const RESERVED_TAG_KEYS: &[&str] = &["id", "name", "service", "category", "provider", "reports"];
/// Attributes Atlas fills from invoice columns.
const ATLAS_DIMENSION_KEYS: &[&str] = &["sku", "project", "cluster"];

fn validate_tags(account: AccountRef<'_>) -> Result<(), AppError> {
    for tag in account.tags() {
        let key = tag.split_once(':').map_or(tag.as_str(), |(k, _)| k).trim();
        let reserved = RESERVED_TAG_KEYS.contains(&key)
            || (account.provider() == Provider::Atlas && ATLAS_DIMENSION_KEYS.contains(&key));
        if reserved {
            return Err(AppError::Config(format!(
                "{} account '{}' uses reserved tag key '{key}'",
                account.provider(),
                account.name()
            )));
        }
    }
    Ok(())
}

fn validate_config(config: &AppConfig) -> Result<(), AppError> {
    let mut seen = HashSet::new();
    for account in config.accounts() {
        validate_tags(account)?;
        if account.name().is_empty() {
            return Err(AppError::Config(format!(
                "{} account with an empty name",
                account.provider()
            )));
        }
        if !seen.insert((account.provider(), account.name().to_string())) {
            return Err(AppError::Config(format!(
                "duplicate {} account name '{}'",
                account.provider(),
                account.name()
            )));
        }
    }
    Ok(())
}

pub fn parse_config(raw: &str) -> Result<(AppConfig, bool), AppError> {
    let mut parsed: AppConfig = toml::from_str(raw)?;
    let normalized = normalize_config(&mut parsed);
    validate_config(&parsed)?;
    Ok((parsed, normalized))
}

pub fn load_config() -> Result<AppConfig, AppError> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let raw_str = fs::read_to_string(&path)?;
    let (parsed, normalized) = parse_config(&raw_str)?;

    // Persist normalized account names and tags.
    if normalized {
        save_config(&parsed)?;
    }

    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

fn keyring_user(provider: Provider, account: &str, field: &str) -> String {
    format!(
        "{}:{}:{}",
        provider.as_label().to_ascii_lowercase(),
        account.trim(),
        field
    )
}

fn secret_env_name(account: &str, field: &str) -> String {
    let account: String = account
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("CLOUD_METER_{}_{}", account, field.to_ascii_uppercase())
}

pub fn set_secret(provider: Provider, account: &str, field: &str, value: &str) -> Result<(), AppError> {
    let entry = keyring::Entry::new(SERVICE_NAME, &keyring_user(provider, account, field))?;
    entry.set_password(value)?;
    Ok(())
}

/// Resolves a credential: inline config value, then keyring, then env var.
pub fn resolve_secret(
    provider: Provider,
    account: &str,
    field: &str,
    inline: Option<&str>,
) -> Result<String, AppError> {
    if let Some(value) = inline.filter(|v| !v.is_empty()) {
        return Ok(value.to_string());
    }

    let entry = keyring::Entry::new(SERVICE_NAME, &keyring_user(provider, account, field))?;
    if let Ok(value) = entry.get_password() {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    let env_name = secret_env_name(account, field);
    if let Ok(value) = std::env::var(&env_name) {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    Err(AppError::Config(format!(
        "No {field} found for {provider} account '{account}'. Set it in config, the keyring, or {env_name}."
    )))
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default_category = "Other"

[categories]
"AWS/EC2 - Instances" = "Compute"

[[aws]]
name = " prod "
account_id = "123456789012"
assumed_role_name = "billing-reader"
tags = ["team:core", "team:core"]

[[azure]]
name = "main"
subscription_id = "sub-1"
tenant_id = "tenant"
client_id = "client"
client_secret = "shh"

[[atlas]]
name = "mongo"
org_id = "org-1"
public_key = "pub"
base_url = "http://localhost:9999"
"#;

    #[test]
    fn parse_config_reads_all_providers_and_normalizes() {
        let (cfg, normalized) = parse_config(SAMPLE).expect("sample parses");
        assert!(normalized);
        assert_eq!(cfg.aws[0].name, "prod");
        assert_eq!(cfg.aws[0].tags, vec!["team:core".to_string()]);
        assert_eq!(cfg.azure[0].client_secret.as_deref(), Some("shh"));
        assert_eq!(cfg.atlas[0].base_url.as_deref(), Some("http://localhost:9999"));
        assert_eq!(cfg.category_map().category_for("AWS/EC2 - Instances"), "Compute");
        assert_eq!(cfg.category_map().category_for("AWS/Glue"), "Other");

        let providers: Vec<Provider> = cfg.accounts().iter().map(|a| a.provider()).collect();
        assert_eq!(providers, vec![Provider::Aws, Provider::Azure, Provider::Atlas]);
    }

    #[test]
    fn parse_config_defaults_when_empty() {
        let (cfg, normalized) = parse_config("").expect("empty config parses");
        assert!(!normalized);
        assert_eq!(cfg, AppConfig::default());
        assert!(cfg.accounts().is_empty());
    }

    #[test]
    fn parse_config_rejects_duplicate_account_names() {
        let raw = r#"
[[atlas]]
name = "mongo"
org_id = "a"
public_key = "p"

[[atlas]]
name = " mongo"
org_id = "b"
public_key = "q"
"#;
        let err = parse_config(raw).expect_err("duplicate names rejected");
        assert!(err.to_string().contains("duplicate Atlas account name 'mongo'"));
    }

    #[test]
    fn parse_config_rejects_tags_shadowing_report_fields() {
        let raw = r#"
[[azure]]
name = "main"
subscription_id = "sub-1"
tenant_id = "tenant"
client_id = "client"
tags = ["env:prod", "provider:gcp"]
"#;
        let err = parse_config(raw).expect_err("reserved key rejected");
        assert!(err
            .to_string()
            .contains("Azure account 'main' uses reserved tag key 'provider'"));

        let atlas = r#"
[[atlas]]
name = "mongo"
org_id = "org-1"
public_key = "pub"
tags = ["project:shared"]
"#;
        let err = parse_config(atlas).expect_err("dimension key rejected for Atlas");
        assert!(err.to_string().contains("reserved tag key 'project'"));

        let aws = r#"
[[aws]]
name = "prod"
account_id = "123456789012"
assumed_role_name = "billing-reader"
tags = ["project:shared", "names:ok"]
"#;
        assert!(parse_config(aws).is_ok());
    }

    #[test]
    fn inline_secret_wins() {
        let secret = resolve_secret(Provider::Azure, "main", "client_secret", Some("inline"))
            .expect("inline secret resolves");
        assert_eq!(secret, "inline");
    }

    #[test]
    fn secret_env_name_is_upper_snake() {
        assert_eq!(
            secret_env_name("prod-eu 1", "private_key"),
            "CLOUD_METER_PROD_EU_1_PRIVATE_KEY"
        );
        assert_eq!(
            keyring_user(Provider::Aws, "prod", "secret_access_key"),
            "aws:prod:secret_access_key"
        );
    }
}
