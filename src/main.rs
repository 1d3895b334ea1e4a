mod canonical;
mod config;
mod error;
mod filters;
mod models;
mod pagination;
mod providers;
mod retry;
mod service;
mod transform;

use clap::{Parser, Subcommand};
use config::{config_path, ensure_initialized, load_config, set_secret};
use error::AppError;
use models::{CostQuery, Granularity, Provider, Report, TagsQuery};
use service::{FanOut, MeterService};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "cloud-meter")]
#[command(about = "Normalized cost reports across AWS, Azure and MongoDB Atlas")]
struct Cli {
    /// Only log warnings and errors
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    /// Store an account credential in the OS keyring
    SetSecret {
        provider: String,
        account: String,
        field: String,
        #[arg(long)]
        value: String,
    },
    Accounts,
    TagKeys {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        provider: Option<String>,
    },
    TagValues {
        key: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        provider: Option<String>,
    },
    Costs {
        /// Start of the window, epoch milliseconds
        #[arg(long)]
        start: String,
        /// End of the window, epoch milliseconds
        #[arg(long)]
        end: String,
        #[arg(long, default_value = "daily")]
        granularity: String,
        /// `key:value` filter; repeated tags are ORed
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Csv,
}

fn validate_granularity(input: &str) -> Result<Granularity, AppError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "daily" => Ok(Granularity::Daily),
        "monthly" => Ok(Granularity::Monthly),
        _ => Err(AppError::Config(
            "Unsupported granularity. Use daily or monthly.".into(),
        )),
    }
}

fn validate_format(input: &str) -> Result<OutputFormat, AppError> {
    if input.eq_ignore_ascii_case("json") {
        Ok(OutputFormat::Json)
    } else if input.eq_ignore_ascii_case("csv") {
        Ok(OutputFormat::Csv)
    } else {
        Err(AppError::Config(
            "Unsupported output format. Use json or csv.".into(),
        ))
    }
}

fn validate_provider(input: Option<&str>) -> Result<Option<Provider>, AppError> {
    input
        .map(|raw| {
            Provider::parse(raw).ok_or_else(|| {
                AppError::Config(format!(
                    "Unsupported provider '{raw}'. Use aws, azure, or atlas."
                ))
            })
        })
        .transpose()
}

fn validate_secret_field(provider: Provider, field: &str) -> Result<(), AppError> {
    let allowed: &[&str] = match provider {
        Provider::Aws => &["secret_access_key"],
        Provider::Azure => &["client_secret"],
        Provider::Atlas => &["private_key"],
    };
    if allowed.contains(&field) {
        Ok(())
    } else {
        Err(AppError::Config(format!(
            "Unsupported secret field '{field}' for {provider}. Use {}.",
            allowed.join(", ")
        )))
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// One line per report and period, attributes packed as `key=value;...`.
fn reports_csv(reports: &[Report]) -> String {
    let mut out = String::from("id,name,service,category,provider,period,amount,attributes\n");
    for r in reports {
        let attributes = r
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";");
        for (period, amount) in &r.reports {
            out.push_str(&format!(
                "{},{},{},{},{},{},{:.8},{}\n",
                csv_field(&r.id),
                csv_field(&r.name),
                csv_field(&r.service),
                csv_field(&r.category),
                r.provider,
                period,
                amount,
                csv_field(&attributes),
            ));
        }
    }
    out
}

/// Prints per-account failures to stderr; errors only when every account failed.
fn report_failures<T>(out: &FanOut<T>) -> Result<(), AppError> {
    for failure in &out.failures {
        eprintln!(
            "{} account '{}' failed: {}",
            failure.provider, failure.account, failure.error
        );
    }
    if out.all_failed() {
        return Err(AppError::AllAccountsFailed {
            attempted: out.attempted,
        });
    }
    Ok(())
}

fn init_tracing(quiet: bool) {
    let filter = if quiet {
        tracing_subscriber::EnvFilter::new("warn")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cloud_meter=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!(
                "Initialized cloud-meter config at {}.",
                config_path()?.display()
            );
        }
        Commands::SetSecret {
            provider,
            account,
            field,
            value,
        } => {
            let provider = validate_provider(Some(&provider))?.ok_or_else(|| {
                AppError::Config("A provider is required.".into())
            })?;
            validate_secret_field(provider, &field)?;
            set_secret(provider, &account, &field, &value)?;
            println!("Stored {field} for {provider} account '{}'.", account.trim());
        }
        Commands::Accounts => {
            ensure_initialized()?;
            let cfg = load_config()?;
            for account in cfg.accounts() {
                println!("{}\t{}", account.provider(), account.name());
            }
        }
        Commands::TagKeys {
            start,
            end,
            provider,
        } => {
            ensure_initialized()?;
            let provider = validate_provider(provider.as_deref())?;
            let cfg = load_config()?;
            let query = TagsQuery {
                start_time: start,
                end_time: end,
            };
            let out = MeterService::new()?
                .fetch_tag_keys(&cfg, &query, provider)
                .await?;
            println!("{}", serde_json::to_string_pretty(&out.items)?);
            report_failures(&out)?;
        }
        Commands::TagValues {
            key,
            start,
            end,
            provider,
        } => {
            ensure_initialized()?;
            let provider = validate_provider(provider.as_deref())?;
            let cfg = load_config()?;
            let query = TagsQuery {
                start_time: start,
                end_time: end,
            };
            let out = MeterService::new()?
                .fetch_tag_values(&cfg, &query, &key, provider)
                .await?;
            println!("{}", serde_json::to_string_pretty(&out.items)?);
            report_failures(&out)?;
        }
        Commands::Costs {
            start,
            end,
            granularity,
            tags,
            provider,
            format,
        } => {
            ensure_initialized()?;
            let granularity = validate_granularity(&granularity)?;
            let format = validate_format(&format)?;
            let provider = validate_provider(provider.as_deref())?;
            let cfg = load_config()?;
            let query = CostQuery {
                start_time: start,
                end_time: end,
                granularity,
                tags,
            };
            tracing::info!(
                granularity = granularity.as_label(),
                tags = query.tags.len(),
                "fetching costs"
            );

            let out = MeterService::new()?
                .fetch_costs(&cfg, &query, provider)
                .await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&out.items)?),
                OutputFormat::Csv => print!("{}", reports_csv(&out.items)),
            }
            report_failures(&out)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn validate_granularity_accepts_known_values() {
        assert_eq!(validate_granularity("daily").ok(), Some(Granularity::Daily));
        assert_eq!(validate_granularity("Monthly").ok(), Some(Granularity::Monthly));
    }

    #[test]
    fn validate_granularity_rejects_unknown_values() {
        let err = validate_granularity("hourly").expect_err("expected validation error");
        assert!(err.to_string().contains("Unsupported granularity"));
    }

    #[test]
    fn validate_provider_is_case_insensitive() {
        assert_eq!(validate_provider(Some("aws")).ok(), Some(Some(Provider::Aws)));
        assert_eq!(validate_provider(Some("ATLAS")).ok(), Some(Some(Provider::Atlas)));
        assert_eq!(validate_provider(None).ok(), Some(None));
        assert!(validate_provider(Some("gcp")).is_err());
    }

    #[test]
    fn secret_fields_are_checked_per_provider() {
        assert!(validate_secret_field(Provider::Azure, "client_secret").is_ok());
        let err = validate_secret_field(Provider::Atlas, "client_secret").expect_err("wrong field");
        assert!(err.to_string().contains("private_key"));
    }

    #[test]
    fn csv_field_escapes_special_characters() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("a\"b"), "\"a\"\"b\"");
        assert_eq!(csv_field("a\nb"), "\"a\nb\"");
    }

    #[test]
    fn reports_csv_emits_one_line_per_period() {
        let report = Report {
            id: "prod/Amazon Elastic Compute Cloud - Compute".into(),
            name: "AWS/prod".into(),
            service: "AWS/EC2 - Instances".into(),
            category: "Compute, General".into(),
            provider: Provider::Aws,
            reports: BTreeMap::from([("2024-04".to_string(), 100.0), ("2024-05".to_string(), 120.5)]),
            attributes: BTreeMap::from([("team".to_string(), "core".to_string())]),
        };
        let csv = reports_csv(&[report]);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[1],
            "prod/Amazon Elastic Compute Cloud - Compute,AWS/prod,AWS/EC2 - Instances,\"Compute, General\",AWS,2024-04,100.00000000,team=core"
        );
        assert!(lines[2].contains("2024-05,120.50000000"));
    }
}
