use crate::models::Provider;
use tracing::debug;

const AWS_PREFIXES: &[&str] = &["Amazon", "AWS"];
const AZURE_PREFIXES: &[&str] = &["Azure"];
const ATLAS_PREFIXES: &[&str] = &["Atlas"];

const AWS_ALIASES: &[(&str, &str)] = &[
    ("Elastic Compute Cloud - Compute", "EC2 - Instances"),
    ("EC2 - Other", "EC2 - Other (Volumes, Snapshots, NAT)"),
    ("Simple Storage Service", "S3 (Simple Storage Service)"),
    ("Relational Database Service", "RDS (Relational Database Service)"),
    (
        "Elastic Container Service for Kubernetes",
        "EKS (Elastic Kubernetes Service)",
    ),
    ("Elastic Container Service", "ECS (Elastic Container Service)"),
    ("EC2 Container Registry (ECR)", "ECR (Elastic Container Registry)"),
    ("Elastic Load Balancing", "ELB (Elastic Load Balancing)"),
    ("Virtual Private Cloud", "VPC (Virtual Private Cloud)"),
    ("Simple Queue Service", "SQS (Simple Queue Service)"),
    ("Simple Notification Service", "SNS (Simple Notification Service)"),
    ("Key Management Service", "KMS (Key Management Service)"),
    ("Elastic File System", "EFS (Elastic File System)"),
    ("CloudWatch", "CloudWatch"),
];

const AZURE_ALIASES: &[(&str, &str)] = &[
    ("Virtual Machines", "VMs (Virtual Machines)"),
    ("Kubernetes Service", "AKS (Kubernetes Service)"),
    ("Virtual Network", "VNet (Virtual Network)"),
    ("Database for PostgreSQL", "PostgreSQL Database"),
    ("Database for MySQL", "MySQL Database"),
    ("Container Registry", "ACR (Container Registry)"),
    ("Monitor", "Monitor (Logs & Metrics)"),
];

const ATLAS_ALIASES: &[(&str, &str)] = &[
    ("Backup Snapshot Storage", "Backup Storage"),
    ("Data Transfer (Same Region)", "Data Transfer - Same Region"),
    ("Data Transfer (Internet)", "Data Transfer - Internet"),
];

fn prefixes(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::Aws => AWS_PREFIXES,
        Provider::Azure => AZURE_PREFIXES,
        Provider::Atlas => ATLAS_PREFIXES,
    }
}

fn aliases(provider: Provider) -> &'static [(&'static str, &'static str)] {
    match provider {
        Provider::Aws => AWS_ALIASES,
        Provider::Azure => AZURE_ALIASES,
        Provider::Atlas => ATLAS_ALIASES,
    }
}

fn strip_prefix(provider: Provider, raw_name: &str) -> &str {
    let trimmed = raw_name.trim();
    prefixes(provider)
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Turns a vendor service name into `"<provider>/<display name>"`.
pub fn canonicalize(provider: Provider, raw_name: &str) -> String {
    let stripped = strip_prefix(provider, raw_name);
    let display = match aliases(provider)
        .iter()
        .find(|(from, _)| *from == stripped)
    {
        Some((_, alias)) => *alias,
        None => {
            debug!(provider = %provider, service = raw_name, "no alias for service name");
            stripped
        }
    };
    format!("{}/{}", provider.as_label(), display)
}
