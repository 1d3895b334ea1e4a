use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn home_path(home: &TempDir) -> &Path {
    home.path()
}

fn bin_path() -> &'static str {
    env!("CARGO_BIN_EXE_cloud-meter")
}

fn run_cmd(home: &TempDir, args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .env("CLOUD_METER_HOME", home_path(home))
        .env_remove("RUST_LOG")
        .output()
        .expect("run cloud-meter command")
}

fn config_file(home: &TempDir) -> PathBuf {
    home.path().join("config").join("config.toml")
}

fn write_config(home: &TempDir, raw: &str) {
    fs::create_dir_all(home.path().join("config")).expect("create config dir");
    fs::write(config_file(home), raw).expect("write config");
}

// 2024-04-01T00:00:00Z and 2024-05-01T00:00:00Z
const START: &str = "1711929600000";
const END: &str = "1714521600000";

#[test]
fn init_creates_config_and_data_paths() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["init"]);
    assert!(output.status.success());

    assert!(home.path().join("config").exists());
    assert!(home.path().join("data").exists());
    assert!(config_file(&home).exists());
}

#[test]
fn init_is_idempotent() {
    let home = TempDir::new().expect("temp home");

    assert!(run_cmd(&home, &["init"]).status.success());
    let first = fs::read_to_string(config_file(&home)).expect("read config after first init");

    assert!(run_cmd(&home, &["init"]).status.success());
    let second = fs::read_to_string(config_file(&home)).expect("read config after second init");

    assert_eq!(first, second);
}

#[test]
fn costs_rejects_invalid_granularity() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(
        &home,
        &["costs", "--start", START, "--end", END, "--granularity", "hourly"],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unsupported granularity. Use daily or monthly."));
}

#[test]
fn costs_rejects_non_numeric_start() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["costs", "--start", "yesterday", "--end", END]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("start_time must be epoch milliseconds"));
}

#[test]
fn costs_without_accounts_prints_empty_json_array() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["costs", "--start", START, "--end", END]);
    assert!(output.status.success());

    let parsed: Value = serde_json::from_slice(&output.stdout).expect("valid json output");
    assert_eq!(parsed.as_array().map(Vec::len), Some(0));
}

#[test]
fn costs_csv_without_accounts_prints_header_only() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(
        &home,
        &["costs", "--start", START, "--end", END, "--format", "csv", "--quiet"],
    );
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        "id,name,service,category,provider,period,amount,attributes"
    );
}

#[test]
fn accounts_lists_configured_accounts_with_trimmed_names() {
    let home = TempDir::new().expect("temp home");
    write_config(
        &home,
        r#"
[[aws]]
name = " prod "
account_id = "123456789012"
assumed_role_name = "billing-reader"

[[atlas]]
name = "mongo"
org_id = "org-1"
public_key = "pub"
private_key = "priv"
"#,
    );

    let output = run_cmd(&home, &["accounts"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("AWS\tprod"));
    assert!(stdout.contains("Atlas\tmongo"));

    let rewritten = fs::read_to_string(config_file(&home)).expect("read normalized config");
    assert!(rewritten.contains("name = \"prod\""));
}

#[test]
fn duplicate_account_names_are_rejected() {
    let home = TempDir::new().expect("temp home");
    write_config(
        &home,
        r#"
[[atlas]]
name = "mongo"
org_id = "org-1"
public_key = "pub"

[[atlas]]
name = "mongo"
org_id = "org-2"
public_key = "pub"
"#,
    );

    let output = run_cmd(&home, &["accounts"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("duplicate Atlas account name 'mongo'"));
}

#[test]
fn costs_exits_non_zero_when_every_account_fails() {
    let home = TempDir::new().expect("temp home");
    write_config(
        &home,
        r#"
[[atlas]]
name = "mongo"
org_id = "org-1"
public_key = "pub"
private_key = "priv"
base_url = "http://127.0.0.1:9"
"#,
    );

    let output = run_cmd(&home, &["costs", "--start", START, "--end", END, "--quiet"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Atlas account 'mongo' failed"));
    assert!(stderr.contains("AllAccountsFailed"));

    let parsed: Value = serde_json::from_slice(&output.stdout).expect("valid json output");
    assert_eq!(parsed.as_array().map(Vec::len), Some(0));
}

#[test]
fn set_secret_rejects_unknown_field() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(
        &home,
        &["set-secret", "azure", "main", "password", "--value", "x"],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unsupported secret field 'password' for Azure"));
}
