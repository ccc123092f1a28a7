use cdcsink::cli::run::{prepare_config, RunOptions};
use cdcsink::config::generate::generate_starter_config;
use cdcsink::config::types::{CreateDisposition, ExhaustedPolicy};
use cdcsink::config::{load_config, load_or_default, ConfigError};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn write_config(dir: &TempDir, yaml: &str) -> PathBuf {
    let path = dir.path().join("config.yml");
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn test_generated_config_is_valid() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(&temp_dir, &generate_starter_config());

    let config = load_config(&config_path).expect("Generated config should be valid");

    assert_eq!(config.source.topic, "dbserver1.inventory.customers");
    assert_eq!(config.window.duration, Duration::from_secs(2));
    assert_eq!(config.commit.max_retries, 5);
    assert_eq!(config.commit.on_exhausted, ExhaustedPolicy::Halt);
    assert_eq!(config.sink.create_disposition, CreateDisposition::CreateIfNeeded);
    assert!(config.dead_letter.path.is_none());
}

#[test]
fn test_empty_file_gives_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(&temp_dir, "# nothing here\n");

    let config = load_config(&config_path).unwrap();
    assert_eq!(config.window.duration, Duration::from_secs(2));
    assert_eq!(config.sink.table, "customers_cdc");
    assert_eq!(config.pipeline.channel_capacity, 1000);
}

#[test]
fn test_no_config_file_gives_defaults() {
    let config = load_or_default(None).unwrap();
    assert_eq!(config.source.input, PathBuf::from("samples/customers.jsonl"));
    assert_eq!(config.sink.output, PathBuf::from("output.txt"));
}

#[test]
fn test_event_time_from_ts_ms_by_default() {
    let config = load_or_default(None).unwrap();
    let timestamp = config.source.timestamp.expect("default extracts ts_ms");
    assert_eq!(timestamp.format, "epoch_ms");
    assert!(timestamp.pattern.contains("ts_ms"));

    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(&temp_dir, "source:\n  timestamp: null\n");
    let config = load_config(&config_path).unwrap();
    assert!(config.source.timestamp.is_none());
}

#[test]
fn test_starter_config_has_no_unset_env_refs() {
    // config init output must pass config validate as written
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(&temp_dir, &generate_starter_config());
    assert!(load_config(&config_path).is_ok());
    assert!(!generate_starter_config().contains("$env{"));
}

#[test]
fn test_env_vars_expanded_in_file() {
    std::env::set_var("CDCSINK_IT_TABLE", "orders_cdc");
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        &temp_dir,
        "sink:\n  table: $env{CDCSINK_IT_TABLE}\n  output: out.duckdb\n",
    );

    let config = load_config(&config_path).unwrap();
    std::env::remove_var("CDCSINK_IT_TABLE");

    assert_eq!(config.sink.table, "orders_cdc");
    assert_eq!(config.sink.output, PathBuf::from("out.duckdb"));
}

#[test]
fn test_invalid_values_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        &temp_dir,
        r#"
source:
  pull_batch_size: 0
  timestamp:
    pattern: '"ts_ms":(\d+)'
    format: epoch_ms
commit:
  backpressure_threshold: 0
"#,
    );

    match load_config(&config_path) {
        Err(ConfigError::ValidationList(errors)) => {
            assert_eq!(errors.len(), 3);
            assert!(errors.iter().any(|e| e.contains("pull_batch_size")));
            assert!(errors.iter().any(|e| e.contains("capture group 'ts'")));
            assert!(errors.iter().any(|e| e.contains("backpressure_threshold")));
        }
        other => panic!("expected validation errors, got {:?}", other),
    }
}

#[test]
fn test_unknown_disposition_names_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(&temp_dir, "sink:\n  create_disposition: sometimes\n");

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("config.yml"));
}

#[test]
fn test_missing_file_is_io_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("absent.yml");
    assert!(matches!(load_config(&missing), Err(ConfigError::Io(_))));
}

#[test]
fn test_cli_paths_override_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(
        &temp_dir,
        "source:\n  input: from_file.jsonl\nsink:\n  output: from_file.txt\n",
    );

    let options = RunOptions {
        config: Some(config_path),
        input: None,
        output: Some(PathBuf::from("cli.duckdb")),
    };
    let config = prepare_config(&options).unwrap();

    assert_eq!(config.source.input, PathBuf::from("from_file.jsonl"));
    assert_eq!(config.sink.output, PathBuf::from("cli.duckdb"));
}
