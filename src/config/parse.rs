use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut config = parse_config_str(&raw).map_err(|e| match e {
        ConfigError::YamlParse(err) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), err),
        )),
        other => other,
    })?;

    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Load the config at `path`, or validated defaults when there is none.
pub fn load_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => {
            let config = Config::default();
            validate_config(&config)?;
            Ok(config)
        }
    }
}

/// Parse YAML text after `$env{..}` expansion. Does not validate.
pub fn parse_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;

    // An empty document means "all defaults"
    if yaml.trim().is_empty() {
        return Ok(Config::default());
    }

    Ok(serde_yaml::from_str(&yaml)?)
}

fn check_unexpanded_vars(yaml: &str) -> Result<(), ConfigError> {
    // Comment lines may mention references without them being used
    let mut unexpanded: Vec<String> = yaml
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(|line| env_var_pattern().captures_iter(line))
        .map(|cap| cap[1].to_string())
        .collect();

    if unexpanded.is_empty() {
        return Ok(());
    }

    unexpanded.sort();
    unexpanded.dedup();

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}\n\
         \n\
         Set them (e.g. export {}=...) or replace the $env{{..}} references with literal values",
        unexpanded.join(", "),
        unexpanded[0]
    )))
}

fn expand_paths(config: &mut Config) {
    config.source.input = expand_tilde(&config.source.input);
    config.sink.output = expand_tilde(&config.sink.output);
    if let Some(path) = config.dead_letter.path.as_mut() {
        *path = expand_tilde(path);
    }
}

/// Collects every problem with the config instead of stopping at the first.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.source.topic.trim().is_empty() {
        errors.push("source.topic cannot be empty".to_string());
    }
    if config.source.pull_batch_size == 0 {
        errors.push("source.pull_batch_size must be at least 1".to_string());
    }
    if config.source.retry_backoff_base > config.source.retry_backoff_cap {
        errors.push(
            "source.retry_backoff_base must not exceed source.retry_backoff_cap".to_string(),
        );
    }
    if let Some(ts) = &config.source.timestamp {
        if !ts.pattern.contains("(?P<ts>") {
            errors.push(format!(
                "source.timestamp.pattern '{}' must contain a named capture group 'ts'",
                ts.pattern
            ));
        }
    }

    let window_ms = config.window.duration.as_millis();
    if window_ms == 0 {
        errors.push("window.duration must be at least 1ms".to_string());
    } else if config.window.duration.subsec_nanos() % 1_000_000 != 0 {
        errors.push("window.duration must be a whole number of milliseconds".to_string());
    }

    if config.commit.max_concurrent == 0 {
        errors.push("commit.max_concurrent must be at least 1".to_string());
    }
    if config.commit.backpressure_threshold == 0 {
        errors.push("commit.backpressure_threshold must be at least 1".to_string());
    }
    if config.commit.retry_backoff_base > config.commit.retry_backoff_cap {
        errors.push(
            "commit.retry_backoff_base must not exceed commit.retry_backoff_cap".to_string(),
        );
    }

    if config.sink.max_rows_per_call == 0 {
        errors.push("sink.max_rows_per_call must be at least 1".to_string());
    }
    if !is_valid_identifier(&config.sink.table) {
        errors.push(format!(
            "sink.table '{}' must start with a letter or underscore and contain only letters, digits and underscores",
            config.sink.table
        ));
    }

    if config.pipeline.channel_capacity == 0 {
        errors.push("pipeline.channel_capacity must be at least 1".to_string());
    }
    if config.pipeline.poll_interval.is_zero() {
        errors.push("pipeline.poll_interval must be greater than zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

pub(crate) fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_config_str("").unwrap();
        assert_eq!(config.window.duration, Duration::from_secs(2));
        assert_eq!(config.window.allowed_lateness, Duration::ZERO);
        assert_eq!(config.commit.on_exhausted, ExhaustedPolicy::Halt);
        assert_eq!(config.sink.create_disposition, CreateDisposition::CreateIfNeeded);
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let yaml = r#"
window:
  duration: 5s
commit:
  on_exhausted: quarantine
"#;
        let config = parse_config_str(yaml).unwrap();
        assert_eq!(config.window.duration, Duration::from_secs(5));
        assert_eq!(config.window.allowed_lateness, Duration::ZERO);
        assert_eq!(config.commit.on_exhausted, ExhaustedPolicy::Quarantine);
        assert_eq!(config.commit.max_retries, 5);
    }

    #[test]
    fn test_humantime_durations() {
        let yaml = r#"
window:
  duration: 250ms
  allowed_lateness: 1m
watermark:
  safety_margin: 1s 500ms
  degraded_mode: true
"#;
        let config = parse_config_str(yaml).unwrap();
        assert_eq!(config.window.duration, Duration::from_millis(250));
        assert_eq!(config.window.allowed_lateness, Duration::from_secs(60));
        assert_eq!(config.watermark.safety_margin, Duration::from_millis(1500));
        assert!(config.watermark.degraded_mode);
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let yaml = "commit:\n  on_exhausted: explode\n";
        assert!(matches!(parse_config_str(yaml), Err(ConfigError::YamlParse(_))));
    }

    #[test]
    fn test_unexpanded_env_var_reported() {
        let yaml = "source:\n  topic: $env{CDCSINK_DEFINITELY_UNSET_VAR}\n";
        let err = parse_config_str(yaml).unwrap_err();
        assert!(err.to_string().contains("CDCSINK_DEFINITELY_UNSET_VAR"));
    }

    #[test]
    fn test_env_var_in_comment_ignored() {
        let yaml = "# set $env{CDCSINK_DEFINITELY_UNSET_VAR} to pick the topic\nsource:\n  topic: orders\n";
        let config = parse_config_str(yaml).unwrap();
        assert_eq!(config.source.topic, "orders");
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.window.duration = Duration::ZERO;
        config.commit.max_concurrent = 0;
        config.sink.table = "bad-table".to_string();

        match validate_config(&config) {
            Err(ConfigError::ValidationList(errors)) => {
                assert_eq!(errors.len(), 3);
                assert!(errors.iter().any(|e| e.contains("window.duration")));
                assert!(errors.iter().any(|e| e.contains("max_concurrent")));
                assert!(errors.iter().any(|e| e.contains("bad-table")));
            }
            other => panic!("expected validation list, got {:?}", other),
        }
    }

    #[test]
    fn test_sub_millisecond_window_rejected() {
        let mut config = Config::default();
        config.window.duration = Duration::from_micros(1500);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_valid_identifier("customers_cdc"));
        assert!(is_valid_identifier("_t1"));
        assert!(!is_valid_identifier("1table"));
        assert!(!is_valid_identifier("drop table;"));
        assert!(!is_valid_identifier(""));
    }
}
