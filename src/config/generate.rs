pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# CDCSINK CONFIGURATION
# =============================================================================
# cdcsink reads change-data-capture messages from a topic, groups them into
# fixed-size event-time windows and appends each closed window to an
# analytical table as one batch.
#
# Every section is optional; omitted keys fall back to the defaults shown.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/cdcsink/config.yml
#   3. /etc/cdcsink/config.yml
#
# Environment references of the form $env followed by {NAME} are
# expanded before parsing.

# =============================================================================
# SOURCE
# =============================================================================
source:
  topic: dbserver1.inventory.customers
  # Newline-delimited file read as a finite topic (overridden by --input)
  input: samples/customers.jsonl
  # Event-time extraction. Set 'timestamp: null' to use read time instead.
  # Regex must contain a named capture group 'ts'.
  # Format: strptime format string, 'iso8601', 'epoch', or 'epoch_ms'
  timestamp:
    pattern: '"ts_ms":\s*(?P<ts>\d+)'
    format: epoch_ms
  pull_batch_size: 100
  poll_interval: 100ms
  # Source unavailability is retried with exponential backoff, then fatal
  max_unavailable_retries: 5
  retry_backoff_base: 500ms
  retry_backoff_cap: 30s

# =============================================================================
# WINDOWING
# =============================================================================
window:
  # Tumbling window size
  duration: 2s
  # Grace period after a window's end during which late messages still join it
  allowed_lateness: 0s

watermark:
  # Subtracted from the computed watermark
  safety_margin: 0s
  # When the source gives no low-watermark hint, advance by wall-clock time
  # instead of observed event time. Trades correctness for liveness.
  degraded_mode: false

# =============================================================================
# TRANSFORM
# =============================================================================
transform:
  # Reject payloads that are valid UTF-8 but not JSON
  require_json: false

# =============================================================================
# COMMIT
# =============================================================================
commit:
  # Retries after the first attempt for transient sink failures
  max_retries: 5
  retry_backoff_base: 200ms
  retry_backoff_cap: 10s
  # Windows committed concurrently
  max_concurrent: 4
  # Commits in retry at which intake pauses
  backpressure_threshold: 2
  # 'halt' stops the pipeline with a non-zero exit;
  # 'quarantine' writes the window to the dead-letter path and continues
  on_exhausted: halt

# =============================================================================
# SINK
# =============================================================================
sink:
  # *.duckdb / *.db writes to a DuckDB table, anything else to a JSON-lines file
  output: output.txt
  table: customers_cdc
  # 'create_if_needed' or 'create_never'
  create_disposition: create_if_needed
  max_rows_per_call: 500

# =============================================================================
# DEAD LETTER
# =============================================================================
dead_letter:
  # JSON-lines file for malformed, late and quarantined messages,
  # e.g. dead_letter.jsonl. null drops them with a log line.
  path: null

# =============================================================================
# PIPELINE
# =============================================================================
pipeline:
  channel_capacity: 1000
  # How often the window buffer is checked for closed windows
  poll_interval: 100ms
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse::{parse_config_str, validate_config};
    use std::time::Duration;

    #[test]
    fn test_starter_config_parses_and_validates() {
        let config = parse_config_str(&generate_starter_config()).unwrap();
        validate_config(&config).unwrap();

        assert_eq!(config.source.topic, "dbserver1.inventory.customers");
        assert_eq!(config.window.duration, Duration::from_secs(2));
        assert_eq!(config.sink.table, "customers_cdc");
        assert!(config.dead_letter.path.is_none());
        assert_eq!(config.source.timestamp.unwrap().format, "epoch_ms");
    }
}
