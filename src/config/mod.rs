pub mod generate;
pub mod parse;
pub mod types;

use regex::{Captures, Regex};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub use parse::{load_config, load_or_default, ConfigError};
pub use types::Config;

/// Matches `$env{VAR_NAME}` references inside the raw YAML text.
pub(crate) fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
    })
}

/// Expands `$env{VAR_NAME}` references in a string.
///
/// Unset variables are left untouched so validation can report them.
pub fn expand_env_vars(text: &str) -> String {
    env_var_pattern()
        .replace_all(text, |caps: &Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };

    match dirs::home_dir() {
        Some(home) if rest.as_os_str().is_empty() => home,
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Resolves the config file path.
///
/// Returns the first existing path from:
/// 1. Explicit path (if provided, with tilde expansion)
/// 2. ~/.config/cdcsink/config.yml
/// 3. /etc/cdcsink/config.yml
///
/// `None` means the built-in defaults apply.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/cdcsink/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/cdcsink/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_in_topic() {
        std::env::set_var("CDCSINK_TEST_TOPIC", "orders");
        let result = expand_env_vars("dbserver1.$env{CDCSINK_TEST_TOPIC}.cdc");
        assert_eq!(result, "dbserver1.orders.cdc");
        std::env::remove_var("CDCSINK_TEST_TOPIC");
    }

    #[test]
    fn test_expand_env_vars_partial() {
        std::env::set_var("CDCSINK_TEST_DIR", "/data");
        let result = expand_env_vars("$env{CDCSINK_TEST_DIR}/$env{CDCSINK_TEST_UNSET}");
        assert_eq!(result, "/data/$env{CDCSINK_TEST_UNSET}");
        std::env::remove_var("CDCSINK_TEST_DIR");
    }

    #[test]
    fn test_expand_env_vars_leaves_regex_alone() {
        let result = expand_env_vars(r#""ts_ms":(?P<ts>\d+) ${not_env}"#);
        assert_eq!(result, r#""ts_ms":(?P<ts>\d+) ${not_env}"#);
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/out.duckdb")), home.join("out.duckdb"));
            assert_eq!(expand_tilde(Path::new("~")), home);
        }
        assert_eq!(expand_tilde(Path::new("/abs/out.txt")), Path::new("/abs/out.txt"));
        assert_eq!(expand_tilde(Path::new("rel/out.txt")), Path::new("rel/out.txt"));
    }

    #[test]
    fn test_resolve_config_path_explicit_wins() {
        let resolved = resolve_config_path(Some(Path::new("/tmp/explicit.yml")));
        assert_eq!(resolved, Some(PathBuf::from("/tmp/explicit.yml")));
    }
}
