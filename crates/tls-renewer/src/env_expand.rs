//! `${VAR}` expansion for configuration strings
//!
//! Lets operators keep the Vault token and address out of the config file:
//! - `${VAR}` - required, error if unset or empty
//! - `${VAR:-default}` - falls back to `default` if unset or empty
//! - `$$` - a literal `$`
//!
//! ```
//! use tls_renewer::env_expand::expand_env_vars;
//!
//! std::env::set_var("DOC_VAULT_ADDR", "https://vault.internal:8200");
//! assert_eq!(
//!     expand_env_vars("${DOC_VAULT_ADDR}").unwrap(),
//!     "https://vault.internal:8200"
//! );
//! assert_eq!(expand_env_vars("${DOC_UNSET_ROLE:-web}").unwrap(), "web");
//! assert!(expand_env_vars("${DOC_UNSET_TOKEN}").is_err());
//! ```

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Upper bound on an expanded value (64 KB)
const MAX_EXPANDED_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvExpandError {
    #[error("environment variable '{name}' is not set")]
    MissingVariable { name: String },

    #[error("environment variable '{name}' is empty")]
    EmptyVariable { name: String },

    #[error("expanded value exceeds maximum size of {MAX_EXPANDED_SIZE} bytes")]
    SizeExceeded,
}

/// Matches `$$` (group 1) or `${NAME}` / `${NAME:-default}` (groups 2 and 3)
static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\$\$)|\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("static pattern is valid")
});

/// Expand environment variable references in `input`
///
/// Escapes and references are resolved in a single left-to-right pass, so
/// `$$` never combines with a following `{` into a reference.
pub fn expand_env_vars(input: &str) -> Result<String, EnvExpandError> {
    let mut result = String::with_capacity(input.len());
    let mut last_end = 0;

    for caps in TOKEN_PATTERN.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        result.push_str(&input[last_end..whole.start()]);
        last_end = whole.end();

        if caps.get(1).is_some() {
            result.push('$');
            continue;
        }

        let Some(name) = caps.get(2).map(|m| m.as_str()) else {
            continue;
        };
        let fallback = caps.get(3).map(|m| m.as_str());

        match (std::env::var(name), fallback) {
            (Ok(value), _) if !value.is_empty() => result.push_str(&value),
            (_, Some(default)) => result.push_str(default),
            (Ok(_), None) => {
                return Err(EnvExpandError::EmptyVariable {
                    name: name.to_string(),
                })
            }
            (Err(_), None) => {
                return Err(EnvExpandError::MissingVariable {
                    name: name.to_string(),
                })
            }
        }

        if result.len() > MAX_EXPANDED_SIZE {
            return Err(EnvExpandError::SizeExceeded);
        }
    }

    result.push_str(&input[last_end..]);
    if result.len() > MAX_EXPANDED_SIZE {
        return Err(EnvExpandError::SizeExceeded);
    }
    Ok(result)
}
