use crate::error::ConfigError;

/// Read an env var, treating unset and blank values alike.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => {
            let value = value.trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be valid UTF-8".to_string(),
        }),
    }
}

/// Env value parsed as a positive integer, falling back to `default`.
pub(crate) fn positive_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = optional_env(key)?
        .map(|s| s.parse::<u64>())
        .transpose()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be a positive integer: {e}"),
        })?
        .unwrap_or(default);
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be > 0".to_string(),
        });
    }
    Ok(value)
}

/// [`positive_u64`] with an inclusive upper bound.
pub(crate) fn bounded_u64(key: &str, default: u64, max: u64) -> Result<u64, ConfigError> {
    let value = positive_u64(key, default)?;
    if value > max {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be at most {max}, got {value}"),
        });
    }
    Ok(value)
}

/// Comma-separated list, blanks dropped.
pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn parse_chain_ids(key: &str, values: &[String]) -> Result<Vec<u64>, ConfigError> {
    values
        .iter()
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{v}' is not a chain id: {e}"),
                })
        })
        .collect()
}

pub(crate) fn normalize_variant(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}
