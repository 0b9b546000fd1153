use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::str::FromStr;

/// JSON serialization/parsing error handling utilities
///
/// Serialize data to pretty JSON with contextual error handling
pub fn serialize_to_json_with_context<T: Serialize>(data: &T, data_desc: &str) -> Result<String> {
    serde_json::to_string_pretty(data)
        .with_context(|| format!("Failed to serialize {data_desc} to JSON"))
}

/// Parse JSON from string with contextual error handling
pub fn parse_json_with_context<T: DeserializeOwned>(json_str: &str, data_desc: &str) -> Result<T> {
    serde_json::from_str(json_str).with_context(|| format!("Failed to parse {data_desc} from JSON"))
}

/// Environment variable handling utilities
///
/// Get required environment variable with contextual error handling
pub fn get_required_env_var(var_name: &str) -> Result<String> {
    std::env::var(var_name).with_context(|| format!("{var_name} environment variable not set"))
}

/// Get optional environment variable, returning None if not set or empty
pub fn get_optional_env_var(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().filter(|v| !v.is_empty())
}

/// Parse an environment variable into any `FromStr` type, falling back to a
/// default when the variable is unset. A set-but-unparsable value is an error
/// rather than a silent fallback.
pub fn get_env_var_or<T>(var_name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get_optional_env_var(var_name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("Failed to parse {var_name} value: {raw}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestData {
        name: String,
        value: i32,
    }

    #[test]
    fn test_json_round_trip_with_context() {
        let data = TestData {
            name: "test".to_string(),
            value: 42,
        };

        let json_str = serialize_to_json_with_context(&data, "test data").unwrap();
        assert!(json_str.contains("\"name\": \"test\""));

        let parsed: TestData = parse_json_with_context(&json_str, "test data").unwrap();
        assert_eq!(parsed, data);
    }

    #[test]
    fn test_env_var_handling() {
        let result = get_required_env_var("DEFOLLOW_NONEXISTENT_VAR");
        assert!(result.is_err());

        let result = get_optional_env_var("DEFOLLOW_NONEXISTENT_VAR");
        assert!(result.is_none());
    }

    #[test]
    fn test_env_var_or_default() {
        let value: u64 = get_env_var_or("DEFOLLOW_NONEXISTENT_VAR", 25).unwrap();
        assert_eq!(value, 25);
    }
}
