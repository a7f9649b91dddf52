use std::collections::HashMap;
use std::env;

use super::types::{ConfigError, Environment, HandleVerification};

const DEFAULT_CORS_ORIGINS: &[&str] =
    &["http://localhost:5173", "http://localhost:3000", "http://localhost:8080"];

pub(super) fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

pub(super) fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

pub(super) fn parse_u16(field: &'static str, value: String) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u32(field: &'static str, value: String) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u64(field: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_usize(field: &'static str, value: String) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_f64(field: &'static str, value: String) -> Result<f64, ConfigError> {
    match value.parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => Ok(parsed),
        _ => Err(ConfigError::InvalidValue { field, value }),
    }
}

pub(super) fn parse_cors_origins(value: Option<String>) -> Result<Vec<String>, ConfigError> {
    let Some(raw) = value else {
        return Ok(default_cors_origins());
    };

    if raw.trim().is_empty() {
        return Ok(default_cors_origins());
    }

    if raw.trim_start().starts_with('[') {
        let parsed: Vec<String> =
            serde_json::from_str(&raw).map_err(|_| ConfigError::InvalidCors(raw.clone()))?;
        if parsed.is_empty() {
            return Ok(default_cors_origins());
        }
        return Ok(parsed);
    }

    let items: Vec<String> = raw
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();

    if items.is_empty() {
        return Ok(default_cors_origins());
    }

    Ok(items)
}

pub(super) fn parse_string_list(value: Option<String>, defaults: &[&str]) -> Vec<String> {
    match value {
        Some(raw) => raw
            .split(',')
            .map(|item| item.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|item| !item.is_empty())
            .collect(),
        None => defaults.iter().map(|item| item.to_string()).collect(),
    }
}

/// Parses `CODE:assignment_id` pairs, e.g. `19AI405:2,19AI411:3`.
pub(super) fn parse_subject_mapping(
    value: Option<String>,
) -> Result<HashMap<String, i64>, ConfigError> {
    let mut mapping = HashMap::new();
    let Some(raw) = value else {
        return Ok(mapping);
    };

    for pair in raw.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let invalid = || ConfigError::InvalidValue {
            field: "SUBJECT_ASSIGNMENT_MAPPING",
            value: pair.to_string(),
        };

        let (code, assignment) = pair.split_once(':').ok_or_else(invalid)?;
        let code = code.trim().to_ascii_uppercase();
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }
        let assignment_id = assignment.trim().parse::<i64>().map_err(|_| invalid())?;
        if assignment_id <= 0 {
            return Err(invalid());
        }

        mapping.insert(code, assignment_id);
    }

    Ok(mapping)
}

pub(super) fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}

pub(super) fn parse_environment(value: Option<String>) -> Environment {
    match value.as_deref().map(|item| item.to_lowercase()) {
        Some(ref val) if val == "production" || val == "prod" => Environment::Production,
        Some(ref val) if val == "staging" => Environment::Staging,
        Some(ref val) if val == "test" || val == "testing" => Environment::Test,
        _ => Environment::Development,
    }
}

pub(super) fn parse_handle_verification(
    value: Option<String>,
) -> Result<HandleVerification, ConfigError> {
    match value.as_deref().map(|item| item.to_ascii_lowercase()) {
        None => Ok(HandleVerification::Probe),
        Some(ref val) if val == "probe" => Ok(HandleVerification::Probe),
        Some(ref val) if val == "ttl" => Ok(HandleVerification::Ttl),
        Some(other) => {
            Err(ConfigError::InvalidValue { field: "HANDLE_VERIFICATION", value: other })
        }
    }
}

pub(super) fn is_supported_extension(extension: &str) -> bool {
    matches!(extension, "pdf" | "jpg" | "jpeg" | "png")
}

fn default_cors_origins() -> Vec<String> {
    DEFAULT_CORS_ORIGINS.iter().map(|item| item.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cors_origins_csv() {
        let raw = "http://a, http://b".to_string();
        let parsed = parse_cors_origins(Some(raw)).expect("cors csv");
        assert_eq!(parsed, vec!["http://a".to_string(), "http://b".to_string()]);
    }

    #[test]
    fn parse_cors_origins_defaults_on_empty() {
        let parsed = parse_cors_origins(Some(" ".to_string())).expect("cors empty");
        assert_eq!(parsed, default_cors_origins());
    }

    #[test]
    fn parse_string_list_strips_dots_and_lowercases() {
        let parsed = parse_string_list(Some(".PDF, jpg,,png".to_string()), &["pdf"]);
        assert_eq!(parsed, vec!["pdf", "jpg", "png"]);
        assert_eq!(parse_string_list(None, &["pdf"]), vec!["pdf"]);
    }

    #[test]
    fn parse_subject_mapping_pairs() {
        let parsed =
            parse_subject_mapping(Some("19ai405:2, 19AI411:3".to_string())).expect("mapping");
        assert_eq!(parsed.get("19AI405"), Some(&2));
        assert_eq!(parsed.get("19AI411"), Some(&3));
        assert!(parse_subject_mapping(None).expect("empty").is_empty());
    }

    #[test]
    fn parse_subject_mapping_rejects_malformed_pairs() {
        assert!(parse_subject_mapping(Some("19AI405".to_string())).is_err());
        assert!(parse_subject_mapping(Some("19AI405:abc".to_string())).is_err());
        assert!(parse_subject_mapping(Some("19-AI:2".to_string())).is_err());
        assert!(parse_subject_mapping(Some("19AI405:0".to_string())).is_err());
    }

    #[test]
    fn parse_bool_variants() {
        assert!(parse_bool("1"));
        assert!(parse_bool("yes"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
    }

    #[test]
    fn parse_environment_variants() {
        assert_eq!(parse_environment(Some("prod".to_string())), Environment::Production);
        assert_eq!(parse_environment(Some("staging".to_string())), Environment::Staging);
        assert_eq!(parse_environment(Some("testing".to_string())), Environment::Test);
        assert_eq!(parse_environment(None), Environment::Development);
    }

    #[test]
    fn parse_handle_verification_variants() {
        assert_eq!(parse_handle_verification(None).unwrap(), HandleVerification::Probe);
        assert_eq!(
            parse_handle_verification(Some("TTL".to_string())).unwrap(),
            HandleVerification::Ttl
        );
        assert!(parse_handle_verification(Some("never".to_string())).is_err());
    }

    #[test]
    fn parse_f64_rejects_non_finite() {
        assert_eq!(parse_f64("RETRY_JITTER_RATIO", "0.2".to_string()).unwrap(), 0.2);
        assert!(parse_f64("RETRY_JITTER_RATIO", "NaN".to_string()).is_err());
        assert!(parse_f64("RETRY_JITTER_RATIO", "x".to_string()).is_err());
    }
}
