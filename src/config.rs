use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

use crate::vision::gate::GateConfig;
use crate::vision::labels::DEFAULT_LABEL_PREFIX;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_DATABASE_URL: &str = "sqlite://bodyfat.db?mode=rwc";
pub const DEFAULT_TOKEN_TTL_MINUTES: i64 = 30;
/// One year.
pub const MAX_TOKEN_TTL_MINUTES: i64 = 366 * 24 * 60;
pub const DEFAULT_VERIFICATION_TTL_SECS: u64 = 180;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },
}

/// Paths of the model artifacts read once at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelPaths {
    pub classifier: PathBuf,
    pub labels: PathBuf,
    pub segmenter: PathBuf,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub jwt_secret: SecretString,
    pub token_ttl: chrono::Duration,
    pub models: ModelPaths,
    pub gate: GateConfig,
    pub label_prefix_pattern: String,
    pub legacy_attributes: Vec<String>,
    pub verification_ttl: Duration,
    pub max_upload_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("SECRET_KEY")
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingVar("SECRET_KEY"))?;

        let token_minutes: i64 = parse_or(
            &lookup,
            "ACCESS_TOKEN_EXPIRE_MINUTES",
            DEFAULT_TOKEN_TTL_MINUTES,
        )?;
        let token_ttl = token_ttl(token_minutes)?;

        let gate = GateConfig {
            mask_threshold: unit_interval(
                &lookup,
                "GATE_MASK_THRESHOLD",
                GateConfig::default().mask_threshold,
            )?,
            min_top_half_coverage: unit_interval(
                &lookup,
                "GATE_MIN_TOP_HALF_COVERAGE",
                GateConfig::default().min_top_half_coverage,
            )?,
        };

        let label_prefix_pattern =
            lookup("LABEL_PREFIX_PATTERN").unwrap_or_else(|| DEFAULT_LABEL_PREFIX.to_string());
        if let Err(e) = regex::Regex::new(&label_prefix_pattern) {
            return Err(ConfigError::InvalidValue {
                var: "LABEL_PREFIX_PATTERN",
                reason: e.to_string(),
            });
        }

        let legacy_attributes = lookup("MODEL_LEGACY_ATTRIBUTES")
            .unwrap_or_else(|| "groups".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let max_upload_bytes: usize =
            parse_or(&lookup, "MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?;
        if max_upload_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                var: "MAX_UPLOAD_BYTES",
                reason: "must be positive".into(),
            });
        }

        Ok(Self {
            port: parse_or(&lookup, "PORT", DEFAULT_PORT)?,
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            jwt_secret: SecretString::new(jwt_secret),
            token_ttl,
            models: ModelPaths {
                classifier: path_or(&lookup, "BODYFAT_MODEL_PATH", "model.onnx"),
                labels: path_or(&lookup, "BODYFAT_LABEL_PATH", "labels.txt"),
                segmenter: path_or(&lookup, "BODYFAT_SEGMENTER_PATH", "selfie_segmentation.onnx"),
            },
            gate,
            label_prefix_pattern,
            legacy_attributes,
            verification_ttl: Duration::from_secs(parse_or(
                &lookup,
                "VERIFICATION_CODE_TTL_SECS",
                DEFAULT_VERIFICATION_TTL_SECS,
            )?),
            max_upload_bytes,
        })
    }
}

fn token_ttl(minutes: i64) -> Result<chrono::Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        var: "ACCESS_TOKEN_EXPIRE_MINUTES",
        reason,
    };
    if minutes <= 0 {
        return Err(invalid("must be positive".into()));
    }
    if minutes > MAX_TOKEN_TTL_MINUTES {
        return Err(invalid(format!("must be at most {MAX_TOKEN_TTL_MINUTES}")));
    }
    chrono::TimeDelta::try_minutes(minutes).ok_or_else(|| invalid("out of range".into()))
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var,
            reason: e.to_string(),
        }),
    }
}

fn unit_interval<F>(lookup: &F, var: &'static str, default: f32) -> Result<f32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value: f32 = parse_or(lookup, var, default)?;
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidValue {
            var,
            reason: format!("{value} is outside [0, 1]"),
        });
    }
    Ok(value)
}

fn path_or<F>(lookup: &F, var: &str, default: &str) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    PathBuf::from(lookup(var).unwrap_or_else(|| default.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_secret_is_set() {
        let config = AppConfig::from_lookup(lookup_from(&[("SECRET_KEY", "s3cret")])).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.jwt_secret.expose_secret(), "s3cret");
        assert_eq!(config.token_ttl, chrono::Duration::minutes(30));
        assert_eq!(config.models.classifier, PathBuf::from("model.onnx"));
        assert_eq!(config.models.labels, PathBuf::from("labels.txt"));
        assert_eq!(config.gate, GateConfig::default());
        assert_eq!(config.label_prefix_pattern, DEFAULT_LABEL_PREFIX);
        assert_eq!(config.legacy_attributes, vec!["groups".to_string()]);
        assert_eq!(config.verification_ttl, Duration::from_secs(180));
    }

    #[test]
    fn missing_secret_is_an_error() {
        let err = AppConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert_eq!(err, ConfigError::MissingVar("SECRET_KEY"));

        let err = AppConfig::from_lookup(lookup_from(&[("SECRET_KEY", "  ")])).unwrap_err();
        assert_eq!(err, ConfigError::MissingVar("SECRET_KEY"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("SECRET_KEY", "k"),
            ("PORT", "9001"),
            ("BODYFAT_MODEL_PATH", "/models/bf.onnx"),
            ("GATE_MASK_THRESHOLD", "0.6"),
            ("GATE_MIN_TOP_HALF_COVERAGE", "0.2"),
            ("MODEL_LEGACY_ATTRIBUTES", "groups, legacy_pad ,"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.models.classifier, PathBuf::from("/models/bf.onnx"));
        assert!((config.gate.mask_threshold - 0.6).abs() < f32::EPSILON);
        assert!((config.gate.min_top_half_coverage - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.legacy_attributes, vec!["groups", "legacy_pad"]);
    }

    #[test]
    fn rejects_out_of_range_gate_values() {
        let err = AppConfig::from_lookup(lookup_from(&[
            ("SECRET_KEY", "k"),
            ("GATE_MIN_TOP_HALF_COVERAGE", "1.5"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "GATE_MIN_TOP_HALF_COVERAGE", .. }
        ));
    }

    #[test]
    fn rejects_bad_numbers_and_patterns() {
        assert!(
            AppConfig::from_lookup(lookup_from(&[("SECRET_KEY", "k"), ("PORT", "http")])).is_err()
        );
        assert!(AppConfig::from_lookup(lookup_from(&[
            ("SECRET_KEY", "k"),
            ("ACCESS_TOKEN_EXPIRE_MINUTES", "0"),
        ]))
        .is_err());
        assert!(AppConfig::from_lookup(lookup_from(&[
            ("SECRET_KEY", "k"),
            ("LABEL_PREFIX_PATTERN", "(unclosed"),
        ]))
        .is_err());
    }

    #[test]
    fn oversized_token_lifetimes_are_rejected() {
        let max = i64::MAX.to_string();
        for minutes in ["200000000000", max.as_str(), "527041"] {
            let err = AppConfig::from_lookup(lookup_from(&[
                ("SECRET_KEY", "k"),
                ("ACCESS_TOKEN_EXPIRE_MINUTES", minutes),
            ]))
            .unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { var: "ACCESS_TOKEN_EXPIRE_MINUTES", .. }
            ));
        }

        let config = AppConfig::from_lookup(lookup_from(&[
            ("SECRET_KEY", "k"),
            ("ACCESS_TOKEN_EXPIRE_MINUTES", "527040"),
        ]))
        .unwrap();
        assert_eq!(config.token_ttl, chrono::Duration::days(366));
    }
}
