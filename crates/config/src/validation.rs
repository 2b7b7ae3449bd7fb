//! Configuration validation

use crate::{AppConfig, ConfigError, DatabaseConfig, LedgerConfig, PricingConfig, Result};
use feature_ledger_types::{FeatureType, PlanTier};

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate the entire application configuration
///
/// Every problem found is reported, joined with "; ".
pub fn validate_config(config: &AppConfig) -> Result<()> {
    let mut errors = Vec::new();

    if let Err(e) = validate_log_level(&config.service.log_level) {
        errors.push(e);
    }

    errors.extend(validate_database(&config.database));
    errors.extend(validate_ledger(&config.ledger));
    errors.extend(validate_pricing(&config.pricing));

    if errors.is_empty() {
        Ok(())
    } else {
        let error_messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        Err(ConfigError::ValidationError(error_messages.join("; ")))
    }
}

fn validate_log_level(level: &str) -> std::result::Result<(), ValidationError> {
    // first directive decides; "info,feature_ledger=debug" is accepted
    let head = level.split(',').next().unwrap_or_default();
    match head.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new(
            "service.log_level",
            format!("invalid log level: {level}"),
        )),
    }
}

fn validate_database(database: &DatabaseConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if !database.url.starts_with("sqlite:") {
        errors.push(ValidationError::new(
            "database.url",
            "only sqlite URLs are supported",
        ));
    }

    if database.max_connections == 0 {
        errors.push(ValidationError::new(
            "database.max_connections",
            "must be greater than 0",
        ));
    }

    errors
}

fn validate_ledger(ledger: &LedgerConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if ledger.max_reserve_attempts == 0 {
        errors.push(ValidationError::new(
            "ledger.max_reserve_attempts",
            "must be at least 1",
        ));
    }

    if ledger.retry_backoff_ms > ledger.retry_backoff_max_ms {
        errors.push(ValidationError::new(
            "ledger.retry_backoff_ms",
            "must not exceed retry_backoff_max_ms",
        ));
    }

    if ledger.reaccess_window_hours <= 0 {
        errors.push(ValidationError::new(
            "ledger.reaccess_window_hours",
            "must be greater than 0",
        ));
    }

    if ledger.stale_pending_secs <= 0 {
        errors.push(ValidationError::new(
            "ledger.stale_pending_secs",
            "must be greater than 0",
        ));
    }

    if ledger.recovery_batch_size == 0 {
        errors.push(ValidationError::new(
            "ledger.recovery_batch_size",
            "must be greater than 0",
        ));
    }

    if ledger.executor_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "ledger.executor_timeout_ms",
            "must be greater than 0",
        ));
    }

    // a feature run outliving the stale threshold would be recovered under it
    if ledger.executor_timeout_ms / 1000 >= ledger.stale_pending_secs.max(0) as u64 {
        errors.push(ValidationError::new(
            "ledger.executor_timeout_ms",
            "must be shorter than stale_pending_secs",
        ));
    }

    errors
}

fn validate_pricing(pricing: &PricingConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for name in pricing.point_costs.keys() {
        if name.parse::<FeatureType>().is_err() {
            errors.push(ValidationError::new(
                format!("pricing.point_costs.{name}"),
                "unknown feature type",
            ));
        }
    }

    for feature in FeatureType::ALL {
        match pricing.point_cost(feature) {
            None => errors.push(ValidationError::new(
                format!("pricing.point_costs.{feature}"),
                "missing point cost",
            )),
            Some(cost) if cost <= 0 => errors.push(ValidationError::new(
                format!("pricing.point_costs.{feature}"),
                "point cost must be greater than 0",
            )),
            Some(_) => {}
        }
    }

    for (tier_name, features) in &pricing.allowances {
        let tier = match tier_name.parse::<PlanTier>() {
            Ok(tier) => tier,
            Err(_) => {
                errors.push(ValidationError::new(
                    format!("pricing.allowances.{tier_name}"),
                    "unknown plan tier",
                ));
                continue;
            }
        };

        for (feature_name, units) in features {
            if feature_name.parse::<FeatureType>().is_err() {
                errors.push(ValidationError::new(
                    format!("pricing.allowances.{tier_name}.{feature_name}"),
                    "unknown feature type",
                ));
            } else if !tier.is_paid() && *units > 0 {
                errors.push(ValidationError::new(
                    format!("pricing.allowances.{tier_name}.{feature_name}"),
                    "free tier cannot carry an allowance",
                ));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_log_level_with_directives() {
        assert!(validate_log_level("info,feature_ledger=debug").is_ok());
        assert!(validate_log_level("loud").is_err());
    }

    #[test]
    fn test_missing_and_unknown_costs() {
        let mut config = AppConfig::default();
        config.pricing.point_costs.remove("report");
        config.pricing.point_costs.insert("horoscope".to_string(), 10);

        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("pricing.point_costs.report: missing point cost"));
        assert!(err.contains("pricing.point_costs.horoscope: unknown feature type"));
    }

    #[test]
    fn test_non_positive_cost() {
        let mut config = AppConfig::default();
        config.pricing.point_costs.insert("rate_stats".to_string(), 0);

        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("point cost must be greater than 0"));
    }

    #[test]
    fn test_free_tier_allowance_rejected() {
        let mut config = AppConfig::default();
        config
            .pricing
            .allowances
            .entry("free".to_string())
            .or_default()
            .insert("report".to_string(), 1);

        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("free tier cannot carry an allowance"));
    }

    #[test]
    fn test_ledger_errors_are_collected() {
        let mut config = AppConfig::default();
        config.ledger.max_reserve_attempts = 0;
        config.ledger.retry_backoff_ms = 500;
        config.ledger.reaccess_window_hours = 0;

        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("ledger.max_reserve_attempts"));
        assert!(err.contains("ledger.retry_backoff_ms"));
        assert!(err.contains("ledger.reaccess_window_hours"));
        assert_eq!(err.matches("; ").count(), 2);
    }

    #[test]
    fn test_executor_timeout_must_undercut_stale_threshold() {
        let mut config = AppConfig::default();
        config.ledger.stale_pending_secs = 10;
        config.ledger.executor_timeout_ms = 10_000;

        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("must be shorter than stale_pending_secs"));
    }

    #[test]
    fn test_database_url_scheme() {
        let mut config = AppConfig::default();
        config.database.url = "postgres://localhost/ledger".to_string();

        assert!(validate_config(&config).is_err());
    }
}
