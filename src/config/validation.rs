use rustc_hash::FxHashSet;

use crate::protocol::canonical::ProviderKind;

use super::{AppConfig, ConfigError};

const VALID_PROVIDERS: &[&str] = &["anthropic", "openai-responses", "openai", "openai-compatible"];

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_http_config(config)?;
    validate_providers(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_http_config(config: &AppConfig) -> Result<(), ConfigError> {
    let http = &config.http;
    if http.pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "http.pool_max_idle_per_host must be greater than 0",
        ));
    }
    if http.timeout_secs == 0 {
        return Err(validation_err("http.timeout_secs must be greater than 0"));
    }
    Ok(())
}

fn validate_providers(config: &AppConfig) -> Result<(), ConfigError> {
    if config.providers.is_empty() {
        return Err(validation_err("providers cannot be empty"));
    }

    let mut names = FxHashSet::default();
    for provider in &config.providers {
        if provider.name.trim().is_empty() {
            return Err(validation_err("provider name cannot be empty"));
        }
        if !names.insert(provider.name.as_str()) {
            return Err(validation_err(format!(
                "duplicate provider name '{}'",
                provider.name
            )));
        }
        if ProviderKind::from_config_name(&provider.provider).is_none() {
            return Err(validation_err(format!(
                "Provider '{}': unknown provider '{}'. Must be one of: {}",
                provider.name,
                provider.provider,
                VALID_PROVIDERS.join(", ")
            )));
        }
        validate_base_url(&provider.name, &provider.base_url)?;
        if provider.api_key.trim().is_empty() {
            return Err(validation_err(format!(
                "Provider '{}': api_key cannot be empty",
                provider.name
            )));
        }
        if provider.models.iter().any(|model| model.trim().is_empty()) {
            return Err(validation_err(format!(
                "Provider '{}': model name cannot be empty",
                provider.name
            )));
        }
    }

    let defaults = config.providers.iter().filter(|p| p.is_default).count();
    if defaults > 1 {
        return Err(validation_err(format!(
            "at most one provider may set is_default, found {defaults}"
        )));
    }
    Ok(())
}

fn validate_base_url(provider_name: &str, base_url: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(base_url).map_err(|err| {
        validation_err(format!(
            "Provider '{provider_name}': base_url is not a valid URL: {err}"
        ))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "Provider '{provider_name}': base_url must start with http:// or https://"
        )));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}
