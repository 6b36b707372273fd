//! MQ-007: Configuration parsing and validation.
//!
//! Parses marketql.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Table name must be a plain SQL identifier
//! - Default symbol must belong to the symbol universe
//! - Pipeline limits must be positive

use super::compiler::is_identifier;
use super::types::*;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a marketql.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<MarketqlConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse a marketql.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<MarketqlConfig, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &MarketqlConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if config.version != "1.0" {
        push(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        ));
    }

    if config.data.database.as_os_str().is_empty() {
        push("data.database must not be empty".to_string());
    }

    if !is_identifier(&config.data.table) {
        push(format!(
            "data.table '{}' is not a plain identifier",
            config.data.table
        ));
    }

    for symbol in &config.data.symbols {
        if symbol.trim().is_empty() || symbol.chars().any(char::is_whitespace) {
            push(format!("symbol '{}' must be a single word", symbol));
        }
    }

    if let Some(default) = &config.data.default_symbol {
        if !config.data.symbols.is_empty() && !config.data.symbols.contains(default) {
            push(format!(
                "default_symbol '{}' is not in data.symbols",
                default
            ));
        }
    }

    let p = &config.pipeline;
    if p.row_cap == 0 {
        push("pipeline.row_cap must be > 0".to_string());
    }
    if p.query_timeout_ms == 0 {
        push("pipeline.query_timeout_ms must be > 0".to_string());
    }
    if p.provider_timeout_ms == 0 {
        push("pipeline.provider_timeout_ms must be > 0".to_string());
    }
    if p.event_buffer == 0 {
        push("pipeline.event_buffer must be > 0".to_string());
    }
    if p.max_rewrites > 10 {
        push(format!(
            "pipeline.max_rewrites must be <= 10, got {}",
            p.max_rewrites
        ));
    }

    errors
}

/// Parse and validate in one step, joining errors into one message.
pub fn load_config(path: &Path) -> Result<MarketqlConfig, String> {
    let config = parse_config_file(path)?;
    let errors = validate_config(&config);
    if !errors.is_empty() {
        let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(format!("invalid config: {}", joined.join("; ")));
    }
    Ok(config)
}
