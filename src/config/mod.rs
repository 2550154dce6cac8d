//! Configuration management
//!
//! Handles config.toml (user-defined) and config.lock (generated with all defaults).

mod types;
mod validation;

pub use types::*;
pub use validation::{validate, ValidationResult};

use crate::dataplane::RuleFilter;
use crate::{Error, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let config: Config = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
    Ok(config)
}

/// Generate a lock file from config, filling in all defaults
pub fn generate_lock(config: &Config) -> ConfigLock {
    ConfigLock::from_config(config)
}

/// Ingress and egress rule filters configured for `port`, in file order
pub fn port_filters(config: &Config, port: &str) -> Result<(RuleFilter, RuleFilter)> {
    let mut ingress = RuleFilter::new();
    let mut egress = RuleFilter::new();
    for rule in config.rules.iter().filter(|r| r.port == port) {
        let matched = rule.to_match_rule()?;
        match rule.direction {
            Direction::Ingress => ingress.add_rule(matched),
            Direction::Egress => egress.add_rule(matched),
        }
    }
    Ok((ingress, egress))
}
