// Config validation
// Strict mode validates config at startup and fails fast with actionable errors

use crate::config::types::{BidboxError, GameConfig, Result, SecurityMode};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate a game config. Errors are always fatal; warnings are logged.
pub fn validate_config(config: &GameConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_game(config, &mut result);
    validate_deadlines(config, &mut result);
    validate_isolation(config, &mut result);

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(BidboxError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_game(config: &GameConfig, result: &mut ValidationResult) {
    if config.rounds == 0 {
        result.add_error("rounds must be at least 1".to_string());
    }
    if !config.initial_budget.is_finite() || config.initial_budget < 0.0 {
        result.add_error(format!(
            "initial_budget must be a finite non-negative number, got {}",
            config.initial_budget
        ));
    }
}

fn validate_deadlines(config: &GameConfig, result: &mut ValidationResult) {
    let executor = &config.executor;
    if executor.call_timeout_ms == 0 {
        result.add_error("call_timeout_ms cannot be zero".to_string());
    }
    if executor.grace_window_ms == 0 {
        result.add_warning("grace_window_ms is zero; overrunning guests are killed without SIGTERM".to_string());
    }
    if executor.poll_interval_ms > executor.call_timeout_ms {
        result.add_warning(format!(
            "poll_interval_ms {} exceeds call_timeout_ms {}; deadlines will be coarse",
            executor.poll_interval_ms, executor.call_timeout_ms
        ));
    }
    if executor.max_workers == 0 {
        result.add_error("max_workers must be at least 1".to_string());
    }
    if executor.max_checkpoint_bytes == 0 {
        result.add_error("max_checkpoint_bytes cannot be zero".to_string());
    }
    if executor.stdout_limit < 4096 {
        result.add_error(format!(
            "stdout_limit {} is too small to carry a guest reply",
            executor.stdout_limit
        ));
    }
}

fn validate_isolation(config: &GameConfig, result: &mut ValidationResult) {
    let policy = &config.executor.isolation;
    let running_as_root = nix::unistd::geteuid().is_root();

    if let Some(limit) = policy.memory_limit {
        if limit < 16 * 1024 * 1024 {
            result.add_warning(format!(
                "memory_limit {} is very low (< 16MB), guests may fail to start",
                limit
            ));
        }
    }

    if let Some(base) = policy.guest_uid_base {
        if base == 0 {
            result.add_error("guest_uid_base cannot be 0 (root)".to_string());
        }
    }

    if policy.security_mode == SecurityMode::Strict && !running_as_root {
        if policy.unshare_network {
            result.add_error(
                "strict mode with unshare_network requires root privileges".to_string(),
            );
        }
        result.add_warning(
            "strict mode without root: contexts share the host uid".to_string(),
        );
    }

    if !policy.restrict_signals && !running_as_root {
        result.add_warning(
            "restrict_signals is off and contexts share the host uid: a guest can signal the host"
                .to_string(),
        );
    }

    if policy.path_env.is_empty() {
        result.add_warning("path_env is empty; guests must use absolute program paths".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let mut config = GameConfig::default();
        config.executor.isolation.security_mode = SecurityMode::Permissive;
        let result = validate_config(&config).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn zero_rounds_rejected() {
        let config = GameConfig {
            rounds: 0,
            ..GameConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn negative_budget_rejected() {
        let config = GameConfig {
            initial_budget: -1.0,
            ..GameConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn root_uid_base_rejected() {
        let mut config = GameConfig::default();
        config.executor.isolation.guest_uid_base = Some(0);
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("guest_uid_base"));
    }

    #[test]
    fn tiny_memory_limit_only_warns() {
        let mut config = GameConfig::default();
        config.executor.isolation.security_mode = SecurityMode::Permissive;
        config.executor.isolation.memory_limit = Some(1024);
        let result = validate_config(&config).unwrap();
        assert!(!result.warnings.is_empty());
    }
}
