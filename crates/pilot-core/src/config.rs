//! Configuration parsing for the orchestration daemon.
//!
//! Key=value file format with `#` comments and optional quoting.
//! Precedence: CLI flags > `--config` file > defaults.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Daemon and run configuration.
///
/// Dotted keys in config files (`rate_limit.ip_per_hour`) map onto the
/// flattened snake_case field names below.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Reflection and loop bounds
    /// Reflector retry ceiling per step id.
    pub max_retries: u32,
    /// Upper bound on detect->dismiss iterations per step.
    pub max_obstacle_clear_attempts: u32,
    /// Global iteration safety net per run.
    pub max_loop_iterations: u32,
    /// Wall-clock deadline per run, minutes.
    pub test_timeout_minutes: u64,

    // Admission caps
    pub concurrent_limit_max_per_user: usize,
    pub concurrent_limit_max_global: usize,

    // Rate limits (sliding windows)
    pub rate_limit_user_per_minute: u32,
    pub rate_limit_ip_per_hour: u32,
    pub rate_limit_target_per_hour: u32,

    // Security toggles
    /// Enables cloud-metadata and DNS-rebinding checks.
    pub security_ssrf_protection: bool,
    /// Resolves A-records and reruns range checks.
    pub security_dns_rebinding_protection: bool,
    /// Enables the allowlist for internal self-testing.
    pub security_self_test_enabled: bool,
    /// Allowlisted hosts consulted only under self-test mode.
    pub security_allowed_hosts: Vec<String>,
    /// Hosts the runner must never target (own infrastructure).
    pub security_self_protection_hosts: Vec<String>,
    /// Treat loopback and RFC1918 ranges as blocked (production profile).
    pub security_production_profile: bool,

    // Input guards
    /// Plan sanitizer drops `type` values longer than this.
    pub orchestrator_max_input_length: usize,
    /// Prompt sanitizer truncation cap, characters.
    pub prompt_max_content_length: usize,
    /// Planner input guard: system prompt + goals character budget.
    pub prompt_max_total_length: usize,

    // Bridge
    /// Per-call bridge timeout, seconds.
    pub bridge_call_timeout_sec: u64,
    /// Retries for the is_running -> start -> create_context sequence.
    pub bridge_context_retries: u32,
    /// Launch the browser headless.
    pub bridge_headless: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_obstacle_clear_attempts: 3,
            max_loop_iterations: 50,
            test_timeout_minutes: 30,
            concurrent_limit_max_per_user: 3,
            concurrent_limit_max_global: 50,
            rate_limit_user_per_minute: 10,
            rate_limit_ip_per_hour: 30,
            rate_limit_target_per_hour: 100,
            security_ssrf_protection: true,
            security_dns_rebinding_protection: true,
            security_self_test_enabled: false,
            security_allowed_hosts: Vec::new(),
            security_self_protection_hosts: Vec::new(),
            security_production_profile: true,
            orchestrator_max_input_length: 1200,
            prompt_max_content_length: 50_000,
            prompt_max_total_length: 15_000,
            bridge_call_timeout_sec: 30,
            bridge_context_retries: 3,
            bridge_headless: true,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Wall-clock deadline for one run.
    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.test_timeout_minutes * 60)
    }

    /// Per-call bridge timeout.
    pub fn bridge_call_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge_call_timeout_sec)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value. Dotted keys are accepted alongside
    /// their flattened spellings.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let flat = key.replace('.', "_");
        match flat.as_str() {
            "max_retries" => self.max_retries = Self::parse_int(key, value)?,
            "max_obstacle_clear_attempts" => {
                self.max_obstacle_clear_attempts = Self::parse_int(key, value)?;
            }
            "max_loop_iterations" => self.max_loop_iterations = Self::parse_int(key, value)?,
            "test_timeout_minutes" => self.test_timeout_minutes = Self::parse_int(key, value)?,
            "concurrent_limit_max_per_user" => {
                self.concurrent_limit_max_per_user = Self::parse_int(key, value)?;
            }
            "concurrent_limit_max_global" => {
                self.concurrent_limit_max_global = Self::parse_int(key, value)?;
            }
            "rate_limit_user_per_minute" => {
                self.rate_limit_user_per_minute = Self::parse_int(key, value)?;
            }
            "rate_limit_ip_per_hour" => {
                self.rate_limit_ip_per_hour = Self::parse_int(key, value)?;
            }
            "rate_limit_target_per_hour" => {
                self.rate_limit_target_per_hour = Self::parse_int(key, value)?;
            }
            "security_ssrf_protection" => {
                self.security_ssrf_protection = Self::parse_bool(key, value)?;
            }
            "security_dns_rebinding_protection" => {
                self.security_dns_rebinding_protection = Self::parse_bool(key, value)?;
            }
            "security_self_test_enabled" => {
                self.security_self_test_enabled = Self::parse_bool(key, value)?;
            }
            "security_allowed_hosts" => {
                self.security_allowed_hosts =
                    value.split_whitespace().map(str::to_string).collect();
            }
            "security_self_protection_hosts" => {
                self.security_self_protection_hosts =
                    value.split_whitespace().map(str::to_string).collect();
            }
            "security_production_profile" => {
                self.security_production_profile = Self::parse_bool(key, value)?;
            }
            "orchestrator_max_input_length" => {
                self.orchestrator_max_input_length = Self::parse_int(key, value)?;
            }
            "prompt_max_content_length" => {
                self.prompt_max_content_length = Self::parse_int(key, value)?;
            }
            "prompt_max_total_length" => {
                self.prompt_max_total_length = Self::parse_int(key, value)?;
            }
            "bridge_call_timeout_sec" => {
                self.bridge_call_timeout_sec = Self::parse_int(key, value)?;
            }
            "bridge_context_retries" => {
                self.bridge_context_retries = Self::parse_int(key, value)?;
            }
            "bridge_headless" => self.bridge_headless = Self::parse_bool(key, value)?,
            _ => {
                // Warn but don't fail for unknown keys.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_obstacle_clear_attempts, 3);
        assert_eq!(config.max_loop_iterations, 50);
        assert_eq!(config.test_timeout_minutes, 30);
        assert_eq!(config.concurrent_limit_max_per_user, 3);
        assert_eq!(config.concurrent_limit_max_global, 50);
        assert_eq!(config.rate_limit_user_per_minute, 10);
        assert_eq!(config.rate_limit_ip_per_hour, 30);
        assert_eq!(config.rate_limit_target_per_hour, 100);
        assert!(config.security_ssrf_protection);
        assert!(config.security_dns_rebinding_protection);
        assert!(!config.security_self_test_enabled);
        assert_eq!(config.orchestrator_max_input_length, 1200);
        assert_eq!(config.prompt_max_content_length, 50_000);
        assert_eq!(config.prompt_max_total_length, 15_000);
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
max_retries=5
test_timeout_minutes=10
security_self_test_enabled=true
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.test_timeout_minutes, 10);
        assert!(config.security_self_test_enabled);
    }

    #[test]
    fn parse_dotted_keys() {
        let mut config = Config::default();
        let content = r#"
concurrent_limit.max_per_user=5
rate_limit.ip_per_hour=60
security.ssrf_protection=off
prompt.max_total_length=20000
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.concurrent_limit_max_per_user, 5);
        assert_eq!(config.rate_limit_ip_per_hour, 60);
        assert!(!config.security_ssrf_protection);
        assert_eq!(config.prompt_max_total_length, 20_000);
    }

    #[test]
    fn parse_host_lists() {
        let mut config = Config::default();
        let content = r#"security_allowed_hosts="staging.example.com test.example.com""#;
        config.parse_content(content).unwrap();
        assert_eq!(
            config.security_allowed_hosts,
            vec!["staging.example.com", "test.example.com"]
        );
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "1").unwrap());
        assert!(Config::parse_bool("test", "yes").unwrap());
        assert!(Config::parse_bool("test", "on").unwrap());
        assert!(!Config::parse_bool("test", "false").unwrap());
        assert!(!Config::parse_bool("test", "0").unwrap());
        assert!(!Config::parse_bool("test", "no").unwrap());
        assert!(!Config::parse_bool("test", "off").unwrap());
    }

    #[test]
    fn invalid_int_is_rejected() {
        let mut config = Config::default();
        let result = config.parse_content("max_retries=lots");
        assert!(result.is_err());
    }

    #[test]
    fn run_deadline_converts_minutes() {
        let mut config = Config::default();
        config.test_timeout_minutes = 2;
        assert_eq!(config.run_deadline(), Duration::from_secs(120));
    }

    #[test]
    fn from_file_merges_with_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pilot.conf");
        std::fs::write(&path, "# overrides\nmax_retries=7\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.max_retries, 7);
        // Untouched keys keep their defaults.
        assert_eq!(config.max_loop_iterations, 50);
    }
}
