use crate::AgentError;
use std::time::Duration;
use tether_llm::RetryPolicy;

/// Limits and tunables shared by every session an orchestrator runs.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    pub model: String,
    pub max_tokens: u32,
    pub plan_max_tokens: u32,
    pub max_iterations: usize,
    pub model_timeout: Duration,
    pub retry: RetryPolicy,
    /// Upper bound on how long a pause or permission wait goes without
    /// re-checking the session state.
    pub poll_interval: Duration,
    pub global_session_cap: usize,
    pub free_daily_quota: usize,
    pub pro_daily_quota: usize,
    pub max_read_bytes: u64,
    pub max_write_bytes: usize,
    pub max_changed_files: usize,
    pub max_search_results: usize,
    pub command_timeout: Duration,
    pub stdout_limit: usize,
    pub stderr_limit: usize,
    pub tool_output_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 8_192,
            plan_max_tokens: 2_048,
            max_iterations: 25,
            model_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(250),
            global_session_cap: 10,
            free_daily_quota: 5,
            pro_daily_quota: 50,
            max_read_bytes: 1024 * 1024,
            max_write_bytes: 512 * 1024,
            max_changed_files: 50,
            max_search_results: 50,
            command_timeout: Duration::from_secs(120),
            stdout_limit: 10_000,
            stderr_limit: 5_000,
            tool_output_limit: 30_000,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `TETHER_*` environment variables.
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AgentError> {
        let mut config = Self::default();
        if let Some(model) = lookup("TETHER_MODEL") {
            config.model = model;
        }
        if let Some(value) = parse_var(&lookup, "TETHER_MAX_ITERATIONS")? {
            config.max_iterations = value;
        }
        if let Some(value) = parse_var(&lookup, "TETHER_GLOBAL_SESSION_CAP")? {
            config.global_session_cap = value;
        }
        if let Some(value) = parse_var(&lookup, "TETHER_FREE_DAILY_QUOTA")? {
            config.free_daily_quota = value;
        }
        if let Some(value) = parse_var(&lookup, "TETHER_PRO_DAILY_QUOTA")? {
            config.pro_daily_quota = value;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TETHER_COMMAND_TIMEOUT_SECS")? {
            config.command_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TETHER_MODEL_TIMEOUT_SECS")? {
            config.model_timeout = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_iterations == 0 {
            return Err(AgentError::InvalidConfiguration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(AgentError::InvalidConfiguration(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(AgentError::InvalidConfiguration(
                "model must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn daily_quota(&self, is_pro: bool) -> usize {
        if is_pro {
            self.pro_daily_quota
        } else {
            self.free_daily_quota
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AgentError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim().parse::<T>().map(Some).map_err(|_| {
        AgentError::InvalidConfiguration(format!("{key} has an invalid value '{raw}'"))
    })
}
