use anyhow::{anyhow, Result};
use arena_core::{
    parse_env_bool, parse_optional_positive_usize_env, parse_optional_string_env,
    ARENA_ENV_MAX_STEPS, ARENA_ENV_RESULTS_DIR, ARENA_ENV_TRACKER_ENDPOINT,
    ARENA_ENV_USE_TRACKER, DEFAULT_MAX_STEPS, DEFAULT_RESULTS_DIR,
};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConductorConfig {
    pub use_tracker: bool,
    pub tracker_endpoint: Option<String>,
    pub results_dir: PathBuf,
    pub max_steps: usize,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            use_tracker: false,
            tracker_endpoint: None,
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

impl ConductorConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            use_tracker: parse_env_bool(ARENA_ENV_USE_TRACKER, false)?,
            tracker_endpoint: parse_optional_string_env(ARENA_ENV_TRACKER_ENDPOINT)?,
            results_dir: parse_optional_string_env(ARENA_ENV_RESULTS_DIR)?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RESULTS_DIR)),
            max_steps: parse_optional_positive_usize_env(ARENA_ENV_MAX_STEPS)?
                .unwrap_or(DEFAULT_MAX_STEPS),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_steps(mut self, max_steps: Option<usize>) -> Result<Self> {
        if let Some(max_steps) = max_steps {
            if max_steps == 0 {
                return Err(anyhow!("max steps must be > 0"));
            }
            self.max_steps = max_steps;
        }
        Ok(self)
    }

    pub fn with_results_dir(mut self, results_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = results_dir {
            self.results_dir = dir;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.use_tracker && self.tracker_endpoint.is_none() {
            return Err(anyhow!(
                "{} is enabled but {} is not set",
                ARENA_ENV_USE_TRACKER,
                ARENA_ENV_TRACKER_ENDPOINT
            ));
        }
        Ok(())
    }
}
