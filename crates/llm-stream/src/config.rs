use std::time::Duration;

use crate::errors::ConfigError;

const TIMEOUT_ENV: &str = "LLM_STREAM_TIMEOUT_MS";
const BUFFER_ENV: &str = "LLM_STREAM_BUFFER_CAPACITY";

/// Per-generation engine settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Cancels the generation if it has not completed within this duration.
    pub timeout: Option<Duration>,
    /// Live text chunks buffered before the read loop waits for the reader.
    pub text_buffer_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            text_buffer_capacity: 16,
        }
    }
}

impl StreamConfig {
    /// Builds a config from `LLM_STREAM_TIMEOUT_MS` and
    /// `LLM_STREAM_BUFFER_CAPACITY`, falling back to defaults for unset keys.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(TIMEOUT_ENV).filter(|v| !v.trim().is_empty()) {
            let millis = parse_u64(TIMEOUT_ENV, &raw)?;
            config.timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
        if let Some(raw) = lookup(BUFFER_ENV).filter(|v| !v.trim().is_empty()) {
            let capacity = parse_u64(BUFFER_ENV, &raw)?;
            config.text_buffer_capacity =
                usize::try_from(capacity).map_err(|e| ConfigError::InvalidEnv {
                    key: BUFFER_ENV.to_string(),
                    message: format!("{capacity} does not fit in usize: {e}"),
                })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Overrides the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the live text buffer capacity.
    pub fn text_buffer_capacity(mut self, capacity: usize) -> Self {
        self.text_buffer_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.text_buffer_capacity == 0 {
            return Err(ConfigError::Validation(
                "text_buffer_capacity must be greater than 0".into(),
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Validation(
                "timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidEnv {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
