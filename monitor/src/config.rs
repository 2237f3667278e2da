use std::time::Duration;

/// Engine settings fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Retries per unit of work after its first attempt
    pub max_retry: u32,
    /// Expected number of units, for progress reporting only
    pub estimated_total: u64,
    /// Wall-clock budget per unit of work across all its attempts
    pub task_timeout: Option<Duration>,
    /// Poll cycle period handed to `start`
    pub poll_period: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            estimated_total: 0,
            task_timeout: None,
            poll_period: Duration::from_secs(1),
        }
    }
}

impl MonitorConfig {
    pub fn new(max_retry: u32, estimated_total: u64) -> Self {
        Self {
            max_retry,
            estimated_total,
            ..Self::default()
        }
    }

    /// A non-positive timeout disables it.
    pub fn with_timeout_millis(mut self, timeout_ms: i64) -> Self {
        self.task_timeout = timeout_from_millis(timeout_ms);
        self
    }

    pub fn with_poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = poll_period;
        self
    }

    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let poll_period_ms: u64 = env_parse(
            "SUBTASK_POLL_PERIOD_MS",
            defaults.poll_period.as_millis() as u64,
        )?;
        if poll_period_ms == 0 {
            return Err(anyhow::anyhow!("SUBTASK_POLL_PERIOD_MS must be positive"));
        }

        Ok(Self {
            max_retry: env_parse("SUBTASK_MAX_RETRY", defaults.max_retry)?,
            estimated_total: env_parse("SUBTASK_ESTIMATED_TOTAL", defaults.estimated_total)?,
            task_timeout: timeout_from_millis(env_parse("SUBTASK_TIMEOUT_MS", 0i64)?),
            poll_period: Duration::from_millis(poll_period_ms),
        })
    }
}

fn timeout_from_millis(timeout_ms: i64) -> Option<Duration> {
    u64::try_from(timeout_ms)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

pub fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
