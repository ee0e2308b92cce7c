use std::time::Duration;

/// Controller knobs, read from `TETHER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Parallel bundle workers.
    pub workers: usize,
    /// Period of the full resync that re-enqueues every cached Bundle.
    pub resync: Duration,
    /// Restrict the controller to one namespace; `None` watches all.
    pub namespace: Option<String>,
    /// Capacity of each informer's delta channel, and of the controller's work
    /// queue. A full work queue drops its oldest key; the next resync or event
    /// for that Bundle queues it again.
    pub queue_cap: usize,
    pub field_manager: String,
    /// First retry delay after a retriable failure; doubles up to `max_backoff`.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 2,
            resync: Duration::from_secs(600),
            namespace: None,
            queue_cap: 2048,
            field_manager: "tether".to_string(),
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_parse::<usize>("TETHER_WORKERS").filter(|n| *n > 0).unwrap_or(d.workers),
            resync: env_parse::<u64>("TETHER_RESYNC_SECS").map(Duration::from_secs).unwrap_or(d.resync),
            namespace: std::env::var("TETHER_NAMESPACE").ok().filter(|s| !s.is_empty()),
            queue_cap: env_parse::<usize>("TETHER_QUEUE_CAP").filter(|n| *n > 0).unwrap_or(d.queue_cap),
            field_manager: std::env::var("TETHER_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or(d.field_manager),
            ..d
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1u32 << shift).min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let c = Config::default();
        assert_eq!(c.backoff(1), Duration::from_secs(5));
        assert_eq!(c.backoff(2), Duration::from_secs(10));
        assert_eq!(c.backoff(4), Duration::from_secs(40));
        assert_eq!(c.backoff(7), Duration::from_secs(300));
        assert_eq!(c.backoff(100), Duration::from_secs(300));
    }
}
