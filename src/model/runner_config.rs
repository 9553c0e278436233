use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum/maximum allowed `max_concurrency` (`spec.md` §8 boundary
/// behaviors: "clamps to [1,10]; 0 or negative inputs become 1").
pub const MIN_CONCURRENCY: u32 = 1;
pub const MAX_CONCURRENCY: u32 = 10;

/// Singleton per data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub max_concurrency: u32,
    pub updated_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl RunnerConfig {
    /// Clamp a requested value to `[MIN_CONCURRENCY, MAX_CONCURRENCY]`.
    /// Anything non-positive becomes the minimum.
    pub fn clamp_concurrency(requested: i64) -> u32 {
        if requested < MIN_CONCURRENCY as i64 {
            MIN_CONCURRENCY
        } else if requested > MAX_CONCURRENCY as i64 {
            MAX_CONCURRENCY
        } else {
            requested as u32
        }
    }

    pub fn new(requested: i64, now: DateTime<Utc>, reason: Option<String>) -> Self {
        Self {
            max_concurrency: Self::clamp_concurrency(requested),
            updated_at: now,
            reason,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: MIN_CONCURRENCY,
            updated_at: Utc::now(),
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_range() {
        assert_eq!(RunnerConfig::clamp_concurrency(0), 1);
        assert_eq!(RunnerConfig::clamp_concurrency(-5), 1);
        assert_eq!(RunnerConfig::clamp_concurrency(3), 3);
        assert_eq!(RunnerConfig::clamp_concurrency(100), 10);
    }
}
