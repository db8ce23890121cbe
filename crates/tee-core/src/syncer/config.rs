use super::task::AggregationWindow;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("aggregation max ({max:?}) is smaller than aggregation min ({min:?})")]
    InvertedAggregationWindow { min: Duration, max: Duration },
}

/// Tuning of a [`Syncer`](super::Syncer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncerConfig {
    /// Quiet period after the last change before a path is copied.
    pub aggregation_min: Duration,
    /// Upper bound between the first change and the copy.
    pub aggregation_max: Duration,
    /// Compare content digests and skip writes of identical files.
    pub enable_checksums: bool,
    /// Remove destination entries whose source vanished.
    pub mirror_deletions: bool,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            aggregation_min: Duration::from_secs(1),
            aggregation_max: Duration::from_secs(10),
            enable_checksums: false,
            mirror_deletions: false,
        }
    }
}

impl SyncerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregation_max < self.aggregation_min {
            return Err(ConfigError::InvertedAggregationWindow {
                min: self.aggregation_min,
                max: self.aggregation_max,
            });
        }
        Ok(())
    }

    /// The debounce window, with a zero minimum raised to one nanosecond
    /// and the maximum raised to at least the minimum.
    pub fn window(&self) -> AggregationWindow {
        let min = self.aggregation_min.max(Duration::from_nanos(1));
        AggregationWindow {
            min,
            max: self.aggregation_max.max(min),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SyncerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window().min, Duration::from_secs(1));
        assert_eq!(config.window().max, Duration::from_secs(10));
    }

    #[test]
    fn test_inverted_window_rejected() {
        let config = SyncerConfig {
            aggregation_min: Duration::from_secs(5),
            aggregation_max: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvertedAggregationWindow {
                min: Duration::from_secs(5),
                max: Duration::from_secs(1),
            })
        );
        assert_eq!(config.window().max, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_min_is_clamped() {
        let config = SyncerConfig {
            aggregation_min: Duration::ZERO,
            aggregation_max: Duration::ZERO,
            ..Default::default()
        };
        let window = config.window();
        assert_eq!(window.min, Duration::from_nanos(1));
        assert_eq!(window.max, Duration::from_nanos(1));
    }
}
