use std::time::Duration;

use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct SenderConfig {
    /// Upper bound on records per delivery attempt.
    pub max_records: usize,
    pub polling_interval: Duration,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    /// Delivered rows older than this are pruned.
    pub retention: Duration,
    pub cleanup_interval: Duration,
    /// Fraction of the backoff delay randomly added or removed. 0 disables jitter.
    pub jitter_ratio: f64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_records: 100,
            polling_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(60),
            max_backoff: Duration::from_secs(3600),
            retention: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
            jitter_ratio: 0.0,
        }
    }
}

impl SenderConfig {
    /// Every interval must be non-zero: the loop sleeps on them and ticks the cleanup timer.
    pub fn validate(&self) -> Result<()> {
        if self.max_records == 0 {
            bail!("max_records must be at least 1");
        }
        for (name, value) in [
            ("polling_interval", self.polling_interval),
            ("backoff_base", self.backoff_base),
            ("cleanup_interval", self.cleanup_interval),
        ] {
            if value.is_zero() {
                bail!("{name} must be greater than zero");
            }
        }
        if self.max_backoff < self.backoff_base {
            bail!(
                "max_backoff {:?} is smaller than backoff_base {:?}",
                self.max_backoff,
                self.backoff_base
            );
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            bail!("jitter_ratio must be within 0..=1, got {}", self.jitter_ratio);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SenderConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let zero_cleanup = SenderConfig {
            cleanup_interval: Duration::ZERO,
            ..SenderConfig::default()
        };
        let zero_polling = SenderConfig {
            polling_interval: Duration::ZERO,
            ..SenderConfig::default()
        };
        let zero_backoff = SenderConfig {
            backoff_base: Duration::ZERO,
            ..SenderConfig::default()
        };
        for config in [zero_cleanup, zero_polling, zero_backoff] {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn cap_below_base_is_rejected() {
        let config = SenderConfig {
            max_backoff: Duration::from_secs(30),
            ..SenderConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
