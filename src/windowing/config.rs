use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::models::{StreamKind, FOOT_VALUE_COUNT, INERTIAL_VALUE_COUNT};

/// Window sizing and vector layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// A window finalizes once its span reaches this many milliseconds.
    pub window_size_ms: i64,

    /// Most recent readings kept per stream when encoding.
    pub slots_per_stream: usize,

    /// Vector length; must equal the layout width.
    pub dimension: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size_ms: 500,
            slots_per_stream: 10,
            dimension: 270,
        }
    }
}

/// Sub-vector width of one reading of `stream`.
pub fn stream_width(stream: StreamKind) -> usize {
    match stream {
        StreamKind::Foot => FOOT_VALUE_COUNT,
        StreamKind::Inertial => INERTIAL_VALUE_COUNT,
    }
}

impl WindowConfig {
    pub fn layout_width(&self) -> usize {
        StreamKind::ALL
            .iter()
            .map(|stream| self.slots_per_stream * stream_width(*stream))
            .sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size_ms <= 0 {
            bail!("window_size_ms must be positive, got {}", self.window_size_ms);
        }
        if self.slots_per_stream == 0 {
            bail!("slots_per_stream must be at least 1");
        }
        if self.dimension != self.layout_width() {
            bail!(
                "dimension {} does not match layout width {} ({} slots per stream)",
                self.dimension,
                self.layout_width(),
                self.slots_per_stream
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_270_wide() {
        let config = WindowConfig::default();
        assert_eq!(config.layout_width(), 270);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mismatched_dimension_is_rejected() {
        let config = WindowConfig {
            dimension: 256,
            ..WindowConfig::default()
        };
        assert!(config.validate().is_err());

        let config = WindowConfig {
            slots_per_stream: 4,
            dimension: 108,
            ..WindowConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
