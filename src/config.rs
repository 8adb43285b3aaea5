//! Descriptor restriction settings for a launch.

use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Where the closer gets its upper bound from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ceiling {
    /// `sysconf(_SC_OPEN_MAX)`, read on every pass.
    #[default]
    Sysconf,
    /// A fixed bound, every descriptor at or above it is left alone.
    Fixed(RawFd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStrategy {
    /// `close` every unprotected descriptor below the ceiling.
    #[default]
    Scan,
    /// Close the gaps between protected descriptors with `close_range(2)`,
    /// falling back to `Scan` for a gap the kernel refuses.
    Ranges,
}

/// # Example
///
/// ```rust
/// use fdfence::config::{Ceiling, CloseStrategy, RestrictConfig};
///
/// let config = RestrictConfig::from_json(
///     r#"{ "ceiling": { "fixed": 4096 }, "strategy": "ranges" }"#,
/// )
/// .unwrap();
/// assert!(config.enabled);
/// assert_eq!(config.ceiling, Ceiling::Fixed(4096));
/// assert_eq!(config.strategy, CloseStrategy::Ranges);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestrictConfig {
    /// When false the child inherits every descriptor not marked
    /// close-on-exec.
    pub enabled: bool,
    /// Reserved room for protected descriptors. Derived from the number of
    /// options when unset.
    pub capacity_hint: Option<usize>,
    pub ceiling: Ceiling,
    pub strategy: CloseStrategy,
}

impl Default for RestrictConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity_hint: None,
            ceiling: Ceiling::default(),
            strategy: CloseStrategy::default(),
        }
    }
}

impl RestrictConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Inherit everything, close nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}
