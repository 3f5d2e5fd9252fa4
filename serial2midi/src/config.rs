//! Bridge configuration.
//!
//! The command line builds a [`BridgeConfig`] and hands it to the supervisor;
//! nothing in here is persisted between runs.

use std::time::Duration;

use crate::{
    error::{Error, Result},
    matcher::Matcher,
};

/// Default virtual device name.
pub const DEFAULT_NAME: &str = "Serial2MIDI";

/// Default serial bit rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default delay between discovery, open, and reconnect attempts.
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_millis(300);

/// Everything the bridge engine needs to run.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Base name of the virtual MIDI device
    pub name: String,

    /// Serial bit rate
    pub baud_rate: u32,

    /// Retry and reconnect delay
    pub sleep_interval: Duration,

    /// Which discovered devices are eligible
    pub matcher: Matcher,

    /// Explicit device path; bypasses discovery when set
    pub manual_device: Option<String>,

    /// Appended to `name` as `name-suffix`
    pub endpoint_suffix: Option<String>,

    /// Replaces the computed endpoint name entirely
    pub forced_endpoint_name: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
            matcher: Matcher::any(),
            manual_device: None,
            endpoint_suffix: None,
            forced_endpoint_name: None,
        }
    }
}

impl BridgeConfig {
    /// Name under which the virtual MIDI ports are published.
    pub fn endpoint_name(&self) -> String {
        if let Some(forced) = self.forced_endpoint_name.as_deref().filter(|n| !n.is_empty()) {
            return forced.to_string();
        }
        match self.endpoint_suffix.as_deref().filter(|s| !s.is_empty()) {
            Some(suffix) => format!("{}-{}", self.name, suffix),
            None => self.name.clone(),
        }
    }

    /// Convert a retry delay given in seconds.
    pub fn sleep_interval_from_secs(secs: f64) -> Result<Duration> {
        Duration::try_from_secs_f64(secs).map_err(|_| {
            Error::Config(format!(
                "sleep interval must be a finite, non-negative number of seconds (got {})",
                secs
            ))
        })
    }

    /// Check values the command line cannot constrain by type alone.
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(Error::Config("baud rate must be non-zero".into()));
        }
        if self.endpoint_name().is_empty() {
            return Err(Error::Config("virtual device name must not be empty".into()));
        }
        if matches!(&self.manual_device, Some(path) if path.is_empty()) {
            return Err(Error::Config("serial device path must not be empty".into()));
        }
        Ok(())
    }
}
