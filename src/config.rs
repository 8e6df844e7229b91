use std::{fs::read_to_string, path::Path, time::Duration};

use serde::Deserialize;

use crate::{Error, Result};

/// Endpoint configuration.
///
/// The protocol itself carries no timeouts; both bounds below are local
/// policy. A zero `request_timeout_ms` disables the per-request bound.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// hide own id in outgoing requests
    ///
    /// an anonymous endpoint sends `src = null`, so the peer cannot tell
    /// which endpoint issued the request.
    #[serde(default = "Config::anonymous")]
    pub anonymous: bool,

    /// accept anonymous traffic
    ///
    /// when disabled, inbound requests without a source are answered with a
    /// canned error reply and replies without a source fail the request.
    #[serde(default = "Config::allow_anonymous")]
    pub allow_anonymous: bool,

    /// TCP connect bound in milliseconds
    #[serde(default = "Config::connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// per-request bound in milliseconds, 0 to disable
    #[serde(default = "Config::request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// largest frame accepted or produced, in bytes
    ///
    /// frames announcing a larger payload are rejected and terminate their
    /// connection.
    #[serde(default = "Config::max_frame_size")]
    pub max_frame_size: usize,
}

impl Config {
    fn anonymous() -> bool {
        false
    }

    fn allow_anonymous() -> bool {
        true
    }

    fn connect_timeout_ms() -> u64 {
        5000
    }

    fn request_timeout_ms() -> u64 {
        0
    }

    fn max_frame_size() -> usize {
        64 * 1024 * 1024
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Loads a configuration file in TOML format.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let buffer = read_to_string(path).map_err(|e| Error::Config(e.to_string()))?;
        toml::from_str(&buffer).map_err(|e| Error::Config(e.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            anonymous: Self::anonymous(),
            allow_anonymous: Self::allow_anonymous(),
            connect_timeout_ms: Self::connect_timeout_ms(),
            request_timeout_ms: Self::request_timeout_ms(),
            max_frame_size: Self::max_frame_size(),
        }
    }
}
