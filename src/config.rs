//! Pipeline configuration, threaded explicitly through every stage.
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_THRESHOLD_TIME: f64 = 120.0;
pub const DEFAULT_MAX_PORT: u16 = 1024;
pub const DEFAULT_TIME_CONSTANT: f64 = 3600.0;

/// Which half of an `ip-mac` pair identifies the capture source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    #[default]
    Mac,
    Ip,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AddressType::Mac => write!(f, "mac"),
            AddressType::Ip => write!(f, "ip"),
        }
    }
}

impl FromStr for AddressType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mac" => Ok(AddressType::Mac),
            "ip" => Ok(AddressType::Ip),
            other => Err(Error::InvalidConfig(format!("unknown address type '{other}'"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seconds per session bin. `None` puts the whole capture in one bin.
    pub duration: Option<f64>,
    /// Warm-up window in seconds; flows first seen inside it are ignored.
    pub threshold_time: f64,
    /// Highest port number that gets its own block in the feature vector.
    pub max_port: u16,
    /// EMA time constant in seconds.
    pub time_constant: f64,
    pub address_type: AddressType,
    /// Count every participant during source resolution, not just private ones.
    pub include_all_sessions: bool,
    /// Size of the capture worker pool.
    pub workers: usize,
    /// Hard limit on a single tshark run, in seconds.
    pub dissector_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            duration: None,
            threshold_time: DEFAULT_THRESHOLD_TIME,
            max_port: DEFAULT_MAX_PORT,
            time_constant: DEFAULT_TIME_CONSTANT,
            address_type: AddressType::default(),
            include_all_sessions: false,
            workers: 4,
            dissector_timeout_secs: 300,
        }
    }
}

impl PipelineConfig {
    /// Rejects values the pipeline refuses to coerce.
    pub fn validate(&self) -> Result<()> {
        if let Some(duration) = self.duration {
            if !duration.is_finite() || duration <= 0.0 {
                return Err(Error::InvalidConfig(format!("duration must be positive, got {duration}")));
            }
        }
        if !self.threshold_time.is_finite() || self.threshold_time < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "threshold_time must be at least 1 second, got {}",
                self.threshold_time
            )));
        }
        if !self.time_constant.is_finite() || self.time_constant <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "time_constant must be positive, got {}",
                self.time_constant
            )));
        }
        if self.workers == 0 {
            return Err(Error::InvalidConfig("workers must be at least 1".into()));
        }
        if self.dissector_timeout_secs == 0 {
            return Err(Error::InvalidConfig("dissector timeout must be at least 1 second".into()));
        }

        Ok(())
    }

    pub fn dissector_timeout(&self) -> Duration {
        Duration::from_secs(self.dissector_timeout_secs)
    }

    /// Length of every feature vector produced under this configuration.
    pub fn feature_len(&self) -> usize {
        crate::analyser::features::feature_len(self.max_port)
    }
}
