// invtrace: Passive Measurement of Inventory Propagation and Peer Latency from Captured P2P Traffic
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Configuration of the ingest daemon.
use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::protocol::Network;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Settings read once at startup and passed to every component that needs them.
///
/// ```json
/// {
///     "logfile": "/var/log/invtrace/invtrace.log",
///     "debug": false,
///     "ttl": 10800,
///     "rtt_count": 36,
///     "pcap_dir": "/var/lib/invtrace/pcap"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub logfile: PathBuf,
    #[serde(default)]
    pub debug: bool,
    /// Seconds an observation stays authoritative.
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    /// Number of RTT samples kept per peer.
    #[serde(default = "default_rtt_count")]
    pub rtt_count: usize,
    /// Directory the capture files are rotated into.
    pub pcap_dir: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub network: Network,
    /// Redis server holding the results and the ping records, e.g. `redis://127.0.0.1/` or
    /// `redis+unix:///tmp/redis.sock`. If missing, an in-process store is used instead.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Where the in-process store is persisted. Ignored with `redis_url`.
    #[serde(default)]
    pub store_snapshot: Option<PathBuf>,
}

fn default_ttl() -> u64 {
    10800
}

fn default_rtt_count() -> usize {
    36
}

fn default_extension() -> String {
    "pcap".to_string()
}

impl Config {
    /// Read and validate the configuration at `path`, and create the capture directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let config = Self::from_json(&fs::read_to_string(path).map_err(io_err)?)?;
        fs::create_dir_all(&config.pcap_dir).map_err(|source| ConfigError::Io {
            path: config.pcap_dir.clone(),
            source,
        })?;
        Ok(config)
    }

    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl == 0 {
            return Err(ConfigError::Invalid {
                field: "ttl",
                reason: "must be positive",
            });
        }
        if self.rtt_count == 0 {
            return Err(ConfigError::Invalid {
                field: "rtt_count",
                reason: "must be positive",
            });
        }
        if self.extension.is_empty() || self.extension.contains(['/', '*', '?', '[']) {
            return Err(ConfigError::Invalid {
                field: "extension",
                reason: "must be a plain file extension",
            });
        }
        if self.redis_url.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Invalid {
                field: "redis_url",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}
