// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pool configurations
//!
//! The configuration file is YAML. Keys this crate doesn't know about are ignored, so the pool
//! settings can live in the same file as the rest of a client's settings.

use log::{debug, trace};
use redpool_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// The pool section of a configuration file
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConf {
    /// Version
    pub version: usize,
    /// The upper bound of live connections. Must be positive.
    pub max_connections: usize,
    /// Per-read timeout in milliseconds. Unset or 0 disables it.
    pub read_timeout_ms: Option<u64>,
    /// Per-write timeout in milliseconds. Unset or 0 disables it.
    pub write_timeout_ms: Option<u64>,
    /// Idle connections older than this many seconds are closed on the next checkout.
    pub idle_timeout_seconds: Option<u64>,
    /// How long the bundled dialers wait for a connection to be established.
    pub connect_timeout_ms: Option<u64>,
}

impl Default for PoolConf {
    fn default() -> Self {
        PoolConf {
            version: 0,
            max_connections: 10,
            read_timeout_ms: None,
            write_timeout_ms: None,
            idle_timeout_seconds: None,
            connect_timeout_ms: None,
        }
    }
}

impl PoolConf {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(FileReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: PoolConf = serde_yaml::from_str(conf_str).or_err_with(InvalidConf, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");
        conf.validate()
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).or_err(InvalidConf, "Unable to serialize conf")
    }

    pub fn validate(self) -> Result<Self> {
        if self.max_connections == 0 {
            return Error::e_explain(InvalidConf, "max_connections must be positive");
        }
        Ok(self)
    }

    /// The connect timeout for the bundled dialers
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms
            .filter(|t| *t > 0)
            .map(Duration::from_millis)
    }
}
