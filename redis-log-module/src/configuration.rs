// Copyright 2024 Wladimir Palant
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

//! Structures handling command line options and YAML deserialization for the Redis Log Module

use clap::Parser;
use pandora_module_utils::pingora::{Error, ErrorType};
use pandora_module_utils::DeserializeMap;
use std::time::Duration;

/// Default Redis server address
pub const DEFAULT_ADDRESS: &str = "localhost:6379";

const DEFAULT_CONNECT_TIMEOUT: f64 = 5.0;
const DEFAULT_READ_TIMEOUT: f64 = 3.0;
const DEFAULT_WRITE_TIMEOUT: f64 = 3.0;
const DEFAULT_MAX_RETRIES: usize = 3;

/// Command line options of the Redis log module
#[derive(Debug, Default, Parser)]
pub struct RedisLogOpt {
    /// Redis list to push request records to (omit to disable logging)
    #[clap(long)]
    pub redis_key: Option<String>,

    /// Address of the Redis server, e.g. localhost:6379
    #[clap(long)]
    pub redis_address: Option<String>,
}

/// Configuration settings of the Redis log module
#[derive(Debug, Clone, PartialEq, DeserializeMap)]
pub struct RedisLogConf {
    /// Redis list to push request records to. An empty value disables logging.
    pub redis_key: String,

    /// Address of the Redis server as `host:port`. The port defaults to 6379.
    pub redis_address: String,

    /// Password to authenticate with, empty for no authentication
    pub redis_password: String,

    /// Redis database index
    pub redis_db: i64,

    /// If `true`, the request body will be added to the record
    pub redis_with_body: bool,

    /// Time in seconds to wait when connecting to Redis
    pub redis_connect_timeout: f64,

    /// Time in seconds to wait for a Redis response
    pub redis_read_timeout: f64,

    /// Time in seconds to wait when sending a command to Redis
    pub redis_write_timeout: f64,

    /// Number of reconnection attempts if the Redis connection is lost
    pub redis_max_retries: usize,

    /// If `true`, records will be gzip-compressed before pushing them to Redis
    pub redis_compress: bool,
}

impl Default for RedisLogConf {
    fn default() -> Self {
        Self {
            redis_key: String::new(),
            redis_address: DEFAULT_ADDRESS.to_owned(),
            redis_password: String::new(),
            redis_db: 0,
            redis_with_body: false,
            redis_connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            redis_read_timeout: DEFAULT_READ_TIMEOUT,
            redis_write_timeout: DEFAULT_WRITE_TIMEOUT,
            redis_max_retries: DEFAULT_MAX_RETRIES,
            redis_compress: false,
        }
    }
}

fn timeout(name: &str, value: f64, default: f64) -> Result<Duration, Box<Error>> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::explain(
            ErrorType::InternalError,
            format!("{name} cannot be less than 0"),
        ));
    }

    Ok(Duration::from_secs_f64(if value == 0.0 {
        default
    } else {
        value
    }))
}

impl RedisLogConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: RedisLogOpt) {
        if let Some(redis_key) = opt.redis_key {
            self.redis_key = redis_key;
        }

        if let Some(redis_address) = opt.redis_address {
            self.redis_address = redis_address;
        }
    }

    /// Connect timeout, zero meaning the default
    pub(crate) fn connect_timeout(&self) -> Result<Duration, Box<Error>> {
        timeout(
            "redis_connect_timeout",
            self.redis_connect_timeout,
            DEFAULT_CONNECT_TIMEOUT,
        )
    }

    /// Read timeout, zero meaning the default
    pub(crate) fn read_timeout(&self) -> Result<Duration, Box<Error>> {
        timeout(
            "redis_read_timeout",
            self.redis_read_timeout,
            DEFAULT_READ_TIMEOUT,
        )
    }

    /// Write timeout, zero meaning the default
    pub(crate) fn write_timeout(&self) -> Result<Duration, Box<Error>> {
        timeout(
            "redis_write_timeout",
            self.redis_write_timeout,
            DEFAULT_WRITE_TIMEOUT,
        )
    }

    pub(crate) fn max_retries(&self) -> usize {
        if self.redis_max_retries == 0 {
            DEFAULT_MAX_RETRIES
        } else {
            self.redis_max_retries
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pandora_module_utils::FromYaml;
    use test_log::test;

    #[test]
    fn defaults() {
        let conf = RedisLogConf::from_yaml("redis_key: applogs").unwrap();
        assert_eq!(conf.redis_key, "applogs");
        assert_eq!(conf.redis_address, "localhost:6379");
        assert_eq!(conf.redis_db, 0);
        assert!(!conf.redis_with_body);
        assert_eq!(conf.connect_timeout().unwrap(), Duration::from_secs(5));
        assert_eq!(conf.read_timeout().unwrap(), Duration::from_secs(3));
        assert_eq!(conf.write_timeout().unwrap(), Duration::from_secs(3));
        assert_eq!(conf.max_retries(), 3);
    }

    #[test]
    fn zero_and_negative() {
        let conf = RedisLogConf::from_yaml(
            r#"
                redis_connect_timeout: 0
                redis_read_timeout: 0.5
                redis_write_timeout: -1
                redis_max_retries: 0
            "#,
        )
        .unwrap();
        assert_eq!(conf.connect_timeout().unwrap(), Duration::from_secs(5));
        assert_eq!(conf.read_timeout().unwrap(), Duration::from_millis(500));
        assert!(conf.write_timeout().is_err());
        assert_eq!(conf.max_retries(), 3);
    }

    #[test]
    fn command_line_precedence() {
        let mut conf = RedisLogConf::from_yaml(
            r#"
                redis_key: applogs
                redis_address: redis.local:6380
            "#,
        )
        .unwrap();

        conf.merge_with_opt(RedisLogOpt::default());
        assert_eq!(conf.redis_key, "applogs");
        assert_eq!(conf.redis_address, "redis.local:6380");

        conf.merge_with_opt(RedisLogOpt::parse_from(["test", "--redis-key", "other"]));
        assert_eq!(conf.redis_key, "other");
        assert_eq!(conf.redis_address, "redis.local:6380");
    }
}
