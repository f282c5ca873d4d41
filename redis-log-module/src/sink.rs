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

//! Redis connection pushing records to a list

use log::{debug, info};
use pandora_module_utils::pingora::{Error, ErrorType};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisResult};
use std::fmt::{self, Debug};
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::configuration::RedisLogConf;

const DEFAULT_PORT: u16 = 6379;

fn parse_address(address: &str) -> Result<(String, u16), Box<Error>> {
    let invalid = || {
        Error::explain(
            ErrorType::InternalError,
            format!("invalid Redis address '{address}'"),
        )
    };

    let (host, port) = match address.rsplit_once(':') {
        // Bare IPv6 addresses contain colons but no port
        Some((host, _)) if host.contains(':') && !host.ends_with(']') => (address, DEFAULT_PORT),
        Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
        None => (address, DEFAULT_PORT),
    };
    let host = host
        .strip_prefix('[')
        .and_then(|host| host.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_owned(), port))
}

/// A Redis list that records are pushed to
pub(crate) struct RedisSink {
    key: String,
    address: String,
    client: Client,
    config: ConnectionManagerConfig,
    conn: OnceCell<ConnectionManager>,
}

impl Debug for RedisSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSink")
            .field("key", &self.key)
            .field("address", &self.address)
            .field("connected", &self.conn.initialized())
            .finish()
    }
}

impl RedisSink {
    /// Creates the client and verifies that the server can be reached.
    pub(crate) fn connect(conf: &RedisLogConf) -> Result<Self, Box<Error>> {
        let connect_timeout = conf.connect_timeout()?;
        let read_timeout = conf.read_timeout()?;
        let write_timeout = conf.write_timeout()?;
        let (host, port) = parse_address(&conf.redis_address)?;

        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, port),
            redis: RedisConnectionInfo {
                db: conf.redis_db,
                password: (!conf.redis_password.is_empty()).then(|| conf.redis_password.clone()),
                ..Default::default()
            },
        };
        let client = Client::open(info).map_err(|err| {
            Error::because(ErrorType::InternalError, "invalid Redis configuration", err)
        })?;

        Self::ping(&client, connect_timeout, read_timeout, write_timeout).map_err(|err| {
            Error::because(ErrorType::ConnectError, "could not connect to Redis", err)
        })?;
        info!(
            "Successfully connected to Redis, redis_key: {}, redis_address: {}",
            conf.redis_key, conf.redis_address
        );

        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(connect_timeout)
            .set_response_timeout(write_timeout + read_timeout)
            .set_number_of_retries(conf.max_retries());

        Ok(Self {
            key: conf.redis_key.clone(),
            address: conf.redis_address.clone(),
            client,
            config,
            conn: OnceCell::new(),
        })
    }

    /// Redis list records are pushed to
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    fn ping(
        client: &Client,
        connect_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> RedisResult<()> {
        let mut conn = client.get_connection_with_timeout(connect_timeout)?;
        conn.set_read_timeout(Some(read_timeout))?;
        conn.set_write_timeout(Some(write_timeout))?;
        redis::cmd("PING").query::<()>(&mut conn)
    }

    /// Pushes a record to the head of the list. The connection is established on first use and
    /// shared by all requests afterwards.
    pub(crate) async fn push(&self, payload: Vec<u8>) -> RedisResult<()> {
        let conn = self
            .conn
            .get_or_try_init(|| {
                debug!("Opening shared Redis connection to {}", self.address);
                ConnectionManager::new_with_config(self.client.clone(), self.config.clone())
            })
            .await?;

        // The connection manager is a cheap handle to a multiplexed connection
        let mut conn = conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
