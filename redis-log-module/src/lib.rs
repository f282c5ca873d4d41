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

//! # Redis Log Module for Pandora Web Server
//!
//! This crate pushes a JSON record of every request to a Redis list, where it can be picked up
//! by log processing tools. A configuration could look like this:
//!
//! ```yaml
//! redis_key: applogs
//! redis_address: localhost:6379
//! redis_password: secret
//! redis_db: 0
//! redis_with_body: false
//! redis_connect_timeout: 5
//! redis_read_timeout: 3
//! redis_write_timeout: 3
//! redis_max_retries: 3
//! redis_compress: false
//! ```
//!
//! The `redis_key` and `redis_address` fields are also available as `--redis-key` and
//! `--redis-address` command line options. Logging is disabled if no key is configured. Timeouts
//! are given in seconds, zero timeouts and retry counts mean using the defaults shown above.
//!
//! The Redis server is contacted when the configuration is loaded, the server won’t start if
//! Redis cannot be reached. Failing to push a record later on is logged but doesn’t affect request
//! processing.
//!
//! Each record is a JSON object like the following:
//!
//! ```json
//! {
//!   "ts": "2024-05-01T12:00:00.123456789+02:00",
//!   "request": {
//!     "remote_ip": "127.0.0.1",
//!     "remote_port": "51234",
//!     "client_ip": "",
//!     "proto": "HTTP/1.1",
//!     "method": "GET",
//!     "host": "localhost:8080",
//!     "uri": "/index.html",
//!     "headers": {"accept": ["*/*"], "host": ["localhost:8080"]},
//!     "tls": {"version": "TLSv1.3", "cipher_suite": "TLS_AES_256_GCM_SHA384"}
//!   },
//!   "bytes_read": 0,
//!   "duration": 0.000412,
//!   "size": 1234,
//!   "status": 200,
//!   "resp_headers": {"content-type": ["text/html"]}
//! }
//! ```
//!
//! The `client_ip` field is the value of the `X-Forwarded-For` header, `tls` is only present for
//! TLS connections. With `redis_with_body` enabled, the record also contains a `request_body`
//! field. Request bodies exceeding Pingora’s retry buffer size are recorded as an empty string.
//!
//! With `redis_compress` enabled, records are gzip-compressed before being pushed to Redis. The
//! [`decompress`] function can be used to restore the JSON data.
//!
//! ## Code example
//!
//! `RedisLogHandler` first handles the `request_filter` phase where it captures relevant data
//! before it has been altered. The record is pushed to Redis during the `logging` phase.
//!
//! ```rust,no_run
//! use clap::Parser;
//! use pandora_module_utils::{merge_conf, merge_opt, FromYaml, RequestFilter};
//! use redis_log_module::{RedisLogHandler, RedisLogOpt};
//! use startup_module::{DefaultApp, StartupConf, StartupOpt};
//! use upstream_module::{UpstreamHandler, UpstreamOpt};
//!
//! #[derive(Debug, RequestFilter)]
//! struct Handler {
//!     log: RedisLogHandler,
//!     upstream: UpstreamHandler,
//! }
//!
//! #[merge_conf]
//! struct Conf {
//!     startup: StartupConf,
//!     handler: <Handler as RequestFilter>::Conf,
//! }
//!
//! #[merge_opt]
//! struct Opt {
//!     startup: StartupOpt,
//!     log: RedisLogOpt,
//!     upstream: UpstreamOpt,
//! }
//!
//! let opt = Opt::parse();
//! let mut conf = Conf::load_from_files(opt.startup.conf.as_deref().unwrap_or(&[])).unwrap();
//! conf.handler.log.merge_with_opt(opt.log);
//! conf.handler.upstream.merge_with_opt(opt.upstream);
//!
//! let app = DefaultApp::<Handler>::from_conf(conf.handler).unwrap();
//! let server = conf.startup.into_server(app, Some(opt.startup)).unwrap();
//!
//! // Do something with the server here, e.g. call server.run_forever()
//! ```

mod compression;
pub mod configuration;
pub mod entry;
#[cfg(test)]
mod fake_redis;
mod handler;
mod sink;

pub use compression::decompress;
pub use configuration::{RedisLogConf, RedisLogOpt};
pub use handler::RedisLogHandler;
