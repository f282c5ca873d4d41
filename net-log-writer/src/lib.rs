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

//! # Network Log Writer for Pandora Web Server
//!
//! This crate sends the process log of a Pandora Web Server to a network socket, for example a
//! syslog collector. A configuration could look like this:
//!
//! ```yaml
//! log_address: tcp/{env.LOG_HOST}:5140
//! log_dial_timeout: 5
//! log_soft_start: true
//! ```
//!
//! The same settings are available as `--log-address`, `--log-dial-timeout` and
//! `--log-soft-start` command line options.
//!
//! The address can be prefixed with one of the network types `tcp` (default), `tcp4`, `tcp6`,
//! `udp`, `udp4`, `udp6` or `unix`. For Unix domain sockets the address is the socket path, e.g.
//! `unix//run/log.sock`.
//!
//! Once connected, the writer never reports errors to its caller. If a write fails, the
//! connection is dialed again, at most once every 10 seconds. Anything that cannot be delivered
//! is written to standard error instead. With `log_soft_start` enabled, an unreachable log
//! destination at startup is reported to standard error and the writer starts out disconnected.
//!
//! ## Code example
//!
//! The connection implements [`std::io::Write`], so that it can serve as `env_logger` target:
//!
//! ```rust,no_run
//! use net_log_writer::{NetLogConf, NetLogWriter};
//! use pandora_module_utils::FromYaml;
//!
//! let conf = NetLogConf::from_yaml("log_address: udp/127.0.0.1:5140").unwrap();
//! let writer = NetLogWriter::try_from(conf).unwrap();
//! let conn = writer.open().unwrap();
//!
//! env_logger::Builder::from_default_env()
//!     .target(env_logger::Target::Pipe(Box::new(conn)))
//!     .init();
//! ```

mod address;
pub mod configuration;
mod connection;
mod writer;

pub use address::{expand_placeholders, Network, NetworkAddress};
pub use configuration::{NetLogConf, NetLogOpt};
pub use connection::RedialingConn;
pub use writer::NetLogWriter;
