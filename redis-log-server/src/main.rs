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

//! # Redis Log Server
//!
//! A reverse proxy pushing a JSON record of every request to a Redis list. A configuration file
//! could look like this:
//!
//! ```yaml
//! listen:
//! - 127.0.0.1:8080
//! upstream: http://127.0.0.1:8081
//! redis_key: applogs
//! redis_address: localhost:6379
//! log_address: udp/{env.LOG_HOST}:5140
//! log_soft_start: true
//! ```
//!
//! The server’s own log messages go to standard error unless `log_address` is configured. In the
//! latter case they are sent to the network address, standard error only receives messages that
//! couldn’t be delivered.
//!
//! The log level is controlled via the `RUST_LOG` environment variable, e.g. `RUST_LOG=info`.

use clap::Parser;
use log::error;
use net_log_writer::{NetLogConf, NetLogOpt, NetLogWriter};
use pandora_module_utils::pingora::{Error, ErrorType};
use pandora_module_utils::{merge_conf, merge_opt, FromYaml, RequestFilter};
use redis_log_module::{RedisLogHandler, RedisLogOpt};
use startup_module::{DefaultApp, StartupConf, StartupOpt};
use upstream_module::{UpstreamHandler, UpstreamOpt};

#[derive(Debug, RequestFilter)]
struct Handler {
    log: RedisLogHandler,
    upstream: UpstreamHandler,
}

/// Run Redis Log Server
#[merge_opt]
struct Opt {
    startup: StartupOpt,
    log: RedisLogOpt,
    upstream: UpstreamOpt,
    process_log: NetLogOpt,
}

/// The configuration of Redis Log Server
#[merge_conf]
struct Conf {
    startup: StartupConf,
    handler: <Handler as RequestFilter>::Conf,
    process_log: NetLogConf,
}

fn init_logger(conf: NetLogConf) -> Result<(), Box<Error>> {
    if conf.log_address.is_empty() {
        env_logger::init();
        return Ok(());
    }

    let writer = NetLogWriter::try_from(conf)?;
    let conn = writer.open().map_err(|err| {
        Error::because(
            ErrorType::ConnectError,
            format!("failed connecting to log address {writer}"),
            err,
        )
    })?;
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(conn)))
        .init();
    Ok(())
}

fn main() {
    let opt = Opt::parse();

    let (mut conf, load_error) =
        match Conf::load_from_files(opt.startup.conf.as_deref().unwrap_or(&[])) {
            Ok(conf) => (conf, None),
            Err(err) => (Conf::default(), Some(err)),
        };

    conf.process_log.merge_with_opt(opt.process_log);
    if let Err(err) = init_logger(conf.process_log.clone()) {
        env_logger::init();
        error!("{err}");
        return;
    }

    if let Some(err) = load_error {
        error!("{err}");
    }

    conf.handler.log.merge_with_opt(opt.log);
    conf.handler.upstream.merge_with_opt(opt.upstream);

    let server = match DefaultApp::<Handler>::from_conf(conf.handler)
        .and_then(|app| conf.startup.into_server(app, Some(opt.startup)))
    {
        Ok(server) => server,
        Err(err) => {
            error!("{err}");
            return;
        }
    };

    server.run_forever();
}
