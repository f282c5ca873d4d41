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

//! Structures handling command line options and YAML deserialization for the network log writer

use clap::Parser;
use pandora_module_utils::DeserializeMap;

/// Command line options of the network log writer
#[derive(Debug, Default, Parser)]
pub struct NetLogOpt {
    /// Network address to send the process log to, e.g. tcp/localhost:5140 or
    /// unix//run/log.sock (omit to log to standard error)
    #[clap(long)]
    pub log_address: Option<String>,

    /// Time in seconds to wait when connecting to the log address (0 means no timeout)
    #[clap(long)]
    pub log_dial_timeout: Option<f64>,

    /// Keep going if the log address cannot be reached initially, log to standard error until
    /// the connection succeeds
    #[clap(long)]
    pub log_soft_start: bool,
}

/// Configuration settings of the network log writer
#[derive(Debug, Default, Clone, PartialEq, DeserializeMap)]
pub struct NetLogConf {
    /// Network address to send the process log to. The network type is optional and can be one
    /// of `tcp` (default), `tcp4`, `tcp6`, `udp`, `udp4`, `udp6` and `unix`. Placeholders like
    /// `{env.LOG_HOST}` are replaced by the respective environment variable.
    ///
    /// An empty address means that process log goes to standard error.
    pub log_address: String,

    /// Time in seconds to wait when connecting to the log address, `0` means no timeout
    pub log_dial_timeout: f64,

    /// If `true`, failing to connect initially is not an error. Log output goes to standard
    /// error then until a connection can be established.
    pub log_soft_start: bool,
}

impl NetLogConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: NetLogOpt) {
        if let Some(log_address) = opt.log_address {
            self.log_address = log_address;
        }

        if let Some(log_dial_timeout) = opt.log_dial_timeout {
            self.log_dial_timeout = log_dial_timeout;
        }

        if opt.log_soft_start {
            self.log_soft_start = opt.log_soft_start;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pandora_module_utils::FromYaml;
    use test_log::test;

    #[test]
    fn deserialization() {
        let conf = NetLogConf::from_yaml(
            r#"
                log_address: udp/127.0.0.1:5140
                log_dial_timeout: 2.5
                log_soft_start: true
            "#,
        )
        .unwrap();
        assert_eq!(
            conf,
            NetLogConf {
                log_address: "udp/127.0.0.1:5140".into(),
                log_dial_timeout: 2.5,
                log_soft_start: true,
            }
        );

        assert_eq!(NetLogConf::from_yaml("{}").unwrap(), NetLogConf::default());
    }

    #[test]
    fn command_line_precedence() {
        let mut conf = NetLogConf {
            log_address: "localhost:5140".into(),
            log_dial_timeout: 1.0,
            log_soft_start: false,
        };

        conf.merge_with_opt(NetLogOpt::default());
        assert_eq!(conf.log_address, "localhost:5140");
        assert_eq!(conf.log_dial_timeout, 1.0);

        conf.merge_with_opt(NetLogOpt::parse_from([
            "test",
            "--log-address",
            "unix//run/log.sock",
            "--log-dial-timeout",
            "0.5",
            "--log-soft-start",
        ]));
        assert_eq!(
            conf,
            NetLogConf {
                log_address: "unix//run/log.sock".into(),
                log_dial_timeout: 0.5,
                log_soft_start: true,
            }
        );
    }
}
