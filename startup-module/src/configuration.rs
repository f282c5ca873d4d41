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

use clap::Parser;
use pandora_module_utils::pingora::{
    http_proxy_service, Error, ErrorType, ProxyHttp, Server, ServerConf, ServerOpt,
    TcpSocketOptions,
};
use pandora_module_utils::{DeserializeMap, OneOrMany};
use serde::de::value::MapAccessDeserializer;
use serde::de::{Deserialize, Deserializer, Error as DeError, MapAccess, Visitor};
use std::net::ToSocketAddrs;

/// Run a web server
#[derive(Debug, Default, Parser)]
pub struct StartupOpt {
    /// Address and port to listen on, e.g. "127.0.0.1:8080". This command line flag can be
    /// specified multiple times.
    #[clap(short, long)]
    pub listen: Option<Vec<ListenAddr>>,
    /// Use this flag to make the server run in the background.
    #[clap(short, long)]
    pub daemon: bool,
    /// Test the configuration and exit. This is useful to validate the configuration before
    /// restarting the process.
    #[clap(short, long)]
    pub test: bool,
    /// The path to the configuration file. This command line flag can be specified multiple
    /// times, wildcards are supported.
    #[clap(short, long)]
    pub conf: Option<Vec<String>>,
}

/// Address for the server to listen on
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    /// IP address and port combination, e.g. `127.0.0.1:8080` or `[::1]:8080`
    pub addr: String,

    /// Determines whether listening on IPv6 [::] address should accept IPv4 connections as well.
    ///
    /// If set, the IPV6_V6ONLY flag will be set accordingly for the socket. Otherwise the system
    /// default will be used.
    pub ipv6_only: Option<bool>,
}

impl From<&str> for ListenAddr {
    fn from(value: &str) -> Self {
        Self {
            addr: value.to_owned(),
            ipv6_only: None,
        }
    }
}

/// Structured form of a listening address in the configuration file
#[derive(Debug, Default, DeserializeMap)]
struct ListenAddrFields {
    addr: String,
    ipv6_only: Option<bool>,
}

impl<'de> Deserialize<'de> for ListenAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AddrVisitor;

        impl<'de> Visitor<'de> for AddrVisitor {
            type Value = ListenAddr;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("address string or ListenAddr structure")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: DeError,
            {
                Ok(v.into())
            }

            fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let fields = ListenAddrFields::deserialize(MapAccessDeserializer::new(map))?;
                if fields.addr.is_empty() {
                    return Err(A::Error::missing_field("addr"));
                }
                Ok(ListenAddr {
                    addr: fields.addr,
                    ipv6_only: fields.ipv6_only,
                })
            }
        }

        deserializer.deserialize_any(AddrVisitor)
    }
}

/// Configuration settings of the startup module
#[derive(Debug, Default, DeserializeMap)]
pub struct StartupConf {
    /// List of address/port combinations to listen on, e.g. "127.0.0.1:8080".
    pub listen: OneOrMany<ListenAddr>,
    /// Pingora’s default server configuration options
    #[pandora(flatten)]
    pub server: ServerConf,
}

impl StartupConf {
    fn listen_addrs(&self, opt: &mut StartupOpt) -> Result<Vec<ListenAddr>, Box<Error>> {
        let mut listen = opt.listen.take().unwrap_or_else(|| self.listen.to_vec());
        if listen.is_empty() {
            // Make certain we have a listening address
            listen.push("127.0.0.1:8080".into());
            listen.push("[::1]:8080".into());
        }

        for addr in &listen {
            addr.addr.to_socket_addrs().map_err(|err| {
                Error::because(
                    ErrorType::BindError,
                    format!("invalid listen address {}", addr.addr),
                    err,
                )
            })?;
        }
        Ok(listen)
    }

    /// Sets up a server with the given configuration and command line options
    pub fn into_server<SV>(self, app: SV, opt: Option<StartupOpt>) -> Result<Server, Box<Error>>
    where
        SV: ProxyHttp + Send + Sync + 'static,
        <SV as ProxyHttp>::CTX: Send + Sync,
    {
        let mut opt = opt.unwrap_or_default();
        let listen = self.listen_addrs(&mut opt)?;

        let mut server = Server::new_with_opt_and_conf(
            ServerOpt {
                daemon: opt.daemon,
                test: opt.test,
                upgrade: false,
                nocapture: false,
                conf: None,
            },
            self.server,
        );
        server.bootstrap();

        let mut proxy = http_proxy_service(&server.configuration, app);
        for addr in listen {
            if let Some(ipv6_only) = addr.ipv6_only {
                let mut options = TcpSocketOptions::default();
                options.ipv6_only = Some(ipv6_only);
                proxy.add_tcp_with_settings(&addr.addr, options);
            } else {
                proxy.add_tcp(&addr.addr);
            }
        }
        server.add_service(proxy);

        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pandora_module_utils::FromYaml;
    use test_log::test;

    #[test]
    fn listen_formats() {
        let conf = StartupConf::from_yaml(
            r#"
                listen:
                - 127.0.0.1:8080
                - addr: "[::]:8443"
                  ipv6_only: true
                threads: 2
            "#,
        )
        .unwrap();
        assert_eq!(
            *conf.listen,
            vec![
                ListenAddr::from("127.0.0.1:8080"),
                ListenAddr {
                    addr: "[::]:8443".to_owned(),
                    ipv6_only: Some(true),
                },
            ]
        );
        assert_eq!(conf.server.threads, 2);

        let conf = StartupConf::from_yaml("listen: 127.0.0.1:80").unwrap();
        assert_eq!(*conf.listen, vec![ListenAddr::from("127.0.0.1:80")]);

        assert!(StartupConf::from_yaml("listen: {port: 80}").is_err());
    }

    #[test]
    fn listen_merging() {
        let conf = StartupConf::from_yaml("listen: 127.0.0.1:80")
            .unwrap()
            .merge_from_yaml("listen: 127.0.0.1:81")
            .unwrap();
        assert_eq!(
            *conf.listen,
            vec![
                ListenAddr::from("127.0.0.1:80"),
                ListenAddr::from("127.0.0.1:81")
            ]
        );
    }

    #[test]
    fn listen_addrs() {
        let conf = StartupConf::default();
        let addrs = conf.listen_addrs(&mut StartupOpt::default()).unwrap();
        assert_eq!(
            addrs,
            vec![
                ListenAddr::from("127.0.0.1:8080"),
                ListenAddr::from("[::1]:8080")
            ]
        );

        let conf = StartupConf::from_yaml("listen: 127.0.0.1:80").unwrap();
        let mut opt = StartupOpt::parse_from(["server", "--listen", "127.0.0.1:8000"]);
        let addrs = conf.listen_addrs(&mut opt).unwrap();
        assert_eq!(addrs, vec![ListenAddr::from("127.0.0.1:8000")]);

        let conf = StartupConf::from_yaml("listen: no port here").unwrap();
        assert!(conf.listen_addrs(&mut StartupOpt::default()).is_err());
    }
}
