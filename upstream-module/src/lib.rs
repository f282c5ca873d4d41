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

//! # Upstream Module for Pandora Web Server
//!
//! This module forwards requests to an upstream server, turning Pandora Web Server into a
//! reverse proxy. Only one configuration option is provided: `upstream` (`--upstream` as command
//! line option). The value should be a URL like `http://127.0.0.1:8081` or `https://example.com`.
//!
//! Supported URL schemes are `http://` and `https://`. Other than the scheme, only host name and
//! port are considered. Other parts of the URL are ignored if present.
//!
//! The host name is resolved once when the handler is created. During `request_filter` the
//! request’s `Host` header is set to the upstream host, `upstream_peer` then produces the peer.
//! Without an `upstream` setting the handler leaves all requests to other handlers.
//!
//! ```rust
//! use pandora_module_utils::{merge_conf, merge_opt, RequestFilter};
//! use startup_module::{DefaultApp, StartupConf, StartupOpt};
//! use upstream_module::{UpstreamHandler, UpstreamOpt};
//! use clap::Parser;
//!
//! #[merge_opt]
//! struct Opt {
//!     startup: StartupOpt,
//!     upstream: UpstreamOpt,
//! }
//!
//! #[merge_conf]
//! struct Conf {
//!     startup: StartupConf,
//!     upstream: <UpstreamHandler as RequestFilter>::Conf,
//! }
//!
//! let opt = Opt::parse_from(["server", "--upstream", "http://127.0.0.1:8081"]);
//! let mut conf = Conf::default();
//! conf.upstream.merge_with_opt(opt.upstream);
//!
//! let app = DefaultApp::<UpstreamHandler>::from_conf(conf.upstream).unwrap();
//! let server = conf.startup.into_server(app, Some(opt.startup)).unwrap();
//!
//! // Do something with the server here, e.g. call server.run_forever()
//! ```

use async_trait::async_trait;
use clap::Parser;
use http::header;
use http::uri::{Scheme, Uri};
use log::error;
use pandora_module_utils::pingora::{Error, ErrorType, HttpPeer, SessionWrapper};
use pandora_module_utils::{DeserializeMap, RequestFilter, RequestFilterResult};
use serde::de::{Deserialize, Deserializer, Error as _};
use std::net::{SocketAddr, ToSocketAddrs};

/// Command line options of the upstream module
#[derive(Debug, Default, Parser)]
pub struct UpstreamOpt {
    /// http:// or https:// URL identifying the server that requests should be forwarded for.
    /// Path and query parts of the URL have no effect.
    #[clap(long)]
    pub upstream: Option<Uri>,
}

fn deserialize_uri<'de, D>(d: D) -> Result<Option<Uri>, D::Error>
where
    D: Deserializer<'de>,
{
    let uri = String::deserialize(d)?;
    let uri = uri
        .parse()
        .map_err(|err| D::Error::custom(format!("URL {uri} could not be parsed: {err}")))?;
    Ok(Some(uri))
}

/// Configuration settings of the upstream module
#[derive(Debug, Default, DeserializeMap)]
pub struct UpstreamConf {
    /// http:// or https:// URL identifying the server that requests should be forwarded for.
    /// Path and query parts of the URL have no effect.
    #[pandora(deserialize_with = "deserialize_uri")]
    pub upstream: Option<Uri>,
}

impl UpstreamConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: UpstreamOpt) {
        if opt.upstream.is_some() {
            self.upstream = opt.upstream;
        }
    }
}

/// Resolved upstream server
#[derive(Debug, Clone)]
struct Upstream {
    host_port: String,
    addr: SocketAddr,
    tls: bool,
    sni: String,
}

impl TryFrom<&Uri> for Upstream {
    type Error = Box<Error>;

    fn try_from(upstream: &Uri) -> Result<Self, Self::Error> {
        let tls = match upstream.scheme() {
            Some(scheme) if scheme == &Scheme::HTTP => false,
            Some(scheme) if scheme == &Scheme::HTTPS => true,
            Some(_) => {
                error!("provided upstream URL is neither HTTP nor HTTPS: {upstream}");
                return Err(Error::new(ErrorType::InternalError));
            }
            None => {
                error!("provided upstream URL has no scheme: {upstream}");
                return Err(Error::new(ErrorType::InternalError));
            }
        };

        let host = upstream.host().ok_or_else(|| {
            error!("provided upstream URL has no host name: {upstream}");
            Error::new(ErrorType::InternalError)
        })?;

        let port = upstream.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|err| {
                Error::because(
                    ErrorType::InternalError,
                    format!("failed resolving upstream host name {host}"),
                    err,
                )
            })?
            .next()
            .ok_or_else(|| {
                Error::explain(
                    ErrorType::InternalError,
                    format!("DNS lookup of upstream host name {host} didn't produce any results"),
                )
            })?;

        let host_port = match upstream.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        Ok(Self {
            host_port,
            addr,
            tls,
            sni: host.to_owned(),
        })
    }
}

/// Handler forwarding requests to the configured upstream server
#[derive(Debug)]
pub struct UpstreamHandler {
    upstream: Option<Upstream>,
}

impl UpstreamHandler {
    /// Address the upstream host name resolved to if an upstream is configured
    pub fn upstream_addr(&self) -> Option<SocketAddr> {
        self.upstream.as_ref().map(|upstream| upstream.addr)
    }
}

impl TryFrom<UpstreamConf> for UpstreamHandler {
    type Error = Box<Error>;

    fn try_from(conf: UpstreamConf) -> Result<Self, Self::Error> {
        let upstream = conf.upstream.as_ref().map(Upstream::try_from).transpose()?;
        Ok(Self { upstream })
    }
}

#[async_trait]
impl RequestFilter for UpstreamHandler {
    type Conf = UpstreamConf;
    type CTX = bool;

    fn new_ctx() -> Self::CTX {
        false
    }

    async fn request_filter(
        &self,
        session: &mut impl SessionWrapper,
        ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>> {
        let Some(upstream) = &self.upstream else {
            return Ok(RequestFilterResult::Unhandled);
        };

        session
            .req_header_mut()
            .insert_header(header::HOST, &upstream.host_port)?;
        *ctx = true;
        Ok(RequestFilterResult::Handled)
    }

    async fn upstream_peer(
        &self,
        _session: &mut impl SessionWrapper,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Box<HttpPeer>>, Box<Error>> {
        Ok(self
            .upstream
            .as_ref()
            .filter(|_| *ctx)
            .map(|upstream| {
                Box::new(HttpPeer::new(
                    upstream.addr,
                    upstream.tls,
                    upstream.sni.clone(),
                ))
            }))
    }
}
