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

//! Parsing and dialing of log destination addresses

use pandora_module_utils::pingora::{Error, ErrorType};
use std::fmt::{self, Display};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::connection::Connection;

/// Write timeout of stream sockets dialed without a timeout
pub(crate) const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Network type of a log destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// TCP over IPv4 or IPv6, `tcp/` prefix (default)
    Tcp,
    /// TCP over IPv4 only, `tcp4/` prefix
    Tcp4,
    /// TCP over IPv6 only, `tcp6/` prefix
    Tcp6,
    /// UDP over IPv4 or IPv6, `udp/` prefix
    Udp,
    /// UDP over IPv4 only, `udp4/` prefix
    Udp4,
    /// UDP over IPv6 only, `udp6/` prefix
    Udp6,
    /// Unix domain stream socket, `unix/` prefix
    Unix,
}

impl Network {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "tcp4" => Some(Self::Tcp4),
            "tcp6" => Some(Self::Tcp6),
            "udp" => Some(Self::Udp),
            "udp4" => Some(Self::Udp4),
            "udp6" => Some(Self::Udp6),
            "unix" => Some(Self::Unix),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Udp => "udp",
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
            Self::Unix => "unix",
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp4 | Self::Udp4 => addr.is_ipv4(),
            Self::Tcp6 | Self::Udp6 => addr.is_ipv6(),
            Self::Tcp | Self::Udp | Self::Unix => true,
        }
    }
}

/// A log destination address like `tcp/localhost:5140`, `udp/[::1]:514` or
/// `unix//run/log.sock`
///
/// The network prefix is optional and defaults to `tcp`. The port can be given as a range like
/// `5140-5149`, such addresses are parsed but cannot be dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    /// Network type
    pub network: Network,
    /// Host name or IP address, socket path for Unix sockets
    pub host: String,
    /// First port of the port range, `0` for Unix sockets
    pub start_port: u16,
    /// Last port of the port range, `0` for Unix sockets
    pub end_port: u16,
}

impl NetworkAddress {
    /// Number of ports covered by this address, `1` for Unix sockets.
    pub fn port_range_size(&self) -> u32 {
        if self.network == Network::Unix {
            1
        } else {
            u32::from(self.end_port) - u32::from(self.start_port) + 1
        }
    }

    fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<_> = (self.host.as_str(), self.start_port)
            .to_socket_addrs()?
            .filter(|addr| self.network.accepts(addr))
            .collect();
        if addrs.is_empty() {
            Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no suitable address found for {self}"),
            ))
        } else {
            Ok(addrs)
        }
    }

    fn dial_tcp(&self, timeout: Duration) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in self.resolve()? {
            let result = if timeout.is_zero() {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(&addr, timeout)
            };
            match result {
                Ok(stream) => return Ok(stream),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no address to dial")))
    }

    fn dial_udp(&self) -> io::Result<UdpSocket> {
        let mut last_error = None;
        for addr in self.resolve()? {
            let local: SocketAddr = if addr.is_ipv4() {
                ([0u8; 4], 0).into()
            } else {
                ([0u16; 8], 0).into()
            };
            let result = UdpSocket::bind(local).and_then(|socket| {
                socket.connect(addr)?;
                Ok(socket)
            });
            match result {
                Ok(socket) => return Ok(socket),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no address to dial")))
    }

    /// Opens a new connection to this address. A zero timeout means waiting for as long as the
    /// operating system allows. Stream sockets use the timeout for subsequent writes as well,
    /// falling back to [`DEFAULT_WRITE_TIMEOUT`] if it is zero.
    pub(crate) fn dial(&self, timeout: Duration) -> io::Result<Connection> {
        let write_timeout = Some(if timeout.is_zero() {
            DEFAULT_WRITE_TIMEOUT
        } else {
            timeout
        });
        match self.network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                let stream = self.dial_tcp(timeout)?;
                stream.set_write_timeout(write_timeout)?;
                Ok(Connection::Tcp(stream))
            }
            Network::Udp | Network::Udp4 | Network::Udp6 => Ok(Connection::Udp(self.dial_udp()?)),
            Network::Unix => {
                #[cfg(unix)]
                {
                    let stream = UnixStream::connect(&self.host)?;
                    stream.set_write_timeout(write_timeout)?;
                    Ok(Connection::Unix(stream))
                }
                #[cfg(not(unix))]
                {
                    Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "unix domain sockets are not supported on this platform",
                    ))
                }
            }
        }
    }
}

impl Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.network.name())?;
        if self.network == Network::Unix {
            return write!(f, "{}", self.host);
        }

        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if self.start_port == self.end_port {
            write!(f, ":{}", self.start_port)
        } else {
            write!(f, ":{}-{}", self.start_port, self.end_port)
        }
    }
}

fn parse_port(port: &str, address: &str) -> Result<u16, Box<Error>> {
    port.parse().map_err(|err| {
        Error::because(
            ErrorType::InternalError,
            format!("invalid port in network address '{address}'"),
            err,
        )
    })
}

impl TryFrom<&str> for NetworkAddress {
    type Error = Box<Error>;

    fn try_from(address: &str) -> Result<Self, Self::Error> {
        let (network, rest) = match address.split_once('/') {
            Some((network, rest)) => {
                let network = Network::from_name(network).ok_or_else(|| {
                    Error::explain(
                        ErrorType::InternalError,
                        format!("unsupported network type in network address '{address}'"),
                    )
                })?;
                (network, rest)
            }
            None => (Network::Tcp, address),
        };

        if network == Network::Unix {
            if rest.is_empty() {
                return Err(Error::explain(
                    ErrorType::InternalError,
                    format!("missing socket path in network address '{address}'"),
                ));
            }
            return Ok(Self {
                network,
                host: rest.to_owned(),
                start_port: 0,
                end_port: 0,
            });
        }

        let (host, ports) = rest.rsplit_once(':').ok_or_else(|| {
            Error::explain(
                ErrorType::InternalError,
                format!("missing port in network address '{address}'"),
            )
        })?;
        let host = host
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(Error::explain(
                ErrorType::InternalError,
                format!("missing host in network address '{address}'"),
            ));
        }

        let (start_port, end_port) = match ports.split_once('-') {
            Some((start, end)) => (parse_port(start, address)?, parse_port(end, address)?),
            None => {
                let port = parse_port(ports, address)?;
                (port, port)
            }
        };
        if end_port < start_port {
            return Err(Error::explain(
                ErrorType::InternalError,
                format!("end port before start port in network address '{address}'"),
            ));
        }

        Ok(Self {
            network,
            host: host.to_owned(),
            start_port,
            end_port,
        })
    }
}

/// Replaces `{env.NAME}` placeholders by the values of the respective environment variables.
///
/// Unknown placeholders and empty or missing variables are errors. An opening brace without a
/// closing one is kept verbatim.
pub fn expand_placeholders(input: &str) -> Result<String, Box<Error>> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('{') {
        let Some(length) = rest[start..].find('}') else {
            break;
        };
        result.push_str(&rest[..start]);

        let placeholder = &rest[start + 1..start + length];
        let name = placeholder.strip_prefix("env.").ok_or_else(|| {
            Error::explain(
                ErrorType::InternalError,
                format!("unrecognized placeholder {{{placeholder}}}"),
            )
        })?;
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => result.push_str(&value),
            _ => {
                return Err(Error::explain(
                    ErrorType::InternalError,
                    format!("environment variable {name} is empty or not set"),
                ))
            }
        }

        rest = &rest[start + length + 1..];
    }
    result.push_str(rest);
    Ok(result)
}
