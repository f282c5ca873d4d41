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

//! Provisioning of network log writers

use pandora_module_utils::pingora::{Error, ErrorType};
use std::fmt::{self, Display};
use std::io::{self, Write};
use std::time::Duration;

use crate::address::{expand_placeholders, NetworkAddress};
use crate::configuration::NetLogConf;
use crate::connection::RedialingConn;

/// A validated network log destination
///
/// This is created from [`NetLogConf`] and doesn't do any networking until [`NetLogWriter::open`]
/// is called.
#[derive(Debug, Clone, PartialEq)]
pub struct NetLogWriter {
    address: NetworkAddress,
    dial_timeout: Duration,
    soft_start: bool,
}

impl TryFrom<NetLogConf> for NetLogWriter {
    type Error = Box<Error>;

    fn try_from(conf: NetLogConf) -> Result<Self, Self::Error> {
        let address = expand_placeholders(&conf.log_address).map_err(|err| {
            Error::because(ErrorType::InternalError, "invalid host in address", err)
        })?;
        let address = NetworkAddress::try_from(address.as_str())?;
        if address.port_range_size() > 1 {
            return Err(Error::explain(
                ErrorType::InternalError,
                format!("multiple ports not supported: {address}"),
            ));
        }

        if !conf.log_dial_timeout.is_finite() || conf.log_dial_timeout < 0.0 {
            return Err(Error::explain(
                ErrorType::InternalError,
                "timeout cannot be less than 0",
            ));
        }

        Ok(Self {
            address,
            dial_timeout: Duration::from_secs_f64(conf.log_dial_timeout),
            soft_start: conf.log_soft_start,
        })
    }
}

impl NetLogWriter {
    /// Address log output is sent to
    pub fn address(&self) -> &NetworkAddress {
        &self.address
    }

    /// Connects to the log destination, using standard error as fallback stream.
    pub fn open(&self) -> io::Result<RedialingConn> {
        self.open_with_fallback(Box::new(io::stderr()))
    }

    /// Connects to the log destination. Output that cannot be delivered will go to the given
    /// fallback stream.
    ///
    /// Connection errors are only reported if soft start isn't enabled. Otherwise the error is
    /// written to the fallback stream, and the returned connection will keep trying to connect
    /// on subsequent writes.
    pub fn open_with_fallback(
        &self,
        fallback: Box<dyn Write + Send>,
    ) -> io::Result<RedialingConn> {
        match self.address.dial(self.dial_timeout) {
            Ok(conn) => Ok(RedialingConn::new(
                self.address.clone(),
                self.dial_timeout,
                Some(conn),
                fallback,
            )),
            Err(err) if self.soft_start => {
                let conn =
                    RedialingConn::new(self.address.clone(), self.dial_timeout, None, fallback);
                conn.report(&format!(
                    "[ERROR] net log writer failed to connect: {err} (will retry connection and print errors here in the meantime)"
                ));
                Ok(conn)
            }
            Err(err) => Err(io::Error::new(
                err.kind(),
                format!("failed to connect to {}: {err}", self.address),
            )),
        }
    }
}

impl Display for NetLogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::Arc;
    use test_log::test;

    #[derive(Debug, Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn conf(address: &str, soft_start: bool) -> NetLogConf {
        NetLogConf {
            log_address: address.to_owned(),
            log_dial_timeout: 1.0,
            log_soft_start: soft_start,
        }
    }

    fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn provisioning_errors() {
        assert!(NetLogWriter::try_from(conf("localhost:5140-5141", false)).is_err());
        assert!(NetLogWriter::try_from(conf("{env.NET_LOG_WRITER_UNSET}:5140", false)).is_err());
        assert!(NetLogWriter::try_from(conf("localhost", false)).is_err());

        let mut negative = conf("localhost:5140", false);
        negative.log_dial_timeout = -1.0;
        assert!(NetLogWriter::try_from(negative).is_err());

        let mut infinite = conf("localhost:5140", false);
        infinite.log_dial_timeout = f64::INFINITY;
        assert!(NetLogWriter::try_from(infinite).is_err());

        let writer = NetLogWriter::try_from(conf("udp4/127.0.0.1:5140", false)).unwrap();
        assert_eq!(writer.to_string(), "udp4/127.0.0.1:5140");
    }

    #[test]
    fn open_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let writer = NetLogWriter::try_from(conf(&format!("127.0.0.1:{port}"), false)).unwrap();

        let fallback = SharedBuf::default();
        let conn = writer
            .open_with_fallback(Box::new(fallback.clone()))
            .unwrap();
        assert!(conn.is_connected());
        let (mut server, _) = listener.accept().unwrap();

        (&conn).write_all(b"log line\n").unwrap();
        let mut buf = [0; 9];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"log line\n");
        assert_eq!(fallback.contents(), "");
    }

    #[test]
    fn open_refused() {
        let port = refused_port();
        let writer = NetLogWriter::try_from(conf(&format!("127.0.0.1:{port}"), false)).unwrap();
        assert!(writer
            .open_with_fallback(Box::new(SharedBuf::default()))
            .is_err());
    }

    #[test]
    fn open_soft_start() {
        let port = refused_port();
        let writer = NetLogWriter::try_from(conf(&format!("127.0.0.1:{port}"), true)).unwrap();

        let fallback = SharedBuf::default();
        let conn = writer
            .open_with_fallback(Box::new(fallback.clone()))
            .unwrap();
        assert!(!conn.is_connected());

        let contents = fallback.contents();
        assert!(contents.starts_with("[ERROR] net log writer failed to connect: "));
        assert!(contents
            .ends_with(" (will retry connection and print errors here in the meantime)\n"));

        (&conn).write_all(b"original bytes\n").unwrap();
        assert_eq!(
            fallback.contents().strip_prefix(contents.as_str()),
            Some("original bytes\n")
        );
    }
}
