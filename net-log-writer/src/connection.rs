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

//! The self-healing connection behind a network log writer

use parking_lot::{Mutex, RwLock};
use std::fmt::{self, Debug};
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::address::NetworkAddress;

/// Minimal time between two redial attempts
pub(crate) const REDIAL_INTERVAL: Duration = Duration::from_secs(10);

/// A live socket connection
#[derive(Debug)]
pub(crate) enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Connection {
    /// Writes the entire buffer. A datagram socket sends the buffer as a single datagram.
    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => {
                let mut stream: &TcpStream = stream;
                stream.write_all(buf)
            }
            Self::Udp(socket) => {
                let sent = socket.send(buf)?;
                if sent == buf.len() {
                    Ok(())
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "datagram was truncated",
                    ))
                }
            }
            #[cfg(unix)]
            Self::Unix(stream) => {
                let mut stream: &UnixStream = stream;
                stream.write_all(buf)
            }
        }
    }

    /// Closes the connection, errors are irrelevant at this point.
    fn close(self) {
        match self {
            Self::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Self::Udp(_) => {}
            #[cfg(unix)]
            Self::Unix(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

/// A network connection that repairs itself
///
/// Writes go to the current connection. If that fails, a new connection is dialed, at most once
/// every 10 seconds. Whatever cannot be delivered goes to the fallback stream instead, so
/// no output is lost. Writing never reports an error to the caller.
///
/// The connection is behind a read/write lock: concurrent writes to a healthy connection only
/// take the shared lock, repairs take the exclusive lock. The time of the last redial attempt is
/// only touched while the exclusive lock is held.
///
/// The shared lock is held for the duration of a write. A write stalled on an unresponsive peer
/// therefore delays repairs and, once a repair is waiting, all other writers. Stream sockets
/// always have a write timeout which bounds this delay, see [`NetworkAddress`].
pub struct RedialingConn {
    address: NetworkAddress,
    timeout: Duration,
    conn: RwLock<Option<Connection>>,
    last_redial: Mutex<Option<Instant>>,
    pub(crate) redial_interval: Duration,
    redials: AtomicUsize,
    closes: AtomicUsize,
    fallback: Mutex<Box<dyn Write + Send>>,
}

impl Debug for RedialingConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedialingConn")
            .field("address", &self.address)
            .field("timeout", &self.timeout)
            .field("conn", &*self.conn.read())
            .field("redials", &self.redials)
            .field("closes", &self.closes)
            .finish()
    }
}

impl RedialingConn {
    pub(crate) fn new(
        address: NetworkAddress,
        timeout: Duration,
        conn: Option<Connection>,
        fallback: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            address,
            timeout,
            conn: RwLock::new(conn),
            last_redial: Mutex::new(None),
            redial_interval: REDIAL_INTERVAL,
            redials: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fallback: Mutex::new(fallback),
        }
    }

    /// Address this connection dials
    pub fn address(&self) -> &NetworkAddress {
        &self.address
    }

    /// Checks whether a live connection is currently stored. A stored connection isn't
    /// necessarily healthy, a broken connection is only detected on the next write.
    pub fn is_connected(&self) -> bool {
        self.conn.read().is_some()
    }

    /// Number of redial attempts made so far, successful or not
    pub fn redial_attempts(&self) -> usize {
        self.redials.load(Ordering::Relaxed)
    }

    /// Number of connections closed because they were replaced or failed right after dialing
    pub fn closed_connections(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }

    /// Writes a line to the fallback stream directly.
    pub(crate) fn report(&self, message: &str) {
        let mut fallback = self.fallback.lock();
        let _ = writeln!(fallback, "{message}");
        let _ = fallback.flush();
    }

    /// Sends the buffer to the fallback stream, ignoring errors of the fallback stream.
    fn divert(&self, buf: &[u8]) -> io::Result<usize> {
        let mut fallback = self.fallback.lock();
        let _ = fallback.write_all(buf);
        let _ = fallback.flush();
        Ok(buf.len())
    }

    fn close(&self, conn: Connection) {
        conn.close();
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    fn write_buf(&self, buf: &[u8]) -> io::Result<usize> {
        if let Some(conn) = self.conn.read().as_ref() {
            if conn.write_all(buf).is_ok() {
                return Ok(buf.len());
            }
        }

        let mut conn = self.conn.write();

        // Another writer might have repaired the connection while we were waiting for the lock
        if let Some(current) = conn.as_ref() {
            if current.write_all(buf).is_ok() {
                return Ok(buf.len());
            }
        }

        {
            let mut last_redial = self.last_redial.lock();
            if last_redial.is_some_and(|time| time.elapsed() < self.redial_interval) {
                drop(last_redial);
                return self.divert(buf);
            }
            *last_redial = Some(Instant::now());
        }

        self.redials.fetch_add(1, Ordering::Relaxed);
        let fresh = match self.address.dial(self.timeout) {
            Ok(fresh) => fresh,
            Err(_) => return self.divert(buf),
        };

        if fresh.write_all(buf).is_err() {
            self.close(fresh);
            return self.divert(buf);
        }

        if let Some(old) = conn.replace(fresh) {
            self.close(old);
        }
        Ok(buf.len())
    }

    fn flush_fallback(&self) {
        let _ = self.fallback.lock().flush();
    }
}

impl Write for &RedialingConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.write_buf(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_fallback();
        Ok(())
    }
}

impl Write for RedialingConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self).flush()
    }
}

impl Drop for RedialingConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().take() {
            conn.close();
        }
    }
}
