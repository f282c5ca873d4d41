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

//! A minimal Redis server for tests, recording all commands it receives

use parking_lot::Mutex;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

type Command = Vec<Vec<u8>>;

#[derive(Debug, Default)]
struct State {
    commands: Mutex<Vec<Command>>,
    refuse: AtomicBool,
}

#[derive(Debug)]
pub(crate) struct FakeRedis {
    port: u16,
    state: Arc<State>,
}

impl FakeRedis {
    pub(crate) fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(State::default());

        let accept_state = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    break;
                };
                if accept_state.refuse.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }

                let state = accept_state.clone();
                thread::spawn(move || {
                    let _ = serve(stream, &state);
                });
            }
        });

        Self { port, state }
    }

    pub(crate) fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Makes the server drop all new connections immediately.
    pub(crate) fn refuse_connections(&self) {
        self.state.refuse.store(true, Ordering::SeqCst);
    }

    /// Returns all received commands with the given name.
    pub(crate) fn commands(&self, name: &str) -> Vec<Command> {
        self.state
            .commands
            .lock()
            .iter()
            .filter(|command| {
                command
                    .first()
                    .is_some_and(|first| first.eq_ignore_ascii_case(name.as_bytes()))
            })
            .cloned()
            .collect()
    }
}

fn read_line(reader: &mut impl BufRead) -> io::Result<String> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(line.trim_end().to_owned())
}

fn read_number(reader: &mut impl BufRead, prefix: char) -> io::Result<usize> {
    let line = read_line(reader)?;
    line.strip_prefix(prefix)
        .and_then(|number| number.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, line))
}

fn read_command(reader: &mut impl BufRead) -> io::Result<Command> {
    let count = read_number(reader, '*')?;
    let mut command = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_number(reader, '$')?;
        let mut arg = vec![0; len + 2];
        reader.read_exact(&mut arg)?;
        arg.truncate(len);
        command.push(arg);
    }
    Ok(command)
}

fn serve(stream: TcpStream, state: &State) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    loop {
        let command = read_command(&mut reader)?;
        let name = command
            .first()
            .map(|name| name.to_ascii_uppercase())
            .unwrap_or_default();
        state.commands.lock().push(command);

        let reply: &[u8] = match name.as_slice() {
            b"PING" => b"+PONG\r\n",
            b"LPUSH" => b":1\r\n",
            _ => b"+OK\r\n",
        };
        writer.write_all(reply)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn records_commands() {
        let server = FakeRedis::start();
        let mut stream = TcpStream::connect(server.address()).unwrap();
        stream
            .write_all(b"*1\r\n$4\r\nPING\r\n*3\r\n$5\r\nlpush\r\n$4\r\nlogs\r\n$2\r\n{}\r\n")
            .unwrap();

        let mut reader = BufReader::new(stream);
        assert_eq!(read_line(&mut reader).unwrap(), "+PONG");
        assert_eq!(read_line(&mut reader).unwrap(), ":1");

        assert_eq!(server.commands("PING"), vec![vec![b"PING".to_vec()]]);
        assert_eq!(
            server.commands("LPUSH"),
            vec![vec![b"lpush".to_vec(), b"logs".to_vec(), b"{}".to_vec()]]
        );
        assert!(server.commands("GET").is_empty());
    }
}
