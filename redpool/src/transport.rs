// Copyright 2024 Cloudflare, Inc.
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

//! Transport streams the pool can manage, and dial hooks to create them

use log::debug;
use redpool_error::{Error, ErrorType::*, Result};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

/// The abstraction of a byte stream to a server.
///
/// The timeouts set here apply to each individual read/write call, which is what the
/// [crate::Connection] relies on to enforce a fresh deadline per operation.
pub trait Transport: Read + Write + Send {
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()>;
    /// Close the stream. This is the default close behavior of the pool when no close hook is
    /// configured.
    fn close(&mut self) -> io::Result<()>;
}

// the peer may already be gone, which still counts as closed
fn shutdown_result(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl Transport for TcpStream {
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, dur)
    }

    fn close(&mut self) -> io::Result<()> {
        shutdown_result(self.shutdown(Shutdown::Both))
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, dur)
    }

    fn close(&mut self) -> io::Result<()> {
        shutdown_result(self.shutdown(Shutdown::Both))
    }
}

/// The hook the pool calls to establish a new transport.
pub type DialFn<S> = Box<dyn Fn() -> Result<S> + Send + Sync>;

/// The hook the pool calls to close a transport instead of [Transport::close].
pub type CloseFn<S> = Box<dyn Fn(&mut S) -> Result<()> + Send + Sync>;

fn wrap_os_connect_error(e: io::Error, context: String) -> Box<Error> {
    let etype = match e.kind() {
        ErrorKind::ConnectionRefused => ConnectRefused,
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ConnectTimedout,
        _ => ConnectError,
    };
    Error::because(etype, context, e).into_server()
}

/// A dial hook connecting to a TCP server at `addr`.
///
/// When `connect_timeout` is `None` the OS default connect timeout applies.
pub fn tcp_dialer(addr: SocketAddr, connect_timeout: Option<Duration>) -> DialFn<TcpStream> {
    Box::new(move || {
        let res = match connect_timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        let stream =
            res.map_err(|e| wrap_os_connect_error(e, format!("Fail to connect to {addr}")))?;
        // request/response protocols want small writes flushed right away
        stream
            .set_nodelay(true)
            .map_err(|e| wrap_os_connect_error(e, format!("Fail to set nodelay to {addr}")))?;
        debug!("connected to {addr}");
        Ok(stream)
    })
}

/// A dial hook connecting to the unix domain socket at `path`.
#[cfg(unix)]
pub fn unix_dialer(
    path: impl Into<std::path::PathBuf>,
) -> DialFn<std::os::unix::net::UnixStream> {
    let path = path.into();
    Box::new(move || {
        let stream = std::os::unix::net::UnixStream::connect(&path).map_err(|e| {
            wrap_os_connect_error(e, format!("Fail to connect to {}", path.display()))
        })?;
        debug!("connected to {}", path.display());
        Ok(stream)
    })
}
