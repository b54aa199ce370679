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

//! A pooled transport connection

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::transport::Transport;

const READ_BUF_SIZE: usize = 1024;

/// One transport connection managed by a pool.
///
/// Every read (and every refill of the read buffer) sets the read timeout of the transport
/// before touching it, and every write sets the write timeout, so each operation gets its own
/// deadline.
pub struct Connection<S> {
    reader: BufReader<S>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

// a zero timeout means no timeout
fn non_zero(t: Option<Duration>) -> Option<Duration> {
    t.filter(|d| !d.is_zero())
}

impl<S: Transport> Connection<S> {
    /// Create a new [Connection] around the given transport
    pub fn new(stream: S, read_timeout: Option<Duration>, write_timeout: Option<Duration>) -> Self {
        Connection {
            reader: BufReader::with_capacity(READ_BUF_SIZE, stream),
            read_timeout: non_zero(read_timeout),
            write_timeout: non_zero(write_timeout),
        }
    }

    fn arm_read(&self) -> io::Result<()> {
        match self.read_timeout {
            Some(t) => self.reader.get_ref().set_read_timeout(Some(t)),
            None => Ok(()),
        }
    }

    fn arm_write(&self) -> io::Result<()> {
        match self.write_timeout {
            Some(t) => self.reader.get_ref().set_write_timeout(Some(t)),
            None => Ok(()),
        }
    }

    pub(crate) fn close(&mut self) -> io::Result<()> {
        self.reader.get_mut().close()
    }
}

impl<S> Connection<S> {
    /// The underlying transport
    pub fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }

    /// The underlying transport. Reading from it directly skips the read buffer.
    pub fn get_mut(&mut self) -> &mut S {
        self.reader.get_mut()
    }
}

impl<S: Transport> Read for Connection<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.arm_read()?;
        self.reader.read(buf)
    }
}

impl<S: Transport> BufRead for Connection<S> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        // only a refill hits the transport
        if self.reader.buffer().is_empty() {
            self.arm_read()?;
        }
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

impl<S: Transport> Write for Connection<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.arm_write()?;
        self.reader.get_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.arm_write()?;
        self.reader.get_mut().flush()
    }
}

/// A handle to a [Connection] checked out of a pool.
///
/// Cloning the handle does not duplicate the connection: all clones refer to the same
/// connection and compare equal under [PooledConnection::same]. The lock only exists to hand out
/// `&mut` access through a shared handle. It is uncontended as long as a connection is used by
/// one caller at a time, which is what the pools guarantee.
pub struct PooledConnection<S>(Arc<Mutex<Connection<S>>>);

impl<S> PooledConnection<S> {
    pub(crate) fn new(conn: Connection<S>) -> Self {
        PooledConnection(Arc::new(Mutex::new(conn)))
    }

    /// Exclusive access to the connection for protocol I/O
    pub fn lock(&self) -> MutexGuard<'_, Connection<S>> {
        self.0.lock()
    }

    /// Whether both handles refer to the same connection
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<S> Clone for PooledConnection<S> {
    fn clone(&self) -> Self {
        PooledConnection(self.0.clone())
    }
}

impl<S> fmt::Debug for PooledConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the identity is what matters, the stream may not be Debug
        write!(f, "PooledConnection({:p})", Arc::as_ptr(&self.0))
    }
}
