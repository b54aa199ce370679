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

//! Connection pooling for request/response clients
//!
//! [ConnectionPool] bounds the number of live connections to a server. Callers check a
//! connection out with [Pool::get()], talk to the server over it directly, then hand it back
//! with [Pool::put()] or throw it away with [Pool::remove()] if the exchange went wrong. When
//! every connection is checked out, `get()` blocks until one comes back.
//!
//! Pipelines and transactions need every command on the same connection. [PinnedPool] wraps a
//! pool and keeps returning one connection until it is closed.
//!
//! ```no_run
//! use redpool::{tcp_dialer, ConnectionPool, Pool, PoolOptions};
//! use std::io::{BufRead, Write};
//!
//! # fn main() -> redpool_error::Result<()> {
//! let dial = tcp_dialer("127.0.0.1:6379".parse().unwrap(), None);
//! let pool = ConnectionPool::new(dial, PoolOptions::new(10));
//!
//! let (conn, _is_new) = pool.get()?;
//! let mut reply = String::new();
//! let res = {
//!     let mut c = conn.lock();
//!     c.write_all(b"PING\r\n").and_then(|_| c.read_line(&mut reply))
//! };
//! match res {
//!     Ok(_) => pool.put(conn)?,
//!     Err(_) => pool.remove(conn)?,
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod conf;
mod connection;
mod pinned;
mod pool;
pub mod transport;

pub use connection::{Connection, PooledConnection};
pub use pinned::PinnedPool;
pub use pool::{ConnectionPool, Pool, PoolOptions};
pub use transport::{tcp_dialer, Transport};
#[cfg(unix)]
pub use transport::unix_dialer;
