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

//! Pin one connection of a pool for pipelines and transactions

use log::{debug, warn};
use parking_lot::RwLock;
use redpool_error::Result;

use crate::connection::PooledConnection;
use crate::pool::Pool;

/// A [Pool] that keeps handing out the same connection.
///
/// The first [Pool::get()] checks a connection out of the underlying pool, later calls return
/// that same connection until [Pool::close()] releases it back. [Pool::put()] and
/// [Pool::remove()] only accept the pinned connection: passing any other connection is a bug in
/// the caller and panics.
pub struct PinnedPool<'a, P: Pool + ?Sized> {
    pool: &'a P,
    conn: RwLock<Option<PooledConnection<P::Stream>>>,
    // whether the connection goes back to the idle list or gets discarded on close()
    reusable: bool,
}

impl<'a, P: Pool + ?Sized> PinnedPool<'a, P> {
    /// Create a new [PinnedPool] over `pool`. Nothing is checked out until the first `get()`.
    pub fn new(pool: &'a P, reusable: bool) -> Self {
        PinnedPool {
            pool,
            conn: RwLock::new(None),
            reusable,
        }
    }

    /// Create a new [PinnedPool] holding `conn`, which must have been checked out of `pool`.
    pub fn with_connection(pool: &'a P, conn: PooledConnection<P::Stream>, reusable: bool) -> Self {
        PinnedPool {
            pool,
            conn: RwLock::new(Some(conn)),
            reusable,
        }
    }

    pub fn reusable(&self) -> bool {
        self.reusable
    }

    fn assert_pinned(
        held: Option<&PooledConnection<P::Stream>>,
        conn: &PooledConnection<P::Stream>,
    ) {
        match held {
            Some(h) if h.same(conn) => {}
            _ => panic!("{conn:?} is not the pinned connection {held:?}"),
        }
    }
}

impl<P: Pool + ?Sized> Pool for PinnedPool<'_, P> {
    type Stream = P::Stream;

    fn get(&self) -> Result<(PooledConnection<P::Stream>, bool)> {
        if let Some(conn) = self.conn.read().as_ref() {
            return Ok((conn.clone(), false));
        } // read lock released here

        let mut held = self.conn.write();
        // check again since another caller might have already checked one out
        if let Some(conn) = held.as_ref() {
            return Ok((conn.clone(), false));
        }
        let (conn, is_new) = self.pool.get()?;
        *held = Some(conn.clone());
        Ok((conn, is_new))
    }

    fn put(&self, conn: PooledConnection<P::Stream>) -> Result<()> {
        // the connection stays pinned until close()
        Self::assert_pinned(self.conn.read().as_ref(), &conn);
        Ok(())
    }

    fn remove(&self, conn: PooledConnection<P::Stream>) -> Result<()> {
        let mut held = self.conn.write();
        Self::assert_pinned(held.as_ref(), &conn);
        *held = None;
        Ok(())
    }

    fn len(&self) -> usize {
        self.conn.read().is_some() as usize
    }

    fn close(&self) -> Result<()> {
        let conn = self.conn.write().take();
        match conn {
            Some(conn) if self.reusable => self.pool.put(conn),
            Some(conn) => {
                debug!("discard pinned connection {conn:?}");
                self.pool.remove(conn)
            }
            None => Ok(()),
        }
    }
}

impl<P: Pool + ?Sized> Drop for PinnedPool<'_, P> {
    fn drop(&mut self) {
        // the protocol state of a connection that was never closed is unknown, never reuse it
        if let Some(conn) = self.conn.get_mut().take() {
            warn!("{conn:?} still pinned on drop, discard it");
            if let Err(e) = self.pool.remove(conn) {
                warn!("failed to discard pinned connection: {e}");
            }
        }
    }
}
