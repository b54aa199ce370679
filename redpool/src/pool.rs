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

//! The bounded connection pool

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use redpool_error::{Error, ErrorType::*, OrErr, Result};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::conf::PoolConf;
use crate::connection::{Connection, PooledConnection};
use crate::transport::{CloseFn, DialFn, Transport};

/// The interface shared by [ConnectionPool] and [crate::PinnedPool].
pub trait Pool {
    type Stream: Transport;

    /// Check out a connection. The returned `bool` is `true` when the connection was just dialed
    /// and `false` when it is reused.
    fn get(&self) -> Result<(PooledConnection<Self::Stream>, bool)>;

    /// Return a healthy connection for reuse.
    fn put(&self, conn: PooledConnection<Self::Stream>) -> Result<()>;

    /// Discard a connection, e.g. after a protocol error left it in an unknown state.
    fn remove(&self, conn: PooledConnection<Self::Stream>) -> Result<()>;

    /// The number of idle connections
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close(&self) -> Result<()>;
}

/// The options to configure a [ConnectionPool]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolOptions {
    /// The upper bound of live (idle and checked out) connections
    pub max_connections: usize,
    /// Applied before every read. `None` or zero disables it.
    pub read_timeout: Option<Duration>,
    /// Applied before every write. `None` or zero disables it.
    pub write_timeout: Option<Duration>,
    /// Idle connections older than this are dropped on the next [ConnectionPool::get()].
    pub idle_timeout: Option<Duration>,
}

impl PoolOptions {
    /// Create a new [PoolOptions] with the given size limit and no timeouts
    pub fn new(max_connections: usize) -> Self {
        PoolOptions {
            max_connections,
            read_timeout: None,
            write_timeout: None,
            idle_timeout: None,
        }
    }

    /// Derive the [PoolOptions] from a [PoolConf]
    pub fn from_conf(conf: &PoolConf) -> Self {
        fn ms(v: Option<u64>) -> Option<Duration> {
            v.filter(|v| *v > 0).map(Duration::from_millis)
        }
        PoolOptions {
            max_connections: conf.max_connections,
            read_timeout: ms(conf.read_timeout_ms),
            write_timeout: ms(conf.write_timeout_ms),
            idle_timeout: conf
                .idle_timeout_seconds
                .filter(|v| *v > 0)
                .map(Duration::from_secs),
        }
    }
}

struct IdleConn<S> {
    conn: PooledConnection<S>,
    released_at: Instant,
}

struct PoolState<S> {
    // front is the most recently released, so released_at only decreases towards the back
    idle: VecDeque<IdleConn<S>>,
    // idle + checked out
    live: usize,
    closed: bool,
}

/// Connection pool
///
/// [ConnectionPool] bounds the number of live connections. When all of them are checked out,
/// [ConnectionPool::get()] blocks until one is released via [Pool::put()] or [Pool::remove()].
///
/// New connections are dialed while holding the pool lock, so concurrent callers never dial
/// past the limit.
pub struct ConnectionPool<S> {
    dial: DialFn<S>,
    close_hook: Option<CloseFn<S>>,
    options: PoolOptions,
    state: Mutex<PoolState<S>>,
    // signaled once per released slot
    available: Condvar,
}

impl<S: Transport> ConnectionPool<S> {
    /// Create a new [ConnectionPool] that creates connections with `dial`.
    ///
    /// # Panics
    /// When `options.max_connections` is zero.
    pub fn new(dial: DialFn<S>, options: PoolOptions) -> Self {
        assert!(
            options.max_connections > 0,
            "max_connections must be positive"
        );
        ConnectionPool {
            dial,
            close_hook: None,
            options,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                live: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Close connections with `close_hook` instead of [Transport::close].
    pub fn with_close_hook(mut self, close_hook: CloseFn<S>) -> Self {
        self.close_hook = Some(close_hook);
        self
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// The number of live connections, both idle and checked out
    pub fn size(&self) -> usize {
        self.state.lock().live
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn close_conn(&self, conn: &PooledConnection<S>) -> Result<()> {
        let mut conn = conn.lock();
        match &self.close_hook {
            Some(hook) => hook(conn.get_mut()),
            None => conn
                .close()
                .or_err(CloseError, "failed to close connection"),
        }
    }

    // close the idle connections released longer than `timeout` ago and free their slots,
    // returns how many were evicted
    fn evict_idle(&self, state: &mut PoolState<S>, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        while state
            .idle
            .back()
            .is_some_and(|c| now.saturating_duration_since(c.released_at) > timeout)
        {
            if let Some(expired) = state.idle.pop_back() {
                // the slot is freed even if close failed
                if let Err(e) = self.close_conn(&expired.conn) {
                    warn!("failed to close evicted idle connection: {e}");
                }
                evicted += 1;
            }
        }
        if evicted == 0 {
            return 0;
        }
        debug!("evicted {evicted} idle connections");
        state.live = state.live.saturating_sub(evicted);
        // this caller takes at most one slot, the rest may unblock others
        for _ in 1..evicted {
            self.available.notify_one();
        }
        evicted
    }
}

impl<S: Transport> Pool for ConnectionPool<S> {
    type Stream = S;

    fn get(&self) -> Result<(PooledConnection<S>, bool)> {
        let mut state = self.state.lock();
        while state.idle.is_empty()
            && state.live >= self.options.max_connections
            && !state.closed
        {
            self.available.wait(&mut state);
        }

        if state.closed {
            return Err(Error::explain(PoolClosed, "get() from a closed pool").into_local());
        }

        // expired connections are closed before a replacement is dialed, so the number of open
        // transports never exceeds max_connections
        let evicted = match self.options.idle_timeout.filter(|t| !t.is_zero()) {
            Some(timeout) => self.evict_idle(&mut state, timeout),
            None => 0,
        };

        if let Some(idle) = state.idle.pop_front() {
            return Ok((idle.conn, false));
        }

        // dial failure leaves the state untouched
        let stream = match (self.dial)() {
            Ok(s) => s,
            Err(e) => {
                // the slot freed by eviction is not taken after all
                if evicted > 0 {
                    self.available.notify_one();
                }
                return Err(e);
            }
        };
        state.live += 1;
        debug!(
            "dialed new connection, {}/{} live",
            state.live, self.options.max_connections
        );
        let conn = Connection::new(
            stream,
            self.options.read_timeout,
            self.options.write_timeout,
        );
        Ok((PooledConnection::new(conn), true))
        // state lock released here
    }

    fn put(&self, conn: PooledConnection<S>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            debug!("connection released to a closed pool, close it");
            return self.close_conn(&conn);
        }
        // the connection itself is not locked here, a caller may still hold a stray clone of it
        state.idle.push_front(IdleConn {
            conn,
            released_at: Instant::now(),
        });
        self.available.notify_one();
        Ok(())
    }

    fn remove(&self, conn: PooledConnection<S>) -> Result<()> {
        // close before locking so a slow close does not stall the pool
        let res = self.close_conn(&conn);
        let mut state = self.state.lock();
        // the slot is freed even if close failed
        state.live = state.live.saturating_sub(1);
        self.available.notify_one();
        res
    }

    fn len(&self) -> usize {
        self.state.lock().idle.len()
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            // blocked get() calls observe the closed flag and fail
            self.available.notify_all();
        }
        while let Some(idle) = state.idle.pop_front() {
            state.live = state.live.saturating_sub(1);
            // the remaining idle connections are left as is on failure
            self.close_conn(&idle.conn)?;
        }
        state.live = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockStream;
    use redpool_error::ErrorType;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    struct Dialer {
        count: AtomicUsize,
        fail: AtomicBool,
        dialed: Mutex<Vec<MockStream>>,
    }

    impl Dialer {
        fn stream(&self, id: usize) -> MockStream {
            self.dialed.lock()[id - 1].clone()
        }
    }

    fn mock_pool(options: PoolOptions) -> (Arc<ConnectionPool<MockStream>>, Arc<Dialer>) {
        init_log();
        let dialer = Arc::new(Dialer {
            count: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            dialed: Mutex::new(vec![]),
        });
        let d = dialer.clone();
        let dial: DialFn<MockStream> = Box::new(move || {
            if d.fail.load(Ordering::SeqCst) {
                return Error::e_explain(ConnectRefused, "mock refused");
            }
            let id = d.count.fetch_add(1, Ordering::SeqCst) + 1;
            let stream = MockStream::new(id);
            d.dialed.lock().push(stream.clone());
            Ok(stream)
        });
        (Arc::new(ConnectionPool::new(dial, options)), dialer)
    }

    fn id(conn: &PooledConnection<MockStream>) -> usize {
        conn.lock().get_ref().id()
    }

    // spawn a get() and return the channel it reports to
    fn spawn_get(
        pool: &Arc<ConnectionPool<MockStream>>,
    ) -> mpsc::Receiver<Result<(PooledConnection<MockStream>, bool)>> {
        let (tx, rx) = mpsc::channel();
        let pool = pool.clone();
        thread::spawn(move || {
            let _ = tx.send(pool.get());
        });
        rx
    }

    const BLOCKED: Duration = Duration::from_millis(100);
    const PATIENCE: Duration = Duration::from_secs(5);

    #[test]
    fn test_reuse() {
        let (pool, _) = mock_pool(PoolOptions::new(2));
        let (a, is_new) = pool.get().unwrap();
        assert!(is_new);
        pool.put(a.clone()).unwrap();
        assert_eq!(pool.len(), 1);

        let (a2, is_new) = pool.get().unwrap();
        assert!(!is_new);
        assert!(a.same(&a2));
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_lifo_order() {
        let (pool, _) = mock_pool(PoolOptions::new(3));
        let (a, _) = pool.get().unwrap();
        let (b, _) = pool.get().unwrap();
        pool.put(a.clone()).unwrap();
        pool.put(b.clone()).unwrap();
        // the most recently released comes first
        let (c, _) = pool.get().unwrap();
        assert!(c.same(&b));
    }

    #[test]
    fn test_blocked_get_scenario() {
        let (pool, _) = mock_pool(PoolOptions::new(2));
        let (a, a_new) = pool.get().unwrap();
        let (b, b_new) = pool.get().unwrap();
        assert!(a_new && b_new);
        pool.put(a.clone()).unwrap();
        let (a2, a2_new) = pool.get().unwrap();
        assert!(a.same(&a2));
        assert!(!a2_new);

        let rx = spawn_get(&pool);
        assert!(rx.recv_timeout(BLOCKED).is_err());
        assert_eq!(pool.size(), 2);

        pool.put(b.clone()).unwrap();
        let (b2, b2_new) = rx.recv_timeout(PATIENCE).unwrap().unwrap();
        assert!(b.same(&b2));
        assert!(!b2_new);
    }

    #[test]
    fn test_saturation() {
        const N: usize = 3;
        let (pool, dialer) = mock_pool(PoolOptions::new(N));
        let handles: Vec<_> = (0..N)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || pool.get().unwrap())
            })
            .collect();
        let conns: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(conns.iter().all(|(_, is_new)| *is_new));
        assert_eq!(pool.size(), N);
        assert_eq!(dialer.count.load(Ordering::SeqCst), N);

        let first = spawn_get(&pool);
        let second = spawn_get(&pool);
        assert!(first.recv_timeout(BLOCKED).is_err());
        assert!(second.recv_timeout(BLOCKED).is_err());

        // one released slot lets exactly one waiter through
        pool.remove(conns[0].0.clone()).unwrap();
        let (winner, other) = loop {
            if let Ok(res) = first.try_recv() {
                break (res, second);
            }
            if let Ok(res) = second.try_recv() {
                break (res, first);
            }
            thread::sleep(Duration::from_millis(5));
        };
        let (_, is_new) = winner.unwrap();
        assert!(is_new);
        assert!(other.recv_timeout(BLOCKED).is_err());
        assert_eq!(pool.size(), N);

        pool.put(conns[1].0.clone()).unwrap();
        let (conn, is_new) = other.recv_timeout(PATIENCE).unwrap().unwrap();
        assert!(conn.same(&conns[1].0));
        assert!(!is_new);
    }

    #[test]
    fn test_dial_failure_leaves_state() {
        let (pool, dialer) = mock_pool(PoolOptions::new(1));
        dialer.fail.store(true, Ordering::SeqCst);
        let err = pool.get().unwrap_err();
        assert_eq!(err.etype(), &ConnectRefused);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.len(), 0);

        dialer.fail.store(false, Ordering::SeqCst);
        let (_, is_new) = pool.get().unwrap();
        assert!(is_new);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_remove_frees_slot_on_close_failure() {
        let (pool, dialer) = mock_pool(PoolOptions::new(1));
        let (a, _) = pool.get().unwrap();
        dialer.stream(1).0.lock().fail_close = true;

        let err = pool.remove(a).unwrap_err();
        assert_eq!(err.etype(), &CloseError);
        assert_eq!(pool.size(), 0);

        // does not block
        let (b, is_new) = pool.get().unwrap();
        assert!(is_new);
        assert_eq!(id(&b), 2);
        pool.remove(b).unwrap();
        assert!(dialer.stream(2).is_closed());
    }

    #[test]
    fn test_remove_wakes_waiter() {
        let (pool, _) = mock_pool(PoolOptions::new(1));
        let (a, _) = pool.get().unwrap();
        let rx = spawn_get(&pool);
        assert!(rx.recv_timeout(BLOCKED).is_err());
        pool.remove(a).unwrap();
        let (b, is_new) = rx.recv_timeout(PATIENCE).unwrap().unwrap();
        assert!(is_new);
        assert_eq!(id(&b), 2);
    }

    #[test]
    fn test_close_hook() {
        let (pool, dialer) = mock_pool(PoolOptions::new(1));
        let hooked = Arc::new(AtomicUsize::new(0));
        let h = hooked.clone();
        let pool = Arc::try_unwrap(pool)
            .ok()
            .unwrap()
            .with_close_hook(Box::new(move |_stream: &mut MockStream| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        let (a, _) = pool.get().unwrap();
        pool.remove(a).unwrap();
        assert_eq!(hooked.load(Ordering::SeqCst), 1);
        // the hook replaces the native close
        assert!(!dialer.stream(1).is_closed());
    }

    #[test]
    fn test_idle_eviction() {
        let mut options = PoolOptions::new(2);
        options.idle_timeout = Some(Duration::from_millis(200));
        let (pool, dialer) = mock_pool(options);

        let (a, _) = pool.get().unwrap();
        pool.put(a.clone()).unwrap();
        // not yet expired
        let (a2, is_new) = pool.get().unwrap();
        assert!(a.same(&a2));
        assert!(!is_new);

        pool.put(a2).unwrap();
        thread::sleep(Duration::from_millis(300));
        let (b, is_new) = pool.get().unwrap();
        assert!(is_new);
        assert!(!b.same(&a));
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.size(), 1);
        assert!(dialer.stream(1).is_closed());
    }

    #[test]
    fn test_idle_eviction_closes_before_dial() {
        init_log();
        let open = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (o, p) = (open.clone(), peak.clone());
        let count = AtomicUsize::new(0);
        let dial: DialFn<MockStream> = Box::new(move || {
            let now_open = o.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now_open, Ordering::SeqCst);
            Ok(MockStream::new(count.fetch_add(1, Ordering::SeqCst) + 1))
        });
        let o = open.clone();
        let mut options = PoolOptions::new(1);
        options.idle_timeout = Some(Duration::from_millis(50));
        let pool = ConnectionPool::new(dial, options).with_close_hook(Box::new(
            move |_stream: &mut MockStream| {
                o.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            },
        ));

        let (a, _) = pool.get().unwrap();
        pool.put(a.clone()).unwrap();
        thread::sleep(Duration::from_millis(100));
        let (b, is_new) = pool.get().unwrap();
        assert!(is_new);
        assert!(!b.same(&a));
        assert_eq!(open.load(Ordering::SeqCst), 1);
        // the expired connection was closed before its replacement was dialed
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        pool.remove(b).unwrap();
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_held_handle_does_not_stall_pool() {
        let mut options = PoolOptions::new(2);
        options.idle_timeout = Some(Duration::from_secs(60));
        let (pool, _) = mock_pool(options);
        let (a, _) = pool.get().unwrap();
        let (b, _) = pool.get().unwrap();

        // a caller keeps a locked clone of `a` around after releasing it
        let guard = a.lock();
        let (tx, rx) = mpsc::channel();
        let p = pool.clone();
        let (a2, b2) = (a.clone(), b.clone());
        thread::spawn(move || {
            p.put(a2).unwrap();
            p.put(b2).unwrap();
            // the sweep looks at `a` at the back of the idle list
            let _ = tx.send(p.get());
        });
        let (c, is_new) = rx.recv_timeout(PATIENCE).unwrap().unwrap();
        assert!(c.same(&b));
        assert!(!is_new);
        assert_eq!(pool.len(), 1);
        drop(guard);
    }

    #[test]
    fn test_close() {
        let (pool, dialer) = mock_pool(PoolOptions::new(2));
        let (a, _) = pool.get().unwrap();
        let (b, _) = pool.get().unwrap();
        pool.put(a).unwrap();
        pool.put(b).unwrap();
        assert_eq!(pool.len(), 2);

        pool.close().unwrap();
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.size(), 0);
        assert!(pool.is_closed());
        assert!(dialer.stream(1).is_closed());
        assert!(dialer.stream(2).is_closed());

        let err = pool.get().unwrap_err();
        assert_eq!(err.etype(), &PoolClosed);
        assert_eq!(err.esource(), &redpool_error::ErrorSource::Local);
    }

    #[test]
    fn test_close_partial_failure() {
        let (pool, dialer) = mock_pool(PoolOptions::new(3));
        let conns: Vec<_> = (0..3).map(|_| pool.get().unwrap().0).collect();
        for c in conns {
            pool.put(c).unwrap();
        }
        // idle order is now 3, 2, 1
        dialer.stream(2).0.lock().fail_close = true;

        let err = pool.close().unwrap_err();
        assert_eq!(err.etype(), &CloseError);
        assert!(dialer.stream(3).is_closed());
        assert!(!dialer.stream(2).is_closed());
        assert!(!dialer.stream(1).is_closed());
        assert_eq!(pool.len(), 1);
        assert!(pool.len() <= pool.size());

        // the rest can still be closed
        pool.close().unwrap();
        assert!(dialer.stream(1).is_closed());
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_close_wakes_blocked_get() {
        let (pool, dialer) = mock_pool(PoolOptions::new(1));
        let (a, _) = pool.get().unwrap();
        let rx = spawn_get(&pool);
        assert!(rx.recv_timeout(BLOCKED).is_err());

        pool.close().unwrap();
        let err = rx.recv_timeout(PATIENCE).unwrap().unwrap_err();
        assert_eq!(err.etype(), &ErrorType::PoolClosed);

        // a connection released after close is closed rather than kept
        pool.put(a).unwrap();
        assert_eq!(pool.len(), 0);
        assert!(dialer.stream(1).is_closed());
    }

    #[test]
    fn test_bounds_under_load() {
        const MAX: usize = 3;
        let (pool, _) = mock_pool(PoolOptions::new(MAX));
        let workers: Vec<_> = (0..8)
            .map(|w| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        let (conn, _) = pool.get().unwrap();
                        assert!(pool.size() <= MAX);
                        if (i + w) % 5 == 0 {
                            pool.remove(conn).unwrap();
                        } else {
                            pool.put(conn).unwrap();
                        }
                        assert!(pool.size() <= MAX);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert!(pool.len() <= pool.size());
        assert!(pool.size() <= MAX);
        // nothing is checked out anymore
        assert_eq!(pool.len(), pool.size());
    }

    #[test]
    fn test_options_from_conf() {
        let conf = PoolConf {
            max_connections: 4,
            read_timeout_ms: Some(250),
            write_timeout_ms: Some(0),
            idle_timeout_seconds: Some(60),
            ..Default::default()
        };
        let options = PoolOptions::from_conf(&conf);
        assert_eq!(options.max_connections, 4);
        assert_eq!(options.read_timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.write_timeout, None);
        assert_eq!(options.idle_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    #[should_panic(expected = "max_connections must be positive")]
    fn test_zero_limit() {
        let _ = mock_pool(PoolOptions::new(0));
    }
}
