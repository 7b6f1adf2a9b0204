//! Connection pooling.
//!
//! One pool per connection-string value, holding a LIFO stack of idle
//! connectors so a hot set stays warm. A saturated pool parks acquirers in
//! a waiter queue; a released connector is handed to the oldest live waiter
//! directly, without touching the idle stack, and the waiter inherits the
//! busy slot. All mutable pool state sits behind one mutex whose critical
//! sections are O(1); connector construction and reset happen outside it.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::oneshot;

use crate::{
    Error, Result,
    config::{Config, POOL_SIZE_LIMIT, ParseError},
    connector::Connector,
    error::{ErrorKind, TimeoutKind},
};

pub mod manager;

/// A pool of reusable backend connectors for one configuration.
///
/// Cloning shares the pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: Config,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Ready connectors, most recently used on top.
    idle: Vec<Connector>,
    /// Parked acquirers, oldest first.
    waiting: VecDeque<oneshot::Sender<Connector>>,
    /// Checked-out plus under-construction connectors.
    busy: usize,
}

impl Pool {
    /// Create a pool and start filling it to the configured minimum size.
    ///
    /// Rejects a minimum above the maximum; both are already bounded by
    /// [`POOL_SIZE_LIMIT`] at parse time.
    pub fn new(config: Config) -> Result<Pool> {
        if config.min_pool_size > config.max_pool_size {
            return Err(ParseError::MinAboveMax.into());
        }
        debug_assert!(config.max_pool_size <= POOL_SIZE_LIMIT);

        let pool = Pool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    waiting: VecDeque::new(),
                    busy: 0,
                }),
            }),
        };
        pool.spawn_min_fill();
        Ok(pool)
    }

    /// Parse a connection string and create a dedicated pool for it.
    pub fn connect(conn_str: &str) -> Result<Pool> {
        Pool::new(Config::parse(conn_str)?)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Connectors currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().unwrap().idle.len()
    }

    /// Connectors checked out or being opened.
    pub fn busy_count(&self) -> usize {
        self.inner.state.lock().unwrap().busy
    }

    /// Borrow a connector, waiting up to the configured `Timeout` when the
    /// pool is saturated.
    ///
    /// The most recently released connector is preferred. At capacity the
    /// caller parks in the waiter queue; a timed-out waiter double-checks
    /// for a hand-off that raced the deadline before giving up.
    pub async fn acquire(&self) -> Result<PoolConnection> {
        enum Plan {
            Reuse(Connector),
            Grow,
            Wait(oneshot::Receiver<Connector>),
        }

        let plan = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(conn) = state.idle.pop() {
                state.busy += 1;
                Plan::Reuse(conn)
            } else if state.busy < self.inner.config.max_pool_size {
                state.busy += 1;
                Plan::Grow
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiting.push_back(tx);
                Plan::Wait(rx)
            }
        };

        match plan {
            Plan::Reuse(conn) => Ok(self.guard(conn)),
            Plan::Grow => match Connector::open(self.inner.config.clone()).await {
                Ok(conn) => Ok(self.guard(conn)),
                Err(err) => {
                    self.inner.forget_one();
                    Err(err)
                }
            },
            Plan::Wait(mut rx) => {
                match self.inner.config.acquire_timeout {
                    None => match (&mut rx).await {
                        Ok(conn) => Ok(self.guard(conn)),
                        Err(_closed) => Err(ErrorKind::PoolClosed.into()),
                    },
                    Some(timeout) => match tokio::time::timeout(timeout, &mut rx).await {
                        Ok(Ok(conn)) => Ok(self.guard(conn)),
                        Ok(Err(_closed)) => Err(ErrorKind::PoolClosed.into()),
                        // a release may have completed the hand-off in the
                        // same instant the deadline fired
                        Err(_elapsed) => match rx.try_recv() {
                            Ok(conn) => Ok(self.guard(conn)),
                            Err(_) => Err(ErrorKind::Timeout(TimeoutKind::PoolAcquire).into()),
                        },
                    },
                }
            }
        }
    }

    /// Borrow a connector only if one is available right now.
    ///
    /// Fails with [`ErrorKind::PoolExhausted`] instead of waiting.
    pub fn try_acquire(&self) -> Result<PoolConnection> {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(conn) = state.idle.pop() {
            state.busy += 1;
            return Ok(self.guard(conn));
        }
        Err(ErrorKind::PoolExhausted.into())
    }

    fn guard(&self, conn: Connector) -> PoolConnection {
        PoolConnection {
            conn: Some(conn),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Open connectors in the background until the pool holds at least
    /// `MinPoolSize` of them.
    fn spawn_min_fill(&self) {
        if self.inner.config.min_pool_size == 0 {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                {
                    let mut state = inner.state.lock().unwrap();
                    if state.idle.len() + state.busy >= inner.config.min_pool_size {
                        break;
                    }
                    state.busy += 1;
                }
                match Connector::open(inner.config.clone()).await {
                    Ok(conn) => inner.park(conn),
                    Err(_err) => {
                        inner.forget_one();
                        #[cfg(feature = "log")]
                        log::error!("failed to fill pool to its minimum size: {_err}");
                        break;
                    }
                }
            }
        });
    }
}

impl PoolInner {
    /// Hand a ready connector to a live waiter, or park it on the idle
    /// stack and give its busy slot back.
    fn park(&self, mut conn: Connector) {
        let mut state = self.state.lock().unwrap();
        while let Some(waiter) = state.waiting.pop_front() {
            match waiter.send(conn) {
                // hand-off: the waiter inherits the busy slot
                Ok(()) => return,
                // the waiter timed out or dropped; try the next one
                Err(returned) => conn = returned,
            }
        }
        state.idle.push(conn);
        state.busy -= 1;
    }

    /// A connector died: release its busy slot.
    fn forget_one(&self) {
        self.state.lock().unwrap().busy -= 1;
    }

    /// Reset a returned connector and make it available again.
    ///
    /// A broken connector, or one that fails its reset, is destroyed
    /// instead of being pooled.
    async fn release(self: Arc<Self>, mut conn: Connector) {
        if conn.is_broken() {
            self.forget_one();
            return;
        }
        match conn.reset().await {
            Ok(()) => self.park(conn),
            Err(_err) => {
                #[cfg(feature = "log")]
                log::warn!("discarding connector that failed its reset: {_err}");
                self.forget_one();
            }
        }
    }
}

/// A pooled connector checked out of its [`Pool`].
///
/// Dereferences to the underlying [`Connector`]. Dropping the guard returns
/// the connector to the pool in the background; [`PoolConnection::release`]
/// does the same with a completion the caller can await.
pub struct PoolConnection {
    conn: Option<Connector>,
    inner: Arc<PoolInner>,
}

impl PoolConnection {
    /// Return the connector to the pool, waiting for its reset.
    pub async fn release(mut self) -> Result<()> {
        let conn = self.conn.take().expect("connector taken twice");
        Arc::clone(&self.inner).release(conn).await;
        Ok(())
    }

    /// Close the connector for good instead of pooling it.
    pub async fn close(mut self) -> Result<()> {
        let conn = self.conn.take().expect("connector taken twice");
        self.inner.forget_one();
        conn.close().await
    }
}

impl std::ops::Deref for PoolConnection {
    type Target = Connector;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connector already released")
    }
}

impl std::ops::DerefMut for PoolConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connector already released")
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.release(conn));
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Pool")
            .field("idle", &state.idle.len())
            .field("busy", &state.busy)
            .field("waiting", &state.waiting.len())
            .field("max", &self.inner.config.max_pool_size)
            .finish()
    }
}

impl std::fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConnection").field("conn", &self.conn).finish()
    }
}

/// Open a dedicated, unpooled connector for a connection string.
///
/// This is the `Pooling=false` path: the connector belongs to the caller
/// and is closed rather than pooled when no longer needed.
pub async fn connect(conn_str: &str) -> Result<Connector> {
    let config = Config::parse(conn_str).map_err(Error::from)?;
    Connector::open(config).await
}
