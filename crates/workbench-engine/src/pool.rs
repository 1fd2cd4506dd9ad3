//! Bounded pool of engine sessions
//!
//! ## Architecture
//!
//! - **Permits**: a FIFO-fair semaphore with `max_pool_size` permits. Holding
//!   a permit is what makes a caller "busy"; waiting for one is the only
//!   suspension point and is what queues callers in arrival order.
//! - **Slots**: idle sessions plus the ids of busy ones. A session is created
//!   lazily when a permit holder finds no idle session, so the pool never
//!   opens more than `max_pool_size` sessions.
//! - **Guards**: [`PooledConnection`] returns its session on drop, so every
//!   exit path releases, including errors and cancelled futures.
//!
//! A session whose operation failed with a fatal engine error, or that was
//! dropped mid-operation, is closed instead of returned to idle. Its slot is
//! refilled by the next acquire; the rest of the pool is untouched.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::engine::{Engine, EngineConnection, PreparedStatement, QueryResult, RowBatch};
use crate::{Error, Result};

/// Lifecycle of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
   Idle,
   Busy,
   Closed,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
   pub max_size: usize,
   /// Sessions currently open (idle + busy)
   pub open: usize,
   pub idle: usize,
   pub busy: usize,
   /// Callers suspended in `acquire()`
   pub waiting: usize,
   pub closed: bool,
}

struct IdleSlot<C> {
   id: u64,
   conn: C,
}

struct Slots<C> {
   idle: VecDeque<IdleSlot<C>>,
   busy: HashSet<u64>,
}

struct PoolInner<E: Engine> {
   engine: Arc<E>,
   config: PoolConfig,
   permits: Arc<Semaphore>,
   slots: Mutex<Slots<E::Connection>>,
   next_id: AtomicU64,
   waiting: AtomicUsize,
   closed: AtomicBool,
}

impl<E: Engine> PoolInner<E> {
   /// Return a busy slot. Unknown ids are ignored with a warning.
   fn return_slot(&self, id: u64, conn: E::Connection, retire: bool) {
      let retire = retire || self.closed.load(Ordering::Acquire);
      {
         let mut slots = self.slots.lock();
         if !slots.busy.remove(&id) {
            warn!(connection_id = id, "Released a connection the pool does not hold as busy");
         }
         if !retire {
            slots.idle.push_back(IdleSlot { id, conn });
            trace!(connection_id = id, "Connection returned to idle");
            return;
         }
      }

      debug!(connection_id = id, "Retiring connection");
      close_detached(id, conn);
   }
}

/// Close a session in the background if a runtime is available, otherwise
/// just drop it.
fn close_detached<C: EngineConnection>(id: u64, conn: C) {
   match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
         handle.spawn(async move {
            if let Err(e) = conn.close().await {
               warn!(connection_id = id, error = %e, "Failed to close retired connection");
            }
         });
      }
      Err(_) => drop(conn),
   }
}

/// Decrements the waiting counter even if the acquire future is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
   fn new(counter: &'a AtomicUsize) -> Self {
      counter.fetch_add(1, Ordering::AcqRel);
      Self(counter)
   }
}

impl Drop for WaitingGuard<'_> {
   fn drop(&mut self) {
      self.0.fetch_sub(1, Ordering::AcqRel);
   }
}

/// Bounded set of reusable engine sessions.
///
/// Cloning is cheap and every clone refers to the same pool.
pub struct ConnectionPool<E: Engine> {
   inner: Arc<PoolInner<E>>,
}

impl<E: Engine> Clone for ConnectionPool<E> {
   fn clone(&self) -> Self {
      Self {
         inner: Arc::clone(&self.inner),
      }
   }
}

impl<E: Engine> ConnectionPool<E> {
   /// Create a pool over an initialized engine.
   ///
   /// No session is opened until the first acquire. A `max_pool_size` of 0
   /// is treated as 1.
   pub fn new(engine: Arc<E>, config: PoolConfig) -> Self {
      let config = PoolConfig {
         max_pool_size: config.max_pool_size.max(1),
         ..config
      };

      Self {
         inner: Arc::new(PoolInner {
            engine,
            permits: Arc::new(Semaphore::new(config.max_pool_size)),
            slots: Mutex::new(Slots {
               idle: VecDeque::new(),
               busy: HashSet::new(),
            }),
            config,
            next_id: AtomicU64::new(1),
            waiting: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
         }),
      }
   }

   pub fn engine(&self) -> &Arc<E> {
      &self.inner.engine
   }

   pub fn config(&self) -> &PoolConfig {
      &self.inner.config
   }

   /// Acquire a session, waiting up to `timeout` (or the configured
   /// `acquire_timeout`) for one to become idle.
   ///
   /// Fails with `ConnectionTimeout` when the deadline passes,
   /// `PoolExhausted` when the pool is configured not to wait, and
   /// `PoolClosed` after [`close`](Self::close).
   pub async fn acquire(&self, timeout: Option<Duration>) -> Result<PooledConnection<E>> {
      if !self.inner.config.wait_when_exhausted {
         return self.try_acquire().await;
      }
      if self.inner.closed.load(Ordering::Acquire) {
         return Err(Error::PoolClosed);
      }

      let wait = timeout.unwrap_or(self.inner.config.acquire_timeout);
      let acquired = {
         let _waiting = WaitingGuard::new(&self.inner.waiting);
         tokio::time::timeout(wait, Arc::clone(&self.inner.permits).acquire_owned()).await
      };

      let permit = match acquired {
         Ok(Ok(permit)) => permit,
         Ok(Err(_)) => return Err(Error::PoolClosed),
         Err(_) => {
            warn!(
               waited_ms = wait.as_millis() as u64,
               max_size = self.inner.config.max_pool_size,
               "Timed out waiting for a database connection"
            );
            return Err(Error::ConnectionTimeout { waited: wait });
         }
      };

      self.checkout(permit).await
   }

   /// Acquire a session without waiting.
   pub async fn try_acquire(&self) -> Result<PooledConnection<E>> {
      if self.inner.closed.load(Ordering::Acquire) {
         return Err(Error::PoolClosed);
      }

      let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
         Ok(permit) => permit,
         Err(TryAcquireError::Closed) => return Err(Error::PoolClosed),
         Err(TryAcquireError::NoPermits) => {
            debug!(max_size = self.inner.config.max_pool_size, "Connection pool exhausted");
            return Err(Error::PoolExhausted {
               max_size: self.inner.config.max_pool_size,
            });
         }
      };

      self.checkout(permit).await
   }

   /// Turn a permit into a session: reuse an idle one or open a new one.
   async fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<PooledConnection<E>> {
      let idle = self.inner.slots.lock().idle.pop_front();

      let (id, conn) = match idle {
         Some(slot) => (slot.id, slot.conn),
         None => {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            // On failure the permit drops with this frame, so the slot frees up
            let conn = self.inner.engine.create_connection().await?;
            debug!(connection_id = id, "Opened pooled connection");
            (id, conn)
         }
      };

      self.inner.slots.lock().busy.insert(id);
      trace!(connection_id = id, "Connection checked out");

      Ok(PooledConnection {
         pool: Arc::clone(&self.inner),
         id,
         conn: Some(conn),
         permit: Some(permit),
         retire: false,
         in_flight: false,
      })
   }

   /// Return a session to the pool.
   ///
   /// Equivalent to dropping the guard.
   pub fn release(&self, mut conn: PooledConnection<E>) {
      conn.release();
   }

   /// Acquire a session, run one statement and release the session.
   pub async fn query(&self, sql: &str, params: Vec<JsonValue>) -> Result<QueryResult> {
      let mut conn = self.acquire(None).await?;
      conn.execute(sql, params).await
   }

   /// Run `f` with a pooled session, releasing it on every exit path.
   ///
   /// A fatal engine error returned by `f` retires the session.
   ///
   /// ```no_run
   /// # use workbench_engine::{ConnectionPool, SqliteEngine};
   /// # async fn demo(pool: ConnectionPool<SqliteEngine>) -> workbench_engine::Result<()> {
   /// let count = pool
   ///    .with_connection(|conn| {
   ///       Box::pin(async move {
   ///          let result = conn.execute("SELECT count(*) AS n FROM t", vec![]).await?;
   ///          Ok::<_, workbench_engine::Error>(result.rows.len())
   ///       })
   ///    })
   ///    .await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut PooledConnection<E>) -> BoxFuture<'c, Result<T>> + Send,
      T: Send,
   {
      let mut conn = self.acquire(None).await?;
      let result = f(&mut conn).await;
      if let Err(e) = &result
         && e.is_fatal()
      {
         conn.mark_broken();
      }
      result
   }

   /// Close every idle session. Busy sessions are unaffected and new ones
   /// open lazily.
   pub async fn close_idle(&self) {
      let drained: Vec<IdleSlot<E::Connection>> = self.inner.slots.lock().idle.drain(..).collect();
      debug!(count = drained.len(), "Closing idle connections");

      for slot in drained {
         if let Err(e) = slot.conn.close().await {
            warn!(connection_id = slot.id, error = %e, "Failed to close idle connection");
         }
      }
   }

   /// Shut the pool down.
   ///
   /// Waiters fail with `PoolClosed`, idle sessions close now and busy ones
   /// close when released.
   pub async fn close(&self) {
      if self.inner.closed.swap(true, Ordering::AcqRel) {
         return;
      }
      self.inner.permits.close();
      self.close_idle().await;
      debug!("Connection pool closed");
   }

   pub fn is_closed(&self) -> bool {
      self.inner.closed.load(Ordering::Acquire)
   }

   pub fn status(&self) -> PoolStatus {
      let slots = self.inner.slots.lock();
      PoolStatus {
         max_size: self.inner.config.max_pool_size,
         open: slots.idle.len() + slots.busy.len(),
         idle: slots.idle.len(),
         busy: slots.busy.len(),
         waiting: self.inner.waiting.load(Ordering::Acquire),
         closed: self.inner.closed.load(Ordering::Acquire),
      }
   }
}

/// RAII guard for a busy session.
///
/// Every operation on a released guard fails with
/// [`Error::DatabaseClosed`]. Dropping the guard releases the session;
/// [`release`](Self::release) does the same explicitly and is safe to call
/// more than once.
#[must_use = "if unused, the connection is immediately released"]
pub struct PooledConnection<E: Engine> {
   pool: Arc<PoolInner<E>>,
   id: u64,
   conn: Option<E::Connection>,
   permit: Option<OwnedSemaphorePermit>,
   retire: bool,
   in_flight: bool,
}

impl<E: Engine> PooledConnection<E> {
   pub fn id(&self) -> u64 {
      self.id
   }

   pub fn state(&self) -> ConnectionState {
      if self.conn.is_some() {
         ConnectionState::Busy
      } else {
         ConnectionState::Closed
      }
   }

   /// Close this session on release instead of returning it to idle.
   pub fn mark_broken(&mut self) {
      self.retire = true;
   }

   /// Run a statement, retiring the session if the engine reports a fatal
   /// error or the future is dropped before completion.
   pub async fn execute(&mut self, sql: &str, params: Vec<JsonValue>) -> Result<QueryResult> {
      let conn = self.conn.as_mut().ok_or(Error::DatabaseClosed)?;
      self.in_flight = true;
      let result = conn.execute(sql, params).await;
      self.in_flight = false;
      if let Err(e) = &result
         && e.is_fatal()
      {
         self.retire = true;
      }
      result
   }

   /// Prepare a statement with the same retirement rules as `execute`.
   pub async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
      let conn = self.conn.as_mut().ok_or(Error::DatabaseClosed)?;
      self.in_flight = true;
      let result = conn.prepare(sql).await;
      self.in_flight = false;
      if let Err(e) = &result
         && e.is_fatal()
      {
         self.retire = true;
      }
      result
   }

   /// Stream a query's rows in batches. A released guard yields a single
   /// `DatabaseClosed` error.
   pub fn stream<'a>(
      &'a mut self,
      sql: &'a str,
      params: Vec<JsonValue>,
      batch_size: usize,
   ) -> BoxStream<'a, Result<RowBatch>> {
      match self.conn.as_mut() {
         Some(conn) => conn.stream(sql, params, batch_size),
         None => futures::stream::iter([Err(Error::DatabaseClosed)]).boxed(),
      }
   }

   pub async fn ping(&mut self) -> Result<()> {
      let conn = self.conn.as_mut().ok_or(Error::DatabaseClosed)?;
      let result = conn.ping().await;
      if result.is_err() {
         self.retire = true;
      }
      result
   }

   /// Return the session to the pool. A second call only logs a warning.
   pub fn release(&mut self) {
      let Some(conn) = self.conn.take() else {
         warn!(connection_id = self.id, "Connection released more than once; ignoring");
         return;
      };

      if self.in_flight {
         warn!(connection_id = self.id, "Connection released mid-operation; retiring it");
      }
      self.pool.return_slot(self.id, conn, self.retire || self.in_flight);
      // Give the permit back only after the session is idle so the next
      // waiter finds it
      self.permit.take();
   }
}

impl<E: Engine> Drop for PooledConnection<E> {
   fn drop(&mut self) {
      if self.conn.is_some() {
         self.release();
      }
   }
}
