//! Bounded pool of reusable sessions.
//!
//! The pool hands out [`SessionLease`]s. At most `capacity` sessions are
//! leased at any time; released sessions that are still valid are kept idle
//! for reuse, everything else is ended and dropped. Session creation and
//! session teardown happen outside the pool lock.

use crate::communicator::Communicator;
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::session::Session;
use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions started on the service.
    pub sessions_created: u64,
    /// Sessions ended and dropped (invalid, surplus, or closed).
    pub sessions_discarded: u64,
    /// Acquire calls that gave up waiting.
    pub acquire_timeouts: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<Session>,
    leased: usize,
    closed: bool,
}

enum Slot {
    Idle(Session),
    Reserved,
}

/// A bounded pool of sessions.
pub struct SessionPool {
    ledger_name: String,
    communicator: Arc<dyn Communicator>,
    capacity: usize,
    acquire_timeout: Duration,
    creation_attempts: u32,
    creation_backoff: Duration,
    read_ahead: usize,
    state: Mutex<PoolState>,
    available: Condvar,
    next_session_id: AtomicU64,
    sessions_created: AtomicU64,
    sessions_discarded: AtomicU64,
    acquire_timeouts: AtomicU64,
}

impl SessionPool {
    /// Creates an empty pool sized by `config`.
    pub fn new(config: &DriverConfig, communicator: Arc<dyn Communicator>) -> Self {
        Self {
            ledger_name: config.ledger_name.clone(),
            communicator,
            capacity: config.max_concurrent_transactions,
            acquire_timeout: config.pool_acquire_timeout,
            creation_attempts: config.session_creation_attempts.max(1),
            creation_backoff: config.session_creation_backoff,
            read_ahead: config.read_ahead,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            next_session_id: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_discarded: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
        }
    }

    /// Leases a session, waiting up to the configured acquire timeout.
    pub fn acquire(&self) -> DriverResult<SessionLease<'_>> {
        self.acquire_timeout(self.acquire_timeout)
    }

    /// Leases a session, waiting up to `timeout` for one to be released.
    pub fn acquire_timeout(&self, timeout: Duration) -> DriverResult<SessionLease<'_>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut stale = Vec::new();

        let slot = {
            let mut state = self.state.lock();
            loop {
                if state.closed {
                    break Err(DriverError::DriverClosed);
                }
                if let Some(session) = state.idle.pop() {
                    if session.is_alive() {
                        state.leased += 1;
                        break Ok(Slot::Idle(session));
                    }
                    stale.push(session);
                    continue;
                }
                if state.leased < self.capacity {
                    state.leased += 1;
                    break Ok(Slot::Reserved);
                }

                let timed_out = match deadline {
                    Some(deadline) => self.available.wait_until(&mut state, deadline).timed_out(),
                    None => {
                        self.available.wait(&mut state);
                        false
                    }
                };
                if timed_out
                    && !state.closed
                    && state.idle.is_empty()
                    && state.leased >= self.capacity
                {
                    break Err(DriverError::PoolTimeout { timeout });
                }
            }
        };

        for session in stale {
            self.discard(session);
        }

        match slot {
            Ok(Slot::Idle(session)) => {
                tracing::trace!(session_id = session.id(), "reusing idle session");
                Ok(SessionLease::new(self, session))
            }
            Ok(Slot::Reserved) => match self.create_session() {
                Ok(session) => Ok(SessionLease::new(self, session)),
                Err(e) => {
                    self.return_slot();
                    Err(e)
                }
            },
            Err(e) => {
                if matches!(e, DriverError::PoolTimeout { .. }) {
                    self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(timeout_ms = timeout.as_millis() as u64, "timed out waiting for a session");
                }
                Err(e)
            }
        }
    }

    /// Returns a leased session to the pool.
    ///
    /// Valid sessions are kept for reuse while the idle set has room and the
    /// pool is open; all others are ended.
    pub fn release(&self, session: Session, valid: bool) {
        let keep = valid && session.is_alive();
        let rejected = {
            let mut state = self.state.lock();
            state.leased = state.leased.saturating_sub(1);
            let rejected = if keep && !state.closed && state.idle.len() < self.capacity {
                state.idle.push(session);
                None
            } else {
                Some(session)
            };
            self.available.notify_one();
            rejected
        };

        if let Some(session) = rejected {
            self.discard(session);
        }
    }

    /// Closes the pool, ending all idle sessions.
    ///
    /// Blocked and future acquirers fail with [`DriverError::DriverClosed`].
    /// Sessions still leased are ended when released.
    pub fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            self.available.notify_all();
            std::mem::take(&mut state.idle)
        };
        for session in idle {
            self.discard(session);
        }
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Maximum number of leased sessions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of sessions currently leased.
    pub fn leased_count(&self) -> usize {
        self.state.lock().leased
    }

    /// Number of idle sessions.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_discarded: self.sessions_discarded.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Name of the ledger sessions are started on.
    pub fn ledger_name(&self) -> &str {
        &self.ledger_name
    }

    fn create_session(&self) -> DriverResult<Session> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
            let started = Session::start(id, &self.ledger_name, Arc::clone(&self.communicator))
                .map(|session| session.with_read_ahead(self.read_ahead));
            match started {
                Ok(session) => {
                    self.sessions_created.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(session_id = id, "started session");
                    return Ok(session);
                }
                Err(e) if e.is_retryable() && attempt < self.creation_attempts => {
                    let delay = self.creation_backoff * attempt;
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "failed to start session, retrying",
                    );
                    std::thread::sleep(delay);
                }
                Err(e) if e.is_retryable() => {
                    return Err(DriverError::PoolExhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn return_slot(&self) {
        let mut state = self.state.lock();
        state.leased = state.leased.saturating_sub(1);
        self.available.notify_one();
    }

    fn discard(&self, session: Session) {
        tracing::debug!(session_id = session.id(), alive = session.is_alive(), "discarding session");
        session.end();
        self.sessions_discarded.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionPool")
            .field("ledger_name", &self.ledger_name)
            .field("capacity", &self.capacity)
            .field("leased", &state.leased)
            .field("idle", &state.idle.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Exclusive lease on a pooled session.
///
/// Dropping the lease releases the session, keeping it only if it is still
/// alive. Use [`release`](Self::release) to decide explicitly.
pub struct SessionLease<'p> {
    pool: &'p SessionPool,
    session: Option<Session>,
}

impl<'p> SessionLease<'p> {
    fn new(pool: &'p SessionPool, session: Session) -> Self {
        Self {
            pool,
            session: Some(session),
        }
    }

    /// Releases the session, marking it valid or not.
    pub fn release(mut self, valid: bool) {
        if let Some(session) = self.session.take() {
            self.pool.release(session, valid);
        }
    }
}

impl Deref for SessionLease<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        // Invariant: `session` is only taken by `release(self)` and `drop`,
        // so it is present for as long as the lease can be borrowed.
        self.session
            .as_ref()
            .expect("lease holds its session until released")
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let valid = session.is_alive();
            self.pool.release(session, valid);
        }
    }
}

impl std::fmt::Debug for SessionLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session", &self.session)
            .finish()
    }
}
