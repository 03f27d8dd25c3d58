use super::config::SessionConfig;
use crate::core::{LedgerError, LedgerResult};
use crate::ledger::{LedgerClient, LedgerSession, LedgerTransaction};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

type Available = Arc<Mutex<VecDeque<PooledSession>>>;

/// Session pool
///
/// Keeps up to `max_sessions` ledger sessions open and hands each one to a
/// single caller at a time through a [`SessionGuard`].
pub struct SessionPool {
    client: Arc<dyn LedgerClient>,
    config: SessionConfig,
    available: Available,
    /// Sessions alive, pooled or handed out
    total_sessions: Arc<AtomicUsize>,
}

/// A session waiting in the pool
struct PooledSession {
    session: Box<dyn LedgerSession>,
    created_at: Instant,
    last_used: Instant,
}

impl PooledSession {
    fn new(session: Box<dyn LedgerSession>, created_at: Instant) -> Self {
        Self {
            session,
            created_at,
            last_used: Instant::now(),
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        if let Some(timeout) = idle_timeout {
            self.last_used.elapsed() > timeout
        } else {
            false
        }
    }
}

impl SessionPool {
    pub fn new(client: Arc<dyn LedgerClient>, config: SessionConfig) -> Self {
        Self {
            client,
            config,
            available: Arc::new(Mutex::new(VecDeque::new())),
            total_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn client(&self) -> &Arc<dyn LedgerClient> {
        &self.client
    }

    /// Get a session, waiting up to `acquire_timeout` for one to free up
    pub async fn acquire(&self) -> LedgerResult<SessionGuard> {
        let start = Instant::now();

        loop {
            if let Some(pooled) = self.try_get_available().await {
                return Ok(self.guard(pooled.session, pooled.created_at));
            }

            if let Some(session) = self.try_create_session().await? {
                return Ok(self.guard(session, Instant::now()));
            }

            if start.elapsed() > self.config.acquire_timeout {
                log::warn!(
                    "Session pool exhausted: {} session(s) busy after {:?}",
                    self.config.max_sessions,
                    self.config.acquire_timeout
                );
                return Err(LedgerError::Timeout(self.config.acquire_timeout));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn guard(&self, session: Box<dyn LedgerSession>, created_at: Instant) -> SessionGuard {
        SessionGuard {
            session: Some(session),
            created_at,
            pool: Arc::clone(&self.available),
            total_sessions: Arc::clone(&self.total_sessions),
        }
    }

    /// Pop a usable session, closing the stale ones found on the way
    async fn try_get_available(&self) -> Option<PooledSession> {
        let mut stale = Vec::new();
        let found = {
            let mut available = self.available.lock().await;
            let mut found = None;
            while let Some(pooled) = available.pop_front() {
                if !pooled.session.is_open() || pooled.is_idle_too_long(self.config.idle_timeout) {
                    stale.push(pooled);
                } else {
                    found = Some(pooled);
                    break;
                }
            }
            found
        };

        if !stale.is_empty() {
            self.total_sessions.fetch_sub(stale.len(), Ordering::SeqCst);
            for pooled in stale {
                if let Err(e) = pooled.session.close().await {
                    log::debug!("Closing stale session {} failed: {}", pooled.session.id(), e);
                }
            }
        }

        found
    }

    /// Start a new session if under the limit
    async fn try_create_session(&self) -> LedgerResult<Option<Box<dyn LedgerSession>>> {
        let reserved = self
            .total_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < self.config.max_sessions).then_some(total + 1)
            })
            .is_ok();
        if !reserved {
            return Ok(None);
        }

        match self.client.start_session().await {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                self.total_sessions.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Close every pooled session
    ///
    /// Sessions handed out at the time are closed when their guards give them
    /// back. Returns the first close failure after attempting all of them.
    pub async fn close_all(&self) -> LedgerResult<()> {
        let drained: Vec<PooledSession> = self.available.lock().await.drain(..).collect();
        self.total_sessions.fetch_sub(drained.len(), Ordering::SeqCst);

        let mut first_error = None;
        for pooled in drained {
            if let Err(e) = pooled.session.close().await {
                log::warn!("Failed to close session {}: {}", pooled.session.id(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let available = self.available.lock().await;
        let total = self.total_sessions.load(Ordering::SeqCst);

        PoolStats {
            total_sessions: total,
            available_sessions: available.len(),
            active_sessions: total.saturating_sub(available.len()),
            max_sessions: self.config.max_sessions,
        }
    }
}

/// Session pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub available_sessions: usize,
    pub active_sessions: usize,
    pub max_sessions: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_sessions, self.total_sessions, self.available_sessions, self.max_sessions
        )
    }
}

/// RAII guard for a pooled session
///
/// Returns the session to the pool when dropped. Prefer [`SessionGuard::release`]
/// or [`SessionGuard::discard`], which can wait for the pool lock.
pub struct SessionGuard {
    session: Option<Box<dyn LedgerSession>>,
    created_at: Instant,
    pool: Available,
    total_sessions: Arc<AtomicUsize>,
}

impl SessionGuard {
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id())
    }

    /// Begin a transaction on the guarded session
    pub async fn begin(&self) -> LedgerResult<Box<dyn LedgerTransaction>> {
        match &self.session {
            Some(session) => session.begin().await,
            None => Err(LedgerError::SessionClosed),
        }
    }

    /// Give the session back to the pool
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            if session.is_open() {
                self.pool
                    .lock()
                    .await
                    .push_back(PooledSession::new(session, self.created_at));
            } else {
                self.total_sessions.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Close the session instead of pooling it
    pub async fn discard(mut self) {
        if let Some(session) = self.session.take() {
            self.total_sessions.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = session.close().await {
                log::debug!("Closing discarded session {} failed: {}", session.id(), e);
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if session.is_open() {
                if let Ok(mut pool) = self.pool.try_lock() {
                    pool.push_back(PooledSession::new(session, self.created_at));
                    return;
                }
                log::warn!(
                    "SessionGuard dropped while the pool was busy; session {} abandoned",
                    session.id()
                );
            }
            self.total_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
