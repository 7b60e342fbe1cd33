//! Bounded session pool.
//!
//! Admits at most `max_concurrent_sessions` sessions at once. Requests beyond
//! capacity wait in a FIFO queue and are promoted strictly in arrival order as
//! slots are released. Each queued request carries its own acquisition
//! timeout; each active slot carries an auto-release timer so an orphaned slot
//! cannot hold capacity forever.
//!
//! The pool gates *admission* only. Work done while holding a slot runs
//! concurrently with every other admitted session.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::{lock, BatchError, GatewayError, OperationKind, PoolConfig, SessionId, UserId};

/// Occupancy counters returned by [`SessionPool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active_sessions: usize,
    pub queued_requests: usize,
    pub max_concurrent_sessions: usize,
}

#[derive(Debug)]
struct ActiveSlot {
    operation: OperationKind,
    user_id: Option<UserId>,
    started: Instant,
    timer: Option<AbortHandle>,
}

#[derive(Debug)]
struct QueueEntry {
    session_id: SessionId,
    operation: OperationKind,
    user_id: Option<UserId>,
    enqueued: Instant,
    promote: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct PoolState {
    active: HashMap<SessionId, ActiveSlot>,
    queue: VecDeque<QueueEntry>,
    closed: bool,
}

#[derive(Debug)]
struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

/// Fixed-capacity admission gate with a FIFO waiting queue.
///
/// Cheap to clone; clones share the same slots.
#[derive(Debug, Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

/// One entry of an [`SessionPool::execute_batch`] call.
pub struct BatchOperation<F> {
    pub operation: OperationKind,
    pub user_id: Option<UserId>,
    /// Receives the slot's session id once admitted.
    pub task: F,
}

impl SessionPool {
    /// Creates an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Obtains a slot, waiting in the queue if the pool is full.
    ///
    /// Returns the new slot's session id. Fails with
    /// [`GatewayError::AcquisitionTimeout`] if the request is not promoted
    /// within the acquisition timeout, or [`GatewayError::PoolClosed`] if the
    /// pool is closed. Dropping the returned future while queued withdraws the
    /// request.
    pub async fn acquire(
        &self,
        operation: OperationKind,
        user_id: Option<UserId>,
    ) -> Result<SessionId, GatewayError> {
        let session_id = SessionId::generate("mcp_parallel");
        let mut waiter = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(GatewayError::PoolClosed);
            }
            if state.active.len() < self.inner.config.max_concurrent_sessions {
                self.activate(&mut state, session_id.clone(), operation, user_id);
                return Ok(session_id);
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(QueueEntry {
                session_id: session_id.clone(),
                operation,
                user_id,
                enqueued: Instant::now(),
                promote: tx,
            });
            tracing::debug!(%session_id, %operation, queued = state.queue.len(), "session pool full; request queued");
            Waiter {
                pool: self,
                session_id: session_id.clone(),
                promoted: rx,
                settled: false,
            }
        };

        let timeout = self.inner.config.acquisition_timeout;
        let promoted = tokio::time::timeout(timeout, &mut waiter.promoted).await;
        let outcome = match promoted {
            Ok(Ok(())) => Ok(session_id),
            Ok(Err(_)) => Err(GatewayError::PoolClosed),
            Err(_) => {
                let mut state = lock(&self.inner.state);
                if let Some(pos) = state.queue.iter().position(|e| e.session_id == session_id) {
                    let entry = state.queue.remove(pos);
                    let waited = entry.map_or(timeout, |e| e.enqueued.elapsed());
                    tracing::warn!(%session_id, %operation, ?waited, "session acquisition timed out");
                    Err(GatewayError::AcquisitionTimeout { session_id, waited })
                } else {
                    drop(state);
                    // Promoted in the same instant the timer fired.
                    match waiter.promoted.try_recv() {
                        Ok(()) => Ok(session_id),
                        Err(_) => Err(GatewayError::PoolClosed),
                    }
                }
            }
        };
        waiter.settled = true;
        outcome
    }

    /// Like [`acquire`](Self::acquire), but returns a lease that releases the
    /// slot when dropped.
    pub async fn acquire_lease(
        &self,
        operation: OperationKind,
        user_id: Option<UserId>,
    ) -> Result<SlotLease, GatewayError> {
        let session_id = self.acquire(operation, user_id).await?;
        Ok(SlotLease {
            pool: self.clone(),
            session_id,
            released: false,
        })
    }

    /// Frees the slot held by `session_id` and promotes the head of the queue.
    ///
    /// Returns `false` if `session_id` holds no slot.
    pub fn release(&self, session_id: &SessionId) -> bool {
        let mut state = lock(&self.inner.state);
        let Some(slot) = state.active.remove(session_id) else {
            return false;
        };
        if let Some(timer) = slot.timer {
            timer.abort();
        }
        tracing::debug!(%session_id, operation = %slot.operation, held = ?slot.started.elapsed(), "session slot released");
        self.promote_waiters(&mut state);
        true
    }

    /// Runs every operation under its own slot.
    ///
    /// All acquisitions are issued at once, in list order, so they queue
    /// FIFO behind one another. Each task starts as soon as its own slot is
    /// granted and its slot is released when the task settles, whether it
    /// succeeded or failed. A failed acquisition fails only its own entry.
    /// Results are returned in input order.
    pub async fn execute_batch<T, E, F, Fut>(
        &self,
        operations: Vec<BatchOperation<F>>,
    ) -> Vec<Result<T, BatchError<E>>>
    where
        F: FnOnce(SessionId) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let runs = operations.into_iter().map(|op| async move {
            let lease = self
                .acquire_lease(op.operation, op.user_id)
                .await
                .map_err(BatchError::Acquisition)?;
            let result = (op.task)(lease.session_id().clone()).await;
            lease.release();
            result.map_err(BatchError::Task)
        });
        futures::future::join_all(runs).await
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.inner.state);
        PoolStats {
            active_sessions: state.active.len(),
            queued_requests: state.queue.len(),
            max_concurrent_sessions: self.inner.config.max_concurrent_sessions,
        }
    }

    /// Returns `true` if `session_id` currently holds a slot.
    pub fn is_active(&self, session_id: &SessionId) -> bool {
        lock(&self.inner.state).active.contains_key(session_id)
    }

    /// Force-releases every slot older than the session timeout.
    ///
    /// Returns the number of slots reclaimed.
    pub fn sweep(&self) -> usize {
        let timeout = self.inner.config.session_timeout;
        let expired: Vec<SessionId> = lock(&self.inner.state)
            .active
            .iter()
            .filter(|(_, slot)| slot.started.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter(|id| {
                tracing::warn!(session_id = %id, "reclaiming expired session slot");
                self.release(id)
            })
            .count()
    }

    /// Stops admitting new requests and fails every queued waiter with
    /// [`GatewayError::PoolClosed`]. Active slots stay valid until released.
    pub fn close(&self) {
        let mut state = lock(&self.inner.state);
        state.closed = true;
        state.queue.clear();
    }

    fn activate(
        &self,
        state: &mut PoolState,
        session_id: SessionId,
        operation: OperationKind,
        user_id: Option<UserId>,
    ) {
        let timer = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let pool = Arc::downgrade(&self.inner);
            let id = session_id.clone();
            let deadline = Instant::now() + self.inner.config.session_timeout;
            handle
                .spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    force_release(pool, &id);
                })
                .abort_handle()
        });
        state.active.insert(
            session_id,
            ActiveSlot {
                operation,
                user_id,
                started: Instant::now(),
                timer,
            },
        );
    }

    fn promote_waiters(&self, state: &mut PoolState) {
        while state.active.len() < self.inner.config.max_concurrent_sessions {
            let Some(entry) = state.queue.pop_front() else {
                return;
            };
            if entry.promote.is_closed() {
                continue;
            }
            let session_id = entry.session_id.clone();
            self.activate(state, session_id.clone(), entry.operation, entry.user_id);
            if entry.promote.send(()).is_err() {
                // Waiter went away between the check and the send.
                if let Some(slot) = state.active.remove(&session_id) {
                    if let Some(timer) = slot.timer {
                        timer.abort();
                    }
                }
            }
        }
    }
}

fn force_release(pool: Weak<PoolInner>, session_id: &SessionId) {
    let Some(inner) = pool.upgrade() else { return };
    let pool = SessionPool { inner };
    let owner = lock(&pool.inner.state)
        .active
        .get(session_id)
        .map(|slot| slot.user_id.clone());
    if let Some(user_id) = owner {
        tracing::warn!(%session_id, user_id = ?user_id.as_ref().map(UserId::as_str), "session slot timed out; forcing release");
        pool.release(session_id);
    }
}

/// A queued [`SessionPool::acquire`] call.
///
/// Dropping it before the call settles withdraws the request: the queue entry
/// is removed, and a slot granted in the meantime is handed back.
struct Waiter<'a> {
    pool: &'a SessionPool,
    session_id: SessionId,
    promoted: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.promoted.close();
        if self.promoted.try_recv().is_ok() {
            tracing::debug!(session_id = %self.session_id, "acquire cancelled after promotion; returning slot");
            self.pool.release(&self.session_id);
            return;
        }
        let mut state = lock(&self.pool.inner.state);
        state.queue.retain(|e| e.session_id != self.session_id);
    }
}

/// A held pool slot that is released when dropped.
#[derive(Debug)]
pub struct SlotLease {
    pool: SessionPool,
    session_id: SessionId,
    released: bool,
}

impl SlotLease {
    /// Session id assigned to the slot.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Releases the slot now.
    pub fn release(mut self) {
        self.released = true;
        self.pool.release(&self.session_id);
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release(&self.session_id);
        }
    }
}
