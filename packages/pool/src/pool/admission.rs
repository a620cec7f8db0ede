// packages/pool/src/pool/admission.rs
//! Admission control: select-or-scale and the checkout/return protocol
//!
//! # Selection
//!
//! ```text
//! acquire
//!   ├─ 1. first instance (creation order) with a free slot ──▶ admitted
//!   ├─ 2. autoscale && |pool| < max ──▶ create instance ──▶ admitted
//!   └─ 3. least-loaded instance ──▶ wait on its semaphore ──▶ admitted
//! ```
//!
//! Steps 1 and 2 grab the permit without waiting while the bookkeeping lock is
//! held, so two callers can never both claim the last free slot. Step 2
//! re-runs step 1 once it owns the topology lock because a concurrent caller
//! may already have scaled.
//!
//! # Backpressure
//!
//! Step 3 is the saturation policy: when the pool is at its ceiling (or
//! autoscale is off) requests queue on the least-loaded instance instead of
//! being rejected. Latency grows with load; the hard per-instance cap does
//! not move. There is no pool-level timeout; callers wrap `acquire` in their
//! own deadline, and abandoning the wait consumes no permit.
//!
//! # Return
//!
//! A [`SessionLease`] releases its slot exactly once: explicitly through
//! [`SessionLease::finish`], or from `Drop` when the holder errors out, panics
//! or is cancelled. A dropped lease counts as a failed session.

use crate::driver::{ContextOf, EngineContext, EngineDriver, EngineSession, SessionOf, SessionOptions};
use crate::pool::identity::SessionHint;
use crate::pool::instance::WorkerInstance;
use crate::pool::manager::{PoolInner, PoolState};
use crate::pool::stats::publish_gauges;
use crate::utils::errors::{DriverError, PoolError, Result};
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// A slot granted on one instance, before a session is opened on it
pub(crate) struct Checkout<D: EngineDriver> {
    pub(crate) instance_id: u64,
    pub(crate) permit: OwnedSemaphorePermit,
    pub(crate) context: Arc<ContextOf<D>>,
}

/// Outcome of one selection pass
enum Selection<D: EngineDriver> {
    Admitted(Checkout<D>),
    Scale,
    Wait {
        instance_id: u64,
        semaphore: Arc<Semaphore>,
    },
    /// Not initialized; the close epoch decides whether to start it again
    Retry,
    Unavailable,
}

impl<D: EngineDriver> PoolState<D> {
    /// Step 1: first instance in creation order with a free slot
    pub(crate) fn admit_first_free(&mut self) -> Option<Checkout<D>> {
        let checkout = self.instances.iter_mut().find_map(|instance| {
            instance.try_admit().map(|permit| Checkout {
                instance_id: instance.id,
                permit,
                context: Arc::clone(&instance.context),
            })
        })?;

        self.record_started();
        Some(checkout)
    }

    /// Step 3 target. Ties go to the oldest instance.
    fn least_loaded(&self) -> Option<&WorkerInstance<D>> {
        self.instances.iter().min_by_key(|instance| instance.active_sessions)
    }

    fn record_started(&mut self) {
        let active = self.active_sessions();
        self.counters.record_started(active);
        publish_gauges(self.instances.len(), active);
    }
}

impl<D: EngineDriver> PoolInner<D> {
    fn select(&self) -> Selection<D> {
        let mut state = self.state.lock();

        if !state.initialized {
            return Selection::Retry;
        }
        if let Some(checkout) = state.admit_first_free() {
            return Selection::Admitted(checkout);
        }
        if self.config.autoscale && state.instances.len() < self.config.max_instances {
            return Selection::Scale;
        }

        match state.least_loaded() {
            Some(instance) => Selection::Wait {
                instance_id: instance.id,
                semaphore: Arc::clone(&instance.semaphore),
            },
            None => Selection::Unavailable,
        }
    }

    /// Obtain one admission slot, scaling or queuing as needed
    ///
    /// Callers still waiting when the pool is closed fail with
    /// [`PoolError::Closed`]; only acquires started after the close bring the
    /// pool back up.
    pub(crate) async fn checkout(self: &Arc<Self>) -> Result<Checkout<D>> {
        let epoch = self.close_epoch();

        loop {
            if self.close_epoch() != epoch {
                debug!("Pool closed while waiting for a session slot");
                return Err(PoolError::Closed);
            }
            self.ensure_initialized(epoch).await?;

            match self.select() {
                Selection::Admitted(checkout) => return Ok(checkout),
                Selection::Scale => {
                    if let Some(checkout) = self.scale_for_admission().await? {
                        return Ok(checkout);
                    }
                }
                Selection::Wait {
                    instance_id,
                    semaphore,
                } => {
                    if let Some(checkout) = self.wait_for_slot(instance_id, semaphore).await {
                        return Ok(checkout);
                    }
                }
                Selection::Retry => continue,
                Selection::Unavailable => {
                    return Err(PoolError::config(
                        "pool has no instances and autoscale is disabled; scale up first",
                    ))
                }
            }
        }
    }

    /// Step 2. `None` means another caller won the race; select again.
    async fn scale_for_admission(self: &Arc<Self>) -> Result<Option<Checkout<D>>> {
        let topology = self.topology.lock().await;

        {
            let mut state = self.state.lock();
            if !state.initialized {
                return Ok(None);
            }
            if let Some(checkout) = state.admit_first_free() {
                return Ok(Some(checkout));
            }
            if state.instances.len() >= self.config.max_instances {
                return Ok(None);
            }
        }

        let instance_id = self.create_instance(&topology).await?;
        debug!("Autoscaled: instance #{} created for a saturated pool", instance_id);

        let checkout = self.state.lock().admit_first_free();
        Ok(checkout)
    }

    /// Step 3. `None` means the instance was retired while we waited, by a
    /// scale-down, the reaper or `close()`.
    async fn wait_for_slot(
        &self,
        instance_id: u64,
        semaphore: Arc<Semaphore>,
    ) -> Option<Checkout<D>> {
        debug!("Pool saturated, queuing on instance #{}", instance_id);

        let permit = semaphore.acquire_owned().await.ok()?;

        let mut state = self.state.lock();
        let instance = state.instance_mut(instance_id)?;
        instance.admit();
        let context = Arc::clone(&instance.context);
        state.record_started();

        Some(Checkout {
            instance_id,
            permit,
            context,
        })
    }

    /// Return a slot. Bookkeeping and the permit release happen under the
    /// same lock so observers never see them disagree.
    pub(crate) fn release_slot(&self, instance_id: u64, permit: OwnedSemaphorePermit, ok: bool) {
        let mut state = self.state.lock();

        match state.instance_mut(instance_id) {
            Some(instance) => instance.release(),
            None => debug!("Instance #{} closed before its session was released", instance_id),
        }
        state.counters.record_completed(ok);
        drop(permit);

        publish_gauges(state.instances.len(), state.active_sessions());
        debug!("Released session slot on instance #{} (ok: {})", instance_id, ok);
    }

    /// Open a session, applying the hinted identity to it alone
    ///
    /// An identity the driver cannot honor is not fatal: the session falls
    /// back to the instance default and the fallback is counted.
    pub(crate) async fn open_session(
        &self,
        context: &ContextOf<D>,
        hint: Option<&SessionHint>,
    ) -> Result<SessionOf<D>> {
        let Some(identity) = hint.map(SessionHint::resolve) else {
            return context
                .new_session(&SessionOptions::default())
                .await
                .map_err(PoolError::Session);
        };

        match context.new_session(&SessionOptions::with_identity(identity)).await {
            Ok(session) => Ok(session),
            Err(DriverError::IdentityRejected(reason)) => {
                warn!("Session identity rejected ({}), using instance default", reason);
                self.state.lock().counters.record_identity_fallback();
                context
                    .new_session(&SessionOptions::default())
                    .await
                    .map_err(PoolError::Session)
            }
            Err(e) => Err(PoolError::Session(e)),
        }
    }
}

/// One admission slot, returned to its instance on drop
struct SlotGuard<D: EngineDriver> {
    pool: Arc<PoolInner<D>>,
    instance_id: u64,
    permit: Option<OwnedSemaphorePermit>,
}

impl<D: EngineDriver> SlotGuard<D> {
    fn release(&mut self, ok: bool) {
        if let Some(permit) = self.permit.take() {
            self.pool.release_slot(self.instance_id, permit, ok);
        }
    }
}

impl<D: EngineDriver> Drop for SlotGuard<D> {
    fn drop(&mut self) {
        self.release(false);
    }
}

/// A checked-out session
///
/// Dereferences to the driver's session type. Call [`finish`](Self::finish)
/// to report the outcome; dropping the lease instead releases the slot as a
/// failure and closes the session in the background.
pub struct SessionLease<D: EngineDriver> {
    slot: SlotGuard<D>,
    session: Arc<SessionOf<D>>,
    finished: bool,
}

impl<D: EngineDriver> SessionLease<D> {
    pub(crate) async fn open(pool: &Arc<PoolInner<D>>, hint: Option<&SessionHint>) -> Result<Self> {
        let checkout = pool.checkout().await?;
        let slot = SlotGuard {
            pool: Arc::clone(pool),
            instance_id: checkout.instance_id,
            permit: Some(checkout.permit),
        };

        // On error `slot` drops here and the slot is returned as a failure
        let session = pool.open_session(&checkout.context, hint).await?;
        debug!(
            "Session {} checked out on instance #{}",
            session.id(),
            checkout.instance_id
        );

        Ok(Self {
            slot,
            session: Arc::new(session),
            finished: false,
        })
    }

    /// Instance hosting this session
    pub fn instance_id(&self) -> u64 {
        self.slot.instance_id
    }

    pub fn session(&self) -> &SessionOf<D> {
        &self.session
    }

    /// Shared handle to the session, for bodies that outlive a borrow
    pub fn shared_session(&self) -> Arc<SessionOf<D>> {
        Arc::clone(&self.session)
    }

    /// Close the session and release the slot, recording the outcome
    pub async fn finish(mut self, ok: bool) {
        self.finished = true;
        if let Err(e) = self.session.close().await {
            warn!("Failed to close session {}: {}", self.session.id(), e);
        }
        self.slot.release(ok);
    }
}

impl<D: EngineDriver> Deref for SessionLease<D> {
    type Target = SessionOf<D>;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl<D: EngineDriver> Drop for SessionLease<D> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        // The slot itself is released synchronously by `SlotGuard`
        let session = Arc::clone(&self.session);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = session.close().await {
                    warn!("Failed to close abandoned session {}: {}", session.id(), e);
                }
            });
        }
    }
}
