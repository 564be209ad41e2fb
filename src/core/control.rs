//! Cooperative cancellation plus a commit gate arbitrating who owns the
//! job's output.
//!
//! A job only publishes its result (renaming the finished archive onto the
//! target, swapping a staged restore into place) inside [`JobControl::commit`].
//! Once [`JobControl::revoke`] has returned [`Revocation::Revoked`], no commit
//! can happen any more, no matter how long the worker keeps running.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::error::BackupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Open,
    Committed,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revocation {
    /// The job can no longer publish output.
    Revoked,
    /// The job had already published its output before the revocation.
    AlreadyCommitted,
}

#[derive(Clone, Debug)]
pub struct JobControl {
    token: CancellationToken,
    gate: Arc<Mutex<GateState>>,
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

impl JobControl {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            gate: Arc::new(Mutex::new(GateState::Open)),
        }
    }

    /// Request cancellation. Idempotent and non-blocking.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn checkpoint(&self) -> Result<(), BackupError> {
        if self.is_aborted() {
            return Err(BackupError::Cancelled);
        }
        Ok(())
    }

    /// Run the publishing step, unless the job was aborted or revoked first.
    ///
    /// The gate stays locked while `publish` runs, so a concurrent `revoke`
    /// waits for it and then reports `AlreadyCommitted`.
    pub fn commit<T>(
        &self,
        publish: impl FnOnce() -> Result<T, BackupError>,
    ) -> Result<T, BackupError> {
        let mut state = lock_gate(&self.gate);
        if *state == GateState::Revoked || self.is_aborted() {
            return Err(BackupError::Cancelled);
        }

        let value = publish()?;
        *state = GateState::Committed;
        Ok(value)
    }

    /// Cancel the job and close the gate. May block while a commit is in
    /// progress.
    pub fn revoke(&self) -> Revocation {
        self.token.cancel();

        let mut state = lock_gate(&self.gate);
        match *state {
            GateState::Committed => Revocation::AlreadyCommitted,
            GateState::Open | GateState::Revoked => {
                *state = GateState::Revoked;
                Revocation::Revoked
            }
        }
    }

    pub fn is_committed(&self) -> bool {
        *lock_gate(&self.gate) == GateState::Committed
    }
}

/// A panic while holding the gate must not wedge the controller, so poisoning
/// is recovered from.
fn lock_gate(gate: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    match gate.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("Commit gate mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
