//! Relocation guard shared by the catalog and every table manager.
//!
//! States: `Active -> InMigration -> Moved`, with a timeout edge back to
//! `Active` when the migration is never completed, and an orthogonal shutdown
//! flag that permanently disables the instance.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoordError, CoordResult};
use crate::types::DatabaseId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    Active,
    InMigration,
    Moved,
    Shutdown,
}

/// Point-in-time view of a migration state, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub phase: MigrationPhase,
    pub moved_location: Option<DatabaseId>,
}

#[derive(Debug, Default)]
struct Inner {
    has_moved: bool,
    moved_location: Option<DatabaseId>,
    in_migration: bool,
    migration_started: Option<Instant>,
    migration_target: Option<DatabaseId>,
    shutdown: bool,
}

/// Guard shared by one catalog or table manager instance.
#[derive(Debug)]
pub struct MigrationState {
    inner: Mutex<Inner>,
    timeout: Duration,
}

impl MigrationState {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            timeout,
        }
    }

    /// Guard run before every externally callable operation.
    ///
    /// An expired migration is reset to active and the current call still
    /// fails; the caller's retry then proceeds normally.
    pub fn check(&self) -> CoordResult<()> {
        let mut inner = self.inner.lock();
        Self::check_relocation_locked(&inner)?;
        if inner.in_migration {
            let expired = inner
                .migration_started
                .map(|started| started.elapsed() > self.timeout)
                .unwrap_or(true);
            if expired {
                tracing::warn!(
                    target_location = ?inner.migration_target,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "migration window expired without completion; resuming service"
                );
                inner.in_migration = false;
                inner.migration_started = None;
                inner.migration_target = None;
            }
            return Err(CoordError::MigrationInProgress);
        }
        Ok(())
    }

    /// Guard for operations that must keep working mid-migration (state export,
    /// completion): only moved and shut-down instances are rejected.
    pub fn check_relocation(&self) -> CoordResult<()> {
        let inner = self.inner.lock();
        Self::check_relocation_locked(&inner)
    }

    fn check_relocation_locked(inner: &Inner) -> CoordResult<()> {
        if inner.has_moved {
            return Err(CoordError::Moved {
                location: inner.moved_location.clone(),
            });
        }
        if inner.shutdown {
            return Err(CoordError::Shutdown);
        }
        Ok(())
    }

    pub fn prepare_for_migration(&self, new_location: &DatabaseId) -> CoordResult<()> {
        // Runs the full guard so that an expired migration is cleared first.
        self.check()?;
        let mut inner = self.inner.lock();
        inner.in_migration = true;
        inner.migration_started = Some(Instant::now());
        inner.migration_target = Some(new_location.clone());
        Ok(())
    }

    /// Back out of a prepared migration that cannot go ahead.
    pub fn abort_migration(&self) {
        let mut inner = self.inner.lock();
        if inner.in_migration {
            inner.in_migration = false;
            inner.migration_started = None;
            inner.migration_target = None;
        }
    }

    pub fn complete_migration(&self, new_location: &DatabaseId) -> CoordResult<()> {
        let mut inner = self.inner.lock();
        Self::check_relocation_locked(&inner)?;
        if !inner.in_migration {
            return Err(CoordError::InconsistentState(format!(
                "complete_migration to {new_location} without a prepared migration"
            )));
        }
        inner.in_migration = false;
        inner.migration_started = None;
        inner.migration_target = None;
        inner.has_moved = true;
        inner.moved_location = Some(new_location.clone());
        Ok(())
    }

    /// Permanently disable the instance. With `signal_moved`, callers observe
    /// `Moved` with no destination instead of `Shutdown`.
    pub fn shutdown(&self, signal_moved: bool) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        inner.in_migration = false;
        if signal_moved && !inner.has_moved {
            inner.has_moved = true;
            inner.moved_location = None;
        }
    }

    pub fn is_usable(&self) -> bool {
        let inner = self.inner.lock();
        !inner.has_moved && !inner.shutdown
    }

    pub fn status(&self) -> MigrationStatus {
        let inner = self.inner.lock();
        let phase = if inner.has_moved {
            MigrationPhase::Moved
        } else if inner.shutdown {
            MigrationPhase::Shutdown
        } else if inner.in_migration {
            MigrationPhase::InMigration
        } else {
            MigrationPhase::Active
        };
        MigrationStatus {
            phase,
            moved_location: inner.moved_location.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> DatabaseId {
        DatabaseId::new("127.0.0.1:7200", "b")
    }

    #[test]
    fn completed_migration_redirects_every_call() {
        let state = MigrationState::new(Duration::from_secs(10));
        state.check().expect("active");
        state.prepare_for_migration(&target()).expect("prepare");
        assert_eq!(state.check(), Err(CoordError::MigrationInProgress));
        state.check_relocation().expect("export still allowed");
        state.complete_migration(&target()).expect("complete");

        for _ in 0..3 {
            assert_eq!(
                state.check(),
                Err(CoordError::Moved {
                    location: Some(target())
                })
            );
        }
        assert_eq!(state.status().phase, MigrationPhase::Moved);
    }

    #[test]
    fn complete_without_prepare_is_rejected() {
        let state = MigrationState::new(Duration::from_secs(10));
        assert!(matches!(
            state.complete_migration(&target()),
            Err(CoordError::InconsistentState(_))
        ));
        state.check().expect("still active");
    }

    #[test]
    fn expired_migration_fails_once_then_resumes() {
        let state = MigrationState::new(Duration::from_millis(20));
        state.prepare_for_migration(&target()).expect("prepare");
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(state.check(), Err(CoordError::MigrationInProgress));
        assert_eq!(state.status().phase, MigrationPhase::Active);
        state.check().expect("resumed after timeout");
        assert!(state.complete_migration(&target()).is_err());
    }

    #[test]
    fn aborted_migration_resumes_service_immediately() {
        let state = MigrationState::new(Duration::from_secs(10));
        state.prepare_for_migration(&target()).expect("prepare");
        state.abort_migration();

        state.check().expect("active again");
        assert_eq!(state.status().phase, MigrationPhase::Active);
        assert!(matches!(
            state.complete_migration(&target()),
            Err(CoordError::InconsistentState(_))
        ));

        // Aborting after a completed move leaves the redirect in place.
        state.prepare_for_migration(&target()).expect("prepare again");
        state.complete_migration(&target()).expect("complete");
        state.abort_migration();
        assert_eq!(
            state.check(),
            Err(CoordError::Moved {
                location: Some(target())
            })
        );
    }

    #[test]
    fn shutdown_with_moved_signal_has_no_destination() {
        let state = MigrationState::new(Duration::from_secs(10));
        state.shutdown(true);
        assert_eq!(state.check(), Err(CoordError::Moved { location: None }));
        assert!(!state.is_usable());

        let plain = MigrationState::new(Duration::from_secs(10));
        plain.shutdown(false);
        assert_eq!(plain.check(), Err(CoordError::Shutdown));
        assert_eq!(plain.status().phase, MigrationPhase::Shutdown);
    }
}
