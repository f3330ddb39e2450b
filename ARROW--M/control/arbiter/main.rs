//! Exclusive pilot control.

/// Teacher system lock.
pub mod lock;

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use lock::SystemLock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::AuthorizationError;

/// Opaque session identity supplied by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrowed form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity passed into every control call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// Session making the request.
    pub session: SessionId,
    /// Whether the session carries teacher privileges.
    pub teacher: bool,
}

impl Caller {
    /// Regular session.
    #[must_use]
    pub fn pilot(session: impl Into<String>) -> Self {
        Self {
            session: SessionId::new(session),
            teacher: false,
        }
    }

    /// Teacher-privileged session.
    #[must_use]
    pub fn teacher(session: impl Into<String>) -> Self {
        Self {
            session: SessionId::new(session),
            teacher: true,
        }
    }
}

/// Active pilot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PilotSession {
    /// Owning session.
    pub session: SessionId,
    /// Last accepted request from the pilot.
    pub last_seen: Instant,
}

/// Result of a successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Control changed hands.
    Acquired,
    /// Caller already held control.
    AlreadyHeld,
}

/// Single-owner control lock: `Unowned` or `OwnedBy(session)`.
///
/// The system lock flag is read while the owner mutex is held, so an
/// acquisition cannot slip in between engaging the lock and clearing the
/// pilot.
#[derive(Debug, Clone)]
pub struct PilotArbiter {
    owner: Arc<Mutex<Option<PilotSession>>>,
    system_lock: Arc<SystemLock>,
}

impl PilotArbiter {
    /// Creates an unowned arbiter consulting `system_lock`.
    #[must_use]
    pub fn new(system_lock: Arc<SystemLock>) -> Self {
        Self {
            owner: Arc::new(Mutex::new(None)),
            system_lock,
        }
    }

    /// Claims control for `caller`.
    pub fn acquire(
        &self,
        caller: &Caller,
        now: Instant,
    ) -> Result<AcquireOutcome, AuthorizationError> {
        let mut owner = self.owner.lock();
        if let Some(current) = owner.as_mut() {
            if current.session != caller.session {
                return Err(AuthorizationError::AlreadyControlled {
                    owner: current.session.to_string(),
                });
            }
        }
        if self.system_lock.is_locked() && !caller.teacher {
            return Err(AuthorizationError::SystemLocked);
        }
        if let Some(current) = owner.as_mut() {
            current.last_seen = now;
            return Ok(AcquireOutcome::AlreadyHeld);
        }
        *owner = Some(PilotSession {
            session: caller.session.clone(),
            last_seen: now,
        });
        Ok(AcquireOutcome::Acquired)
    }

    /// Gives up control if `session` holds it.
    pub fn release(&self, session: &SessionId) -> Result<(), AuthorizationError> {
        let mut owner = self.owner.lock();
        match owner.as_ref() {
            Some(current) if &current.session == session => {
                *owner = None;
                Ok(())
            }
            _ => Err(AuthorizationError::NotPilot),
        }
    }

    /// Clears control unconditionally, returning the evicted session.
    pub fn force_release(&self) -> Option<SessionId> {
        self.owner.lock().take().map(|pilot| pilot.session)
    }

    /// Whether `session` currently holds control.
    #[must_use]
    pub fn is_pilot(&self, session: &SessionId) -> bool {
        self.owner
            .lock()
            .as_ref()
            .is_some_and(|current| &current.session == session)
    }

    /// Current pilot, if any.
    #[must_use]
    pub fn current(&self) -> Option<PilotSession> {
        self.owner.lock().clone()
    }

    /// Records activity from the pilot. Returns `false` if `session` is not
    /// the pilot.
    pub fn touch(&self, session: &SessionId, now: Instant) -> bool {
        match self.owner.lock().as_mut() {
            Some(current) if &current.session == session => {
                current.last_seen = now;
                true
            }
            _ => false,
        }
    }

    /// Releases a pilot idle for longer than `timeout`.
    pub fn expire_idle(&self, now: Instant, timeout: Duration) -> Option<SessionId> {
        let mut owner = self.owner.lock();
        let expired = owner
            .as_ref()
            .is_some_and(|current| now.saturating_duration_since(current.last_seen) > timeout);
        if expired {
            owner.take().map(|pilot| pilot.session)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbiter() -> PilotArbiter {
        PilotArbiter::new(Arc::new(SystemLock::new()))
    }

    #[test]
    fn control_is_exclusive() {
        let arbiter = arbiter();
        let now = Instant::now();
        let a = Caller::pilot("a");
        let b = Caller::pilot("b");
        assert_eq!(arbiter.acquire(&a, now), Ok(AcquireOutcome::Acquired));
        assert_eq!(
            arbiter.acquire(&b, now),
            Err(AuthorizationError::AlreadyControlled { owner: "a".into() })
        );
        assert_eq!(arbiter.acquire(&a, now), Ok(AcquireOutcome::AlreadyHeld));
        arbiter.release(&a.session).unwrap();
        assert_eq!(arbiter.acquire(&b, now), Ok(AcquireOutcome::Acquired));
        assert!(arbiter.is_pilot(&b.session));
        assert!(!arbiter.is_pilot(&a.session));
    }

    #[test]
    fn release_requires_ownership() {
        let arbiter = arbiter();
        let now = Instant::now();
        arbiter.acquire(&Caller::pilot("a"), now).unwrap();
        assert_eq!(
            arbiter.release(&SessionId::new("b")),
            Err(AuthorizationError::NotPilot)
        );
        assert!(arbiter.current().is_some());
    }

    #[test]
    fn lock_blocks_non_teacher_even_when_unowned() {
        let lock = Arc::new(SystemLock::new());
        let arbiter = PilotArbiter::new(Arc::clone(&lock));
        lock.set_locked(true, true).unwrap();
        assert_eq!(
            arbiter.acquire(&Caller::pilot("a"), Instant::now()),
            Err(AuthorizationError::SystemLocked)
        );
        assert!(arbiter.current().is_none());
        assert_eq!(
            arbiter.acquire(&Caller::teacher("t"), Instant::now()),
            Ok(AcquireOutcome::Acquired)
        );
    }

    #[test]
    fn force_release_returns_evicted() {
        let arbiter = arbiter();
        arbiter.acquire(&Caller::pilot("a"), Instant::now()).unwrap();
        assert_eq!(arbiter.force_release(), Some(SessionId::new("a")));
        assert_eq!(arbiter.force_release(), None);
    }

    #[test]
    fn idle_pilot_expires() {
        let arbiter = arbiter();
        let start = Instant::now();
        let a = Caller::pilot("a");
        arbiter.acquire(&a, start).unwrap();
        assert!(arbiter.touch(&a.session, start + Duration::from_secs(5)));
        assert_eq!(
            arbiter.expire_idle(start + Duration::from_secs(20), Duration::from_secs(30)),
            None
        );
        assert_eq!(
            arbiter.expire_idle(start + Duration::from_secs(40), Duration::from_secs(30)),
            Some(SessionId::new("a"))
        );
    }
}
