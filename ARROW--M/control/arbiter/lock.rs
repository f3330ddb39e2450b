use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::AuthorizationError;

/// Teacher override that blocks pilot acquisition.
///
/// Engaging the lock only flips the flag; clearing the current pilot and
/// stopping the robot is done by the service that owns both.
#[derive(Debug, Default)]
pub struct SystemLock {
    engaged: AtomicBool,
}

impl SystemLock {
    /// Creates a disengaged lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            engaged: AtomicBool::new(false),
        }
    }

    /// Sets the flag, returning the previous value.
    pub fn set_locked(&self, locked: bool, teacher: bool) -> Result<bool, AuthorizationError> {
        if !teacher {
            return Err(AuthorizationError::NotTeacher);
        }
        Ok(self.engaged.swap(locked, Ordering::SeqCst))
    }

    /// Whether the lock is engaged.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_teacher_toggles() {
        let lock = SystemLock::new();
        assert_eq!(
            lock.set_locked(true, false),
            Err(AuthorizationError::NotTeacher)
        );
        assert!(!lock.is_locked());
        assert_eq!(lock.set_locked(true, true), Ok(false));
        assert!(lock.is_locked());
        assert_eq!(lock.set_locked(false, true), Ok(true));
    }
}
