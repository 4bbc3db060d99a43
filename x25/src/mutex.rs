use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::PoisonError,
};

#[cfg(feature = "lock_tracking")]
mod tracking {
    use std::{
        collections::VecDeque,
        time::{Duration, Instant},
    };

    use tracing::warn;

    use super::*;

    #[derive(Debug)]
    struct Inner<T> {
        /// Most recent holders first
        holders: VecDeque<(&'static str, Duration)>,
        value: T,
    }

    /// A mutex that records who held it and for how long
    ///
    /// Waiting for or holding the lock for longer than [`SLOW`] is logged together with the
    /// recent holders.
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<Inner<T>>,
    }

    impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Debug::fmt(&self.inner, f)
        }
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(Inner {
                    holders: VecDeque::new(),
                    value,
                }),
            }
        }

        /// Acquire the lock, naming what it is needed for
        pub(crate) fn lock(&self, purpose: &'static str) -> MutexGuard<'_, T> {
            let requested = Instant::now();
            let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let acquired = Instant::now();
            let waited = acquired.duration_since(requested);
            if waited > SLOW {
                warn!(purpose, ?waited, holders = ?guard.holders, "slow lock acquisition");
            }
            MutexGuard {
                guard,
                acquired,
                purpose,
            }
        }
    }

    pub(crate) struct MutexGuard<'a, T> {
        guard: std::sync::MutexGuard<'a, Inner<T>>,
        acquired: Instant,
        purpose: &'static str,
    }

    impl<T> Drop for MutexGuard<'_, T> {
        fn drop(&mut self) {
            let held = self.acquired.elapsed();
            if held > SLOW {
                warn!(purpose = self.purpose, ?held, "lock held for too long");
            }
            let holders = &mut self.guard.holders;
            holders.truncate(MAX_HOLDERS - 1);
            holders.push_front((self.purpose, held));
        }
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.guard.value
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut T {
            &mut self.guard.value
        }
    }

    const SLOW: Duration = Duration::from_millis(1);
    const MAX_HOLDERS: usize = 20;
}

#[cfg(feature = "lock_tracking")]
pub(crate) use tracking::Mutex;

#[cfg(not(feature = "lock_tracking"))]
mod plain {
    use super::*;

    /// A mutex whose lock calls name their purpose, so that tracking can be switched on with
    /// the `lock_tracking` feature
    ///
    /// A panic while the lock is held does not poison it for other users.
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<T>,
    }

    impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Debug::fmt(&self.inner, f)
        }
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(value),
            }
        }

        pub(crate) fn lock(&self, _purpose: &'static str) -> MutexGuard<'_, T> {
            MutexGuard(self.inner.lock().unwrap_or_else(PoisonError::into_inner))
        }
    }

    pub(crate) struct MutexGuard<'a, T>(std::sync::MutexGuard<'a, T>);

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.0
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut T {
            &mut self.0
        }
    }
}

#[cfg(not(feature = "lock_tracking"))]
pub(crate) use plain::Mutex;
