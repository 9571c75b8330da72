//! Lock access that survives poisoning.
//!
//! The in-memory store and [`ManualClock`](super::clock::ManualClock) keep
//! serving after a panic in another task; each recovery is logged with the
//! owning component and operation.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn read_recovered<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(poisoned, source, op, "read"))
}

pub(crate) fn write_recovered<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(poisoned, source, op, "write"))
}

pub(crate) fn lock_recovered<'a, T>(
    lock: &'a Mutex<T>,
    source: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, source, op, "lock"))
}

fn recover<G>(
    poisoned: PoisonError<G>,
    source: &'static str,
    op: &'static str,
    access: &'static str,
) -> G {
    warn!(
        target = "postcache::cache::lock",
        source,
        op,
        access,
        "lock poisoned by a panicked holder; continuing with its last state"
    );
    poisoned.into_inner()
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn poisoned_tables_stay_readable_and_writable() {
        let tables = RwLock::new(vec![1_u32]);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let mut rows = tables.write().expect("first writer");
            rows.push(2);
            panic!("writer died mid-update");
        }));
        assert!(tables.is_poisoned());

        write_recovered(&tables, "test", "push").push(3);
        assert_eq!(*read_recovered(&tables, "test", "read"), vec![1, 2, 3]);
    }

    #[test]
    fn poisoned_mutex_keeps_its_value() {
        let now = Mutex::new(5_i64);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = now.lock().expect("first holder");
            panic!("holder died");
        }));

        *lock_recovered(&now, "test", "set") += 1;
        assert_eq!(*lock_recovered(&now, "test", "get"), 6);
    }
}
