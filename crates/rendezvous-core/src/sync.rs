//! Guarded critical sections.
//!
//! Each identity keeps its mutable state in a few independent sections
//! (rendezvous state, binding table, outstanding punches, re-bind status).
//! No code path may hold two of them at once. [`StateLock`] enforces this in
//! debug builds by tracking the section held by the current thread. Guards
//! are `!Send`, so they can never be held across an `.await` inside a spawned
//! task either.

use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};

#[cfg(debug_assertions)]
use std::cell::Cell;

#[cfg(debug_assertions)]
thread_local! {
    static HELD: Cell<Option<&'static str>> = const { Cell::new(None) };
}

/// A named mutex that participates in the one-section-at-a-time check
pub(crate) struct StateLock<T> {
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> StateLock<T> {
    pub(crate) const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: Mutex::new(value),
        }
    }

    /// Acquire the section
    ///
    /// Panics in debug builds if the thread already holds another section.
    pub(crate) fn lock(&self) -> StateGuard<'_, T> {
        #[cfg(debug_assertions)]
        HELD.with(|held| {
            if let Some(other) = held.get() {
                panic!(
                    "lock discipline violated: `{}` acquired while holding `{other}`",
                    self.name
                );
            }
            held.set(Some(self.name));
        });

        StateGuard {
            guard: self.inner.lock(),
        }
    }
}

pub(crate) struct StateGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> Drop for StateGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        HELD.with(|held| held.set(None));
    }
}

impl<T> Deref for StateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for StateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_sections() {
        let a = StateLock::new("state", 1u32);
        let b = StateLock::new("bindings", 2u32);

        {
            let mut guard = a.lock();
            *guard += 1;
        }
        {
            let guard = b.lock();
            assert_eq!(*guard, 2);
        }
        assert_eq!(*a.lock(), 2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock discipline violated")]
    fn test_nested_sections_rejected() {
        let a = StateLock::new("state", ());
        let b = StateLock::new("punches", ());

        let _outer = a.lock();
        let _inner = b.lock();
    }

    #[test]
    fn test_sections_on_other_threads_are_independent() {
        let a = std::sync::Arc::new(StateLock::new("state", 0u32));
        let b = StateLock::new("bindings", 0u32);

        let _guard = b.lock();
        let a2 = a.clone();
        std::thread::spawn(move || {
            *a2.lock() += 1;
        })
        .join()
        .unwrap();
        drop(_guard);

        assert_eq!(*a.lock(), 1);
    }
}
