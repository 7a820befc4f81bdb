// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Big kernel lock serialising syscall bodies
//! OWNERS: @kernel-sync-team
//! PUBLIC API: KernelLock::new(), lock(), try_lock(), with(), entries()
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: Syscall bodies run to completion under the lock; no nesting

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

/// Mutex around the whole kernel state.
///
/// Holding the guard is the only way to enter the kernel, so two callers never
/// observe each other's half-finished syscall.
pub struct KernelLock<T> {
    inner: spin::Mutex<T>,
    entries: AtomicU64,
}

impl<T> KernelLock<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: spin::Mutex::new(value), entries: AtomicU64::new(0) }
    }

    /// Spins until the kernel is free.
    pub fn lock(&self) -> KernelGuard<'_, T> {
        let guard = self.inner.lock();
        self.entries.fetch_add(1, Ordering::Relaxed);
        KernelGuard { guard }
    }

    pub fn try_lock(&self) -> Option<KernelGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        self.entries.fetch_add(1, Ordering::Relaxed);
        Some(KernelGuard { guard })
    }

    /// Runs `f` with the kernel held.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Times the lock has been taken.
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

pub struct KernelGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
}

impl<T> Deref for KernelGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for KernelGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
