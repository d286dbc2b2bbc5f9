//! Scoped access to the ring inside a shared region.
//!
//! A guard holds the region's reader/writer lock (an advisory `flock` on the
//! named lock file) for as long as it lives and is the only way to reach the
//! [`RingStore`]. The lock is released when the guard drops, including during
//! unwinding, and the kernel releases it if the process dies while holding it.
//!
//! Every guard opens its own descriptor for the lock file. `flock` locks
//! belong to the open file description, so two guards in the same process
//! exclude each other the same way two processes do.

use std::fs::{File, OpenOptions};
use std::io;
use std::ops::{Deref, DerefMut};

use crate::error::{Error, Result};
use crate::region::{SegmentView, SharedRegion};
use crate::ring_store::RingStore;

/// Lock mode requested by a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Shared access: any number of readers at once.
#[derive(Debug)]
pub struct ReadGuard<'a> {
    lock: File,
    store: RingStore<SegmentView<'a>>,
}

/// Exclusive access: one writer, no readers.
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: File,
    store: RingStore<SegmentView<'a>>,
}

impl<'a> ReadGuard<'a> {
    /// Block until the shared lock is held, then open the store.
    pub fn acquire(
        region: &'a SharedRegion,
        lock_name: &str,
        registrant: &str,
        capacity: usize,
    ) -> Result<Self> {
        let lock = acquire_lock(region, lock_name, LockMode::Shared)?;
        let store = RingStore::open(region.segment(registrant)?, capacity)?;
        Ok(Self { lock, store })
    }
}

impl<'a> WriteGuard<'a> {
    /// Block until the exclusive lock is held, then open the store.
    pub fn acquire(
        region: &'a SharedRegion,
        lock_name: &str,
        registrant: &str,
        capacity: usize,
    ) -> Result<Self> {
        let lock = acquire_lock(region, lock_name, LockMode::Exclusive)?;
        let store = RingStore::open(region.segment(registrant)?, capacity)?;
        Ok(Self { lock, store })
    }
}

fn acquire_lock(region: &SharedRegion, lock_name: &str, mode: LockMode) -> Result<File> {
    let path = region.lock_path(lock_name)?;
    // No create: a missing lock file means the region was destroyed.
    let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("lock file {} is missing", path.display()),
            ))
        } else {
            Error::Io(e)
        }
    })?;
    match mode {
        LockMode::Shared => fs2::FileExt::lock_shared(&file)?,
        LockMode::Exclusive => fs2::FileExt::lock_exclusive(&file)?,
    }
    Ok(file)
}

impl<'a> Deref for ReadGuard<'a> {
    type Target = RingStore<SegmentView<'a>>;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

impl<'a> Deref for WriteGuard<'a> {
    type Target = RingStore<SegmentView<'a>>;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

impl DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.store
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.lock);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.lock);
    }
}
