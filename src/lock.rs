//! Reader/writer lock packed into a single atomic word.
//!
//! Acquisition spins a bounded number of times and yields between attempts.
//! Running out of attempts is reported as [`FsError::LockTimeout`] instead of
//! blocking forever.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use crate::error::{FsError, Result};

/// Bit layout of the lock word.
/// - bits 0..8: active readers
/// - bit 8: writer flag
/// - bits 16..32: owner id of the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWord(u32);

impl LockWord {
    const READERS_MASK: u32 = 0xFF;
    const WRITER_BIT: u32 = 1 << 8;
    const OWNER_SHIFT: u32 = 16;

    pub const UNLOCKED: Self = Self(0);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn readers(self) -> u32 {
        self.0 & Self::READERS_MASK
    }

    pub fn writer(self) -> bool {
        self.0 & Self::WRITER_BIT != 0
    }

    pub fn owner(self) -> u16 {
        (self.0 >> Self::OWNER_SHIFT) as u16
    }

    pub fn with_readers(self, readers: u32) -> Self {
        Self((self.0 & !Self::READERS_MASK) | (readers & Self::READERS_MASK))
    }

    pub fn with_writer(self, owner: u16) -> Self {
        Self((self.0 & Self::READERS_MASK) | Self::WRITER_BIT | ((owner as u32) << Self::OWNER_SHIFT))
    }

    pub fn without_writer(self) -> Self {
        Self(self.0 & Self::READERS_MASK)
    }
}

static NEXT_OWNER: AtomicU16 = AtomicU16::new(1);

thread_local! {
    static OWNER_ID: u16 = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
}

/// Small per-thread id stamped into the lock word by writers.
pub fn current_owner() -> u16 {
    OWNER_ID.with(|id| *id)
}

#[derive(Debug)]
pub struct RawLock {
    word: AtomicU32,
    retries: u32,
}

impl RawLock {
    pub fn new(retries: u32) -> Self {
        Self {
            word: AtomicU32::new(LockWord::UNLOCKED.bits()),
            retries: retries.max(1),
        }
    }

    pub fn state(&self) -> LockWord {
        LockWord::from_bits(self.word.load(Ordering::Acquire))
    }

    fn acquire(&self, next: impl Fn(LockWord) -> Option<LockWord>) -> Result<()> {
        for _ in 0..self.retries {
            let current = self.state();
            if let Some(wanted) = next(current) {
                if self
                    .word
                    .compare_exchange_weak(current.bits(), wanted.bits(), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(());
                }
            }
            std::thread::yield_now();
        }
        Err(FsError::LockTimeout)
    }

    pub fn lock_read(&self) -> Result<()> {
        self.acquire(|w| {
            if w.writer() || w.readers() == LockWord::READERS_MASK {
                None
            } else {
                Some(w.with_readers(w.readers() + 1))
            }
        })
    }

    pub fn unlock_read(&self) {
        let _ = self.word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            let w = LockWord::from_bits(bits);
            Some(w.with_readers(w.readers().saturating_sub(1)).bits())
        });
    }

    pub fn lock_write(&self) -> Result<()> {
        let owner = current_owner();
        self.acquire(|w| {
            if w.writer() || w.readers() != 0 {
                None
            } else {
                Some(w.with_writer(owner))
            }
        })
    }

    pub fn unlock_write(&self) {
        let _ = self.word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            Some(LockWord::from_bits(bits).without_writer().bits())
        });
    }
}

/// Data guarded by a [`RawLock`].
#[derive(Debug)]
pub struct Locked<T> {
    raw: RawLock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` only happens through guards that hold the raw lock.
unsafe impl<T: Send> Send for Locked<T> {}
unsafe impl<T: Send + Sync> Sync for Locked<T> {}

impl<T> Locked<T> {
    pub fn new(data: T, retries: u32) -> Self {
        Self {
            raw: RawLock::new(retries),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> Result<ReadGuard<'_, T>> {
        self.raw.lock_read()?;
        Ok(ReadGuard { lock: self })
    }

    pub fn write(&self) -> Result<WriteGuard<'_, T>> {
        self.raw.lock_write()?;
        Ok(WriteGuard { lock: self })
    }

    pub fn state(&self) -> LockWord {
        self.raw.state()
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a Locked<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: shared access while the read lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_read();
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a Locked<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: exclusive access while the write lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: exclusive access while the write lock is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_write();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_word_fields() {
        let w = LockWord::UNLOCKED.with_readers(3);
        assert_eq!(w.readers(), 3);
        assert!(!w.writer());
        let w = LockWord::UNLOCKED.with_writer(0xBEEF);
        assert!(w.writer());
        assert_eq!(w.owner(), 0xBEEF);
        assert_eq!(w.without_writer(), LockWord::UNLOCKED);
    }

    #[test]
    fn test_readers_share() {
        let locked = Locked::new(7u32, 16);
        let a = locked.read().unwrap();
        let b = locked.read().unwrap();
        assert_eq!(*a + *b, 14);
        assert_eq!(locked.state().readers(), 2);
        drop(a);
        drop(b);
        assert_eq!(locked.state(), LockWord::UNLOCKED);
    }

    #[test]
    fn test_writer_excludes_and_times_out() {
        let locked = Locked::new(0u32, 8);
        let mut guard = locked.write().unwrap();
        *guard = 5;
        assert_eq!(locked.state().owner(), current_owner());
        assert_eq!(locked.read().err(), Some(FsError::LockTimeout));
        assert_eq!(locked.write().err(), Some(FsError::LockTimeout));
        drop(guard);
        assert_eq!(*locked.read().unwrap(), 5);
    }

    #[test]
    fn test_reader_blocks_writer() {
        let locked = Locked::new((), 8);
        let _r = locked.read().unwrap();
        assert_eq!(locked.write().err(), Some(FsError::LockTimeout));
    }

    #[test]
    fn test_concurrent_increments() {
        let locked = Arc::new(Locked::new(0u64, u32::MAX));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locked = Arc::clone(&locked);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *locked.write().unwrap() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*locked.read().unwrap(), 4000);
    }
}
