// Cross-core spinlock over a single shared word.
// No owner or recursion tracking: acquiring it twice from one core deadlocks.

use crossbeam_utils::Backoff;
use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicU32, Ordering};

pub const UNLOCKED: u32 = 0;
pub const LOCKED: u32 = 1;

/// Architecture-specific way of flipping the lock word.
pub trait LockStrategy {
    /// One attempt to move the word from `UNLOCKED` to `LOCKED`.
    fn try_acquire(word: &AtomicU32) -> bool;

    /// Store `UNLOCKED` so that every write made while holding the lock is visible first.
    fn release(word: &AtomicU32);
}

/// Single strong compare-and-swap, for cores with a native CAS instruction.
pub struct CasStrategy;

impl LockStrategy for CasStrategy {
    #[inline]
    fn try_acquire(word: &AtomicU32) -> bool {
        word.compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn release(word: &AtomicU32) {
        word.store(UNLOCKED, Ordering::Release);
    }
}

/// Load-linked/store-conditional shape: a weak exchange bracketed by full barriers.
pub struct LlscStrategy;

impl LockStrategy for LlscStrategy {
    #[inline]
    fn try_acquire(word: &AtomicU32) -> bool {
        fence(Ordering::SeqCst);
        let won = word
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok();
        fence(Ordering::SeqCst);
        won
    }

    #[inline]
    fn release(word: &AtomicU32) {
        fence(Ordering::SeqCst);
        word.store(UNLOCKED, Ordering::Relaxed);
    }
}

#[cfg(not(feature = "llsc"))]
pub type DefaultStrategy = CasStrategy;
#[cfg(feature = "llsc")]
pub type DefaultStrategy = LlscStrategy;

/// Local interrupt control of the calling core.
///
/// The lock masks local interrupts before spinning so the core cannot deadlock
/// against its own interrupt handler, and restores the previous state after unlocking.
pub trait InterruptMask: Send + Sync {
    /// Mask local interrupts, returning whether they were enabled.
    fn disable(&self) -> bool;

    /// Restore the state returned by `disable`.
    fn restore(&self, was_enabled: bool);
}

/// Hosted cores have no interrupt controller to mask.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInterruptMask;

impl InterruptMask for NoInterruptMask {
    fn disable(&self) -> bool {
        false
    }

    fn restore(&self, _was_enabled: bool) {}
}

pub struct SpinLock<'a, S: LockStrategy = DefaultStrategy> {
    word: &'a AtomicU32,
    mask: &'a dyn InterruptMask,
    _strategy: PhantomData<S>,
}

impl<'a, S: LockStrategy> SpinLock<'a, S> {
    pub fn new(word: &'a AtomicU32, mask: &'a dyn InterruptMask) -> Self {
        Self {
            word,
            mask,
            _strategy: PhantomData,
        }
    }

    /// Spin until the word is ours.
    pub fn lock(self) -> SpinGuard<'a, S> {
        let irq_was_enabled = self.mask.disable();
        let backoff = Backoff::new();
        while !S::try_acquire(self.word) {
            // Spin on a plain load until the holder lets go, then retry the exchange
            while self.word.load(Ordering::Relaxed) != UNLOCKED {
                backoff.snooze();
            }
        }
        SpinGuard {
            word: self.word,
            mask: self.mask,
            irq_was_enabled,
            _strategy: PhantomData,
        }
    }

    /// One attempt; interrupts are left as they were on failure.
    pub fn try_lock(self) -> Option<SpinGuard<'a, S>> {
        let irq_was_enabled = self.mask.disable();
        if S::try_acquire(self.word) {
            Some(SpinGuard {
                word: self.word,
                mask: self.mask,
                irq_was_enabled,
                _strategy: PhantomData,
            })
        } else {
            self.mask.restore(irq_was_enabled);
            None
        }
    }
}

/// Held lock. Dropping it unlocks and then restores local interrupts.
pub struct SpinGuard<'a, S: LockStrategy = DefaultStrategy> {
    word: &'a AtomicU32,
    mask: &'a dyn InterruptMask,
    irq_was_enabled: bool,
    _strategy: PhantomData<S>,
}

impl<S: LockStrategy> Drop for SpinGuard<'_, S> {
    fn drop(&mut self) {
        S::release(self.word);
        self.mask.restore(self.irq_was_enabled);
    }
}

/// Whether some core currently holds the word.
pub fn is_locked(word: &AtomicU32) -> bool {
    word.load(Ordering::Relaxed) != UNLOCKED
}
