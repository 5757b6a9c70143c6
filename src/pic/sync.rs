//! First-writer-wins claim protocol for lazily materialized slots.
//!
//! A slot holds either `NIL`, `PENDING` or a handle. The worker that moves a
//! slot from `NIL` to `PENDING` materializes the node and publishes its
//! handle; every other worker spins until the handle appears. Exactly one
//! node is ever allocated per slot.

use std::sync::atomic::{AtomicU32, Ordering};

use super::error::GridError;
use super::node::{NIL, PENDING};

/// Outcome of [`claim_or_follow`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Claim {
    /// This worker materialized the node.
    Created(u32),
    /// Another worker (or an earlier pass) already did.
    Existing(u32),
}

impl Claim {
    #[inline(always)]
    pub fn handle(self) -> u32 {
        match self {
            Claim::Created(h) | Claim::Existing(h) => h,
        }
    }
}

/// Resolve `slot` to a handle, materializing it with `make` if it is empty.
///
/// On failure the slot is reset to `NIL` so later writers can retry.
#[inline]
pub(crate) fn claim_or_follow<F>(slot: &AtomicU32, make: F) -> Result<Claim, GridError>
where
    F: FnOnce() -> Result<u32, GridError>,
{
    loop {
        match slot.load(Ordering::Acquire) {
            NIL => {
                if slot
                    .compare_exchange_weak(NIL, PENDING, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
            PENDING => std::hint::spin_loop(),
            handle => return Ok(Claim::Existing(handle)),
        }
    }

    match make() {
        Ok(handle) => {
            debug_assert!(handle != NIL && handle != PENDING);
            slot.store(handle, Ordering::Release);
            Ok(Claim::Created(handle))
        }
        Err(err) => {
            slot.store(NIL, Ordering::Release);
            Err(err)
        }
    }
}

/// Resolve `slot` without materializing anything.
#[inline(always)]
pub(crate) fn follow(slot: &AtomicU32) -> Option<u32> {
    match slot.load(Ordering::Acquire) {
        NIL | PENDING => None,
        handle => Some(handle),
    }
}

/// Atomic `f32` add on a word holding `f32` bits.
#[inline]
pub(crate) fn atomic_add_f32(word: &AtomicU32, value: f32) -> f32 {
    let mut current = word.load(Ordering::Relaxed);
    loop {
        let next = (f32::from_bits(current) + value).to_bits();
        match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return f32::from_bits(current),
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn first_claim_creates_and_later_claims_follow() {
        let slot = AtomicU32::new(NIL);
        assert_eq!(claim_or_follow(&slot, || Ok(7)), Ok(Claim::Created(7)));
        assert_eq!(claim_or_follow(&slot, || Ok(9)), Ok(Claim::Existing(7)));
        assert_eq!(follow(&slot), Some(7));
    }

    #[test]
    fn failed_materialization_releases_the_slot() {
        let slot = AtomicU32::new(NIL);
        let err = GridError::AllocatorExhausted {
            pool: "test",
            max_chunks: 0,
        };
        assert_eq!(claim_or_follow(&slot, || Err(err.clone())), Err(err));
        assert_eq!(slot.load(Ordering::Relaxed), NIL);
        assert_eq!(follow(&slot), None);
        assert_eq!(claim_or_follow(&slot, || Ok(3)), Ok(Claim::Created(3)));
    }

    #[test]
    fn racing_claims_materialize_once() {
        let slot = AtomicU32::new(NIL);
        let made = AtomicUsize::new(0);
        let handles: Vec<u32> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        claim_or_follow(&slot, || {
                            made.fetch_add(1, Ordering::Relaxed);
                            Ok(42)
                        })
                        .unwrap()
                        .handle()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert_eq!(made.load(Ordering::Relaxed), 1);
        assert!(handles.iter().all(|&h| h == 42));
    }

    #[test]
    fn float_add_accumulates_bits() {
        let word = AtomicU32::new(0f32.to_bits());
        atomic_add_f32(&word, 1.5);
        atomic_add_f32(&word, 2.0);
        assert_eq!(f32::from_bits(word.load(Ordering::Relaxed)), 3.5);
    }
}
