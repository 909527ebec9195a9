//! Three-tier wait on a writer's state word.
//!
//! Handoffs between leader and followers are usually sub-microsecond, so a
//! waiter first spins with a pause hint, then — if a per-call-site credit
//! says it has been paying off — yields cooperatively for up to a bounded
//! budget, and only then parks on a lazily-built mutex/condvar. On a
//! server with syscall auditing the round trip from `FUTEX_WAKE` back out
//! of `FUTEX_WAIT` runs several microseconds, which dwarfs the handoff
//! itself; the middle tier exists to catch exactly the waits that are too
//! long to spin through but too short to be worth that round trip.
//!
//! The credit is a signed integer with hysteresis, updated only on sampled
//! runs (1 in 256) or right after the yield tier gives up: exponential
//! decay by 1/1024 plus ±2¹⁷ depending on whether the yield succeeded.
//! With that step the magnitude never exceeds 2²⁷, safely inside `i32`.
//! Updates are load/store without atomicity; a lost sample is noise.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::metrics;
use crate::slot::{ParkState, WriterSlot, STATE_LOCKED_WAITING};

/// Spin iterations before the first clock read. On current cores each
/// pause-hinted iteration runs a handful of nanoseconds, so 200 of them
/// cover roughly a microsecond.
const SPIN_TRIES: u32 = 200;

/// Consecutive slow yields tolerated before falling through to blocking.
/// A solitary slow yield is common (a small job was runnable); several in
/// a row mean the core is genuinely contended.
const MAX_SLOW_YIELDS_WHILE_SPINNING: usize = 3;

/// Sampling base for credit updates: one run in this many updates the
/// credit even when it is negative.
const SAMPLING_BASE: u32 = 256;

/// Credit step, 2^17. Combined with the 1/1024 decay the credit is
/// bounded by 2^27.
const CREDIT_STEP: i32 = 1 << 17;

/// Per-call-site adaptation state for the yield tier.
///
/// Each await site owns one of these with static lifetime; distinct sites
/// see very different handoff latencies (a join waits for a whole commit,
/// a parallel completion for a few inserts) and must not share a credit.
pub struct AdaptationContext {
    name: &'static str,
    credit: AtomicI32,
}

impl AdaptationContext {
    /// A fresh context with zero credit.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            credit: AtomicI32::new(0),
        }
    }

    /// Call-site label (diagnostics).
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Current credit (diagnostics).
    #[must_use]
    pub fn credit(&self) -> i32 {
        self.credit.load(Ordering::Relaxed)
    }
}

/// Resolved yield-tier thresholds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct YieldPolicy {
    /// Yield budget in microseconds; 0 disables the tier.
    pub(crate) max_yield_usec: u64,
    /// A single yield slower than this counts toward abandoning the tier.
    pub(crate) slow_yield_usec: u64,
}

/// Block until `state & goal_mask != 0`, returning the observed state.
pub(crate) fn await_state(
    slot: &WriterSlot,
    goal_mask: u8,
    ctx: &AdaptationContext,
    policy: &YieldPolicy,
) -> u8 {
    let mut state = 0;
    for _ in 0..SPIN_TRIES {
        state = slot.state.load(Ordering::Acquire);
        if state & goal_mask != 0 {
            return state;
        }
        // Keeps the pipeline clear of speculative loads so the producer's
        // store is not penalized by a reorder flush.
        std::hint::spin_loop();
    }

    let mut update_ctx = false;
    let mut would_spin_again = false;

    if policy.max_yield_usec > 0 {
        update_ctx = rand::thread_rng().gen_ratio(1, SAMPLING_BASE);
        if update_ctx || ctx.credit.load(Ordering::Relaxed) >= 0 {
            // Either we are probing, or yielding has better-than-even odds
            // of beating the budget here.
            let spin_begin = Instant::now();
            let mut iter_begin = spin_begin;
            let mut slow_yield_count = 0;
            let max_yield = Duration::from_micros(policy.max_yield_usec);
            let slow_yield = Duration::from_micros(policy.slow_yield_usec);

            while iter_begin.duration_since(spin_begin) <= max_yield {
                std::thread::yield_now();

                state = slot.state.load(Ordering::Acquire);
                if state & goal_mask != 0 {
                    would_spin_again = true;
                    metrics::record_yield_success();
                    break;
                }

                let now = Instant::now();
                if now == iter_begin || now.duration_since(iter_begin) >= slow_yield {
                    // A clock too coarse to time the yield counts as slow.
                    slow_yield_count += 1;
                    if slow_yield_count >= MAX_SLOW_YIELDS_WHILE_SPINNING {
                        // Several involuntary switches in a row; stop
                        // burning the budget and record the verdict now.
                        update_ctx = true;
                        break;
                    }
                }
                iter_begin = now;
            }
        }
    }

    if state & goal_mask == 0 {
        state = blocking_await_state(slot, goal_mask);
    }

    if update_ctx {
        // Sampled, racy on purpose; concurrent updates may clobber each
        // other.
        let v = ctx.credit.load(Ordering::Relaxed);
        let delta = if would_spin_again {
            CREDIT_STEP
        } else {
            -CREDIT_STEP
        };
        ctx.credit.store(v - v / 1024 + delta, Ordering::Relaxed);
        tracing::trace!(
            target: "loam.write",
            site = ctx.name,
            credit = v - v / 1024 + delta,
            rewarded = would_spin_again,
            "yield credit updated"
        );
    }

    debug_assert_ne!(state & goal_mask, 0);
    state
}

/// The blocking tier: advertise `LOCKED_WAITING` and park.
fn blocking_await_state(slot: &WriterSlot, goal_mask: u8) -> u8 {
    // Build the mutex before advertising it; the CAS into LOCKED_WAITING
    // is what licenses a waker to touch it.
    let park = slot.park.get_or_init(ParkState::default);

    let mut state = slot.state.load(Ordering::Acquire);
    debug_assert_ne!(state, STATE_LOCKED_WAITING);
    if state & goal_mask == 0 {
        match slot.state.compare_exchange(
            state,
            STATE_LOCKED_WAITING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                metrics::record_blocking_wait();
                let mut guard = park.mu.lock();
                while slot.state.load(Ordering::Relaxed) == STATE_LOCKED_WAITING {
                    park.cv.wait(&mut guard);
                }
                state = slot.state.load(Ordering::Acquire);
            }
            // The waker got there first; the CAS handed us the new state,
            // and a state change can only mean the goal was met.
            Err(actual) => state = actual,
        }
    }
    debug_assert_ne!(state & goal_mask, 0);
    state
}

/// Publish `new_state` and wake the writer if it parked.
///
/// The waker touches the writer's mutex only when the waiter has
/// advertised it by installing `LOCKED_WAITING`; on the common path the
/// handoff is a single CAS.
pub(crate) fn set_state(slot: &WriterSlot, new_state: u8) {
    let state = slot.state.load(Ordering::Acquire);
    if state == STATE_LOCKED_WAITING
        || slot
            .state
            .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
    {
        // The only transition that can race a waker is the waiter
        // installing LOCKED_WAITING.
        let park = slot
            .park
            .get()
            .expect("writer in LOCKED_WAITING must have built its park state");
        let _guard = park.mu.lock();
        debug_assert_eq!(slot.state.load(Ordering::Relaxed), STATE_LOCKED_WAITING);
        slot.state.store(new_state, Ordering::Release);
        park.cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::{SlotPool, STATE_COMPLETED, STATE_GROUP_LEADER, STATE_INIT};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn policy() -> YieldPolicy {
        YieldPolicy {
            max_yield_usec: 100,
            slow_yield_usec: 3,
        }
    }

    #[test]
    fn goal_already_met_returns_in_spin_tier() {
        static CTX: AdaptationContext = AdaptationContext::new("test_spin");
        let pool = SlotPool::new(1);
        let idx = pool.claim();
        let slot = pool.slot(idx);
        slot.state.store(STATE_COMPLETED, Ordering::Release);
        let got = await_state(slot, STATE_COMPLETED, &CTX, &policy());
        assert_eq!(got, STATE_COMPLETED);
        // The blocking tier was never entered, so no park state exists.
        assert!(slot.park.get().is_none());
    }

    #[test]
    fn mask_matches_any_goal_bit() {
        static CTX: AdaptationContext = AdaptationContext::new("test_mask");
        let pool = SlotPool::new(1);
        let idx = pool.claim();
        let slot = pool.slot(idx);
        slot.state.store(STATE_GROUP_LEADER, Ordering::Release);
        let got = await_state(
            slot,
            STATE_GROUP_LEADER | STATE_COMPLETED,
            &CTX,
            &policy(),
        );
        assert_eq!(got, STATE_GROUP_LEADER);
    }

    #[test]
    fn blocking_tier_wakes_on_set_state() {
        static CTX: AdaptationContext = AdaptationContext::new("test_block");
        let pool = Arc::new(SlotPool::new(1));
        let idx = pool.claim();

        let p = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            let no_yield = YieldPolicy {
                max_yield_usec: 0,
                slow_yield_usec: 3,
            };
            await_state(p.slot(idx), STATE_COMPLETED, &CTX, &no_yield)
        });

        // Give the waiter time to reach the blocking tier.
        thread::sleep(Duration::from_millis(50));
        set_state(pool.slot(idx), STATE_COMPLETED);
        assert_eq!(waiter.join().unwrap(), STATE_COMPLETED);
    }

    #[test]
    fn set_state_fast_path_skips_mutex() {
        let pool = SlotPool::new(1);
        let idx = pool.claim();
        let slot = pool.slot(idx);
        assert_eq!(slot.state.load(Ordering::Relaxed), STATE_INIT);
        set_state(slot, STATE_GROUP_LEADER);
        assert_eq!(slot.state.load(Ordering::Relaxed), STATE_GROUP_LEADER);
        assert!(slot.park.get().is_none());
    }

    #[test]
    fn wake_races_are_not_lost() {
        // Many rounds of waiter-vs-waker racing through the tiers; every
        // round must terminate with the goal state observed.
        static CTX: AdaptationContext = AdaptationContext::new("test_race");
        let pool = Arc::new(SlotPool::new(1));
        let idx = pool.claim();

        for round in 0..200 {
            pool.slot(idx).reset();
            let p = Arc::clone(&pool);
            let waiter = thread::spawn(move || {
                let no_yield = YieldPolicy {
                    max_yield_usec: 0,
                    slow_yield_usec: 3,
                };
                await_state(p.slot(idx), STATE_COMPLETED, &CTX, &no_yield)
            });
            if round % 2 == 0 {
                thread::yield_now();
            }
            set_state(pool.slot(idx), STATE_COMPLETED);
            assert_eq!(waiter.join().unwrap(), STATE_COMPLETED, "round {round}");
        }
    }

    #[test]
    fn credit_decays_and_saturates() {
        let ctx = AdaptationContext::new("test_credit");
        // Apply the update rule many times; the magnitude must stay
        // within the documented 2^27 bound.
        for _ in 0..10_000 {
            let v = ctx.credit.load(Ordering::Relaxed);
            ctx.credit
                .store(v - v / 1024 + CREDIT_STEP, Ordering::Relaxed);
        }
        let v = ctx.credit.load(Ordering::Relaxed);
        assert!(v > 0);
        assert!(v <= 1 << 27, "credit {v} exceeded bound");
    }
}
