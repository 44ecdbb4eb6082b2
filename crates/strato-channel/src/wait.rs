//! The single blocking-wait primitive.
//!
//! Hardware interaction is fundamentally synchronous polling (or
//! edge-triggered doorbells on the submit side), so every suspension point
//! in the crate is this one loop: poll a predicate until it holds or the
//! bound expires. Cancellation is timeout-only by design; expiry surfaces as
//! an error, never a partial result.

use std::time::{Duration, Instant};

/// Poll `pred` until it returns true, yielding briefly between polls.
/// Returns `Err(())` on timeout; callers map that onto their own error.
pub fn poll_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> Result<(), ()> {
    let deadline = Instant::now() + timeout;
    let mut spins = 0u32;
    loop {
        if pred() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            // One last look so a predicate satisfied exactly at the deadline
            // is not reported as a timeout.
            return if pred() { Ok(()) } else { Err(()) };
        }
        // Spin a little before involving the scheduler; drains are usually
        // short relative to a timeslice.
        if spins < 64 {
            spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::sleep(Duration::from_micros(50));
        }
    }
}
