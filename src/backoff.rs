// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Adaptive backoff for polling loops: spin → pause → yield → sleep.

use std::time::{Duration, Instant};

/// Back off according to how many rounds `k` have already been spent.
///
/// - k < 4:  busy spin
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// Poll `ready` with [`adaptive_yield`] until it returns `Some` or `timeout`
/// elapses.
pub(crate) fn poll_until<T, F>(timeout: Duration, mut ready: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    let start = Instant::now();
    let mut k = 0u32;
    loop {
        if let Some(v) = ready() {
            return Some(v);
        }
        if start.elapsed() >= timeout {
            return None;
        }
        adaptive_yield(&mut k);
    }
}
