// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded polling, shared by every wait on engine-written memory.

use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("condition not met after {elapsed:?} (timeout {timeout:?})")]
pub struct PollTimeout {
    pub timeout: Duration,
    pub elapsed: Duration,
}

/// Repeatedly evaluates `predicate` every `interval` until it returns `Some`, or until `timeout`
/// has elapsed.
///
/// The predicate is evaluated at least once. On timeout, the returned elapsed time is never
/// shorter than `timeout`. A `timeout` too large to be represented as an instant never expires.
pub fn poll_until<T, F>(
    interval: Duration,
    timeout: Duration,
    mut predicate: F,
) -> Result<T, PollTimeout>
where
    F: FnMut() -> Option<T>,
{
    let start = Instant::now();
    let deadline = start.checked_add(timeout);

    loop {
        if let Some(value) = predicate() {
            return Ok(value);
        }

        let now = Instant::now();
        let sleep = match deadline {
            Some(deadline) if now >= deadline => {
                return Err(PollTimeout {
                    timeout,
                    elapsed: now - start,
                })
            }
            Some(deadline) => interval.min(deadline - now),
            None => interval,
        };

        std::thread::sleep(sleep);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn poll_until_immediate() {
        let res = poll_until(Duration::from_millis(1), Duration::ZERO, || Some(42));
        assert_eq!(res, Ok(42));
    }

    #[test]
    fn poll_until_eventually() {
        let count = Cell::new(0);
        let res = poll_until(Duration::from_millis(1), Duration::from_secs(5), || {
            count.set(count.get() + 1);
            (count.get() == 3).then_some(count.get())
        });
        assert_eq!(res, Ok(3));
    }

    #[test]
    fn poll_until_without_deadline() {
        let count = Cell::new(0);
        let res = poll_until(Duration::from_millis(1), Duration::MAX, || {
            count.set(count.get() + 1);
            (count.get() == 3).then_some(count.get())
        });
        assert_eq!(res, Ok(3));
    }

    #[test]
    fn poll_until_times_out_after_deadline() {
        let timeout = Duration::from_millis(50);
        let start = Instant::now();
        let res = poll_until::<(), _>(Duration::from_millis(7), timeout, || None);
        let elapsed = start.elapsed();

        let err = res.unwrap_err();
        assert_eq!(err.timeout, timeout);
        assert!(err.elapsed >= timeout);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));
    }
}
