use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::time::Duration;

/// Take a std mutex, recovering the data from a poisoned lock. These locks
/// only guard map updates; a panic mid-update leaves nothing worse than a
/// consistent-but-stale map entry.
pub(crate) fn lock_or_poisoned<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Default exponential back-off schedule: 200ms → 400ms → 800ms → 1600ms,
/// with ±20% jitter so concurrent health waits do not stampede the agent.
pub(crate) fn backoff(attempt: u64) -> Duration {
    use rand::Rng;
    let base_delay_ms = 200u64 * (1u64 << (attempt.saturating_sub(1)).min(6));
    let jitter = rand::rng().random_range(0.8..1.2);
    let delay_ms = (base_delay_ms as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}

/// Truncate `input` to at most `max_len` bytes without splitting a UTF-8
/// character.
pub(crate) fn truncate_on_boundary(input: &str, max_len: usize) -> &str {
    if input.len() <= max_len {
        return input;
    }
    let mut end = max_len;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn backoff_grows_and_is_bounded() {
        for attempt in 1..=8 {
            let delay = backoff(attempt);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(20_000));
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "ab…cd";
        // The ellipsis is three bytes; cutting inside it must back up.
        assert_eq!(truncate_on_boundary(s, 3), "ab");
        assert_eq!(truncate_on_boundary(s, 5), "ab…");
        assert_eq!(truncate_on_boundary(s, 64), s);
    }
}
