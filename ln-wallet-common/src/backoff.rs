//! Exponential backoff schedule for reconnect loops (the Electrum server
//! connection, in particular). Never used to delay in-mailbox FSM
//! transitions -- only the outer connect/reconnect loop sleeps on this.

use std::time::Duration;

/// A small `const_assert!` so invalid constant tweaks fail to compile rather
/// than silently misbehave at runtime.
#[macro_export]
macro_rules! const_assert {
    ($x:expr $(,)?) => {
        const _: [(); 0 - !{
            const ASSERT: bool = $x;
            ASSERT
        } as usize] = [];
    };
}

const INITIAL_WAIT_MS: u64 = 250;
const MAXIMUM_WAIT_MS: u64 = 32_000;
const EXP_BASE: u64 = 2;

const_assert!(INITIAL_WAIT_MS != 0);

/// An infinite iterator of durations: 250ms, 500ms, 1s, 2s, ... capped at 32s.
pub fn get_backoff_iter() -> impl Iterator<Item = Duration> {
    (0u32..).map(|i| {
        let wait_ms = EXP_BASE
            .saturating_pow(i)
            .saturating_mul(INITIAL_WAIT_MS)
            .min(MAXIMUM_WAIT_MS);
        Duration::from_millis(wait_ms)
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_integer_overflow() {
        let durations: Vec<Duration> = get_backoff_iter().take(1000).collect();
        assert!(durations.iter().all(|d| d.as_millis() as u64 <= MAXIMUM_WAIT_MS));
    }

    #[test]
    fn starts_at_initial_wait() {
        let mut iter = get_backoff_iter();
        assert_eq!(iter.next(), Some(Duration::from_millis(INITIAL_WAIT_MS)));
        assert_eq!(iter.next(), Some(Duration::from_millis(INITIAL_WAIT_MS * 2)));
    }

    #[test]
    fn eventually_saturates_at_maximum() {
        let last = get_backoff_iter().take(20).last().unwrap();
        assert_eq!(last, Duration::from_millis(MAXIMUM_WAIT_MS));
    }
}
