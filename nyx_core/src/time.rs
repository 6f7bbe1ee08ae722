//! Functions to work with time.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Return the number of milliseconds that have elapsed since the Unix
/// epoch. Used for wire timestamps only; runtime state works on `Instant`.
pub fn unix_time_ms(time: SystemTime) -> u64 {
    let since_the_epoch = time
        .duration_since(UNIX_EPOCH)
        .expect("Current time is earlier than Unix epoch");
    since_the_epoch.as_secs() * 1000 + u64::from(since_the_epoch.subsec_millis())
}

/// Milliseconds since the Unix epoch, now.
pub fn now_ms() -> u64 {
    unix_time_ms(SystemTime::now())
}

/// Returns an `Instant` corresponding to "now". Should be used instead of
/// `Instant::now()` to have zero cost mocked time under
/// `tokio::time::pause`.
pub fn clock_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Returns the amount of time elapsed since this instant was created.
/// Should be used instead of `Instant::elapsed` in order to work with the
/// mocked clock.
pub fn clock_elapsed(time: Instant) -> Duration {
    clock_now().saturating_duration_since(time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mocked_elapsed() {
        tokio::time::pause();

        let now = clock_now();
        tokio::time::advance(Duration::from_secs(42)).await;
        assert_eq!(clock_elapsed(now), Duration::from_secs(42));
    }

    #[test]
    fn unix_time_counts_millis() {
        let t = UNIX_EPOCH + Duration::from_millis(1234);
        assert_eq!(unix_time_ms(t), 1234);
    }
}
