#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;

/// Truncated exponential backoff with jitter for feed resubscription.
pub fn resubscribe_delay(min: Duration, max: Duration, attempt: u32) -> Duration {
	let base_ms = (min.as_millis() as u64).max(1);
	let cap_ms = (max.as_millis() as u64).max(base_ms);
	let pow = 2u64.saturating_pow(attempt.saturating_sub(1).min(6));
	let delay_ms = base_ms.saturating_mul(pow).min(cap_ms);

	let jitter_window = (delay_ms / 10).max(1);
	let mut rng = rand::rng();
	let jitter_offset = rng.random_range(0..=(jitter_window * 2));

	Duration::from_millis(delay_ms.saturating_sub(jitter_window).saturating_add(jitter_offset))
}

#[cfg(test)]
mod tests {
	use super::*;

	const MIN: Duration = Duration::from_millis(500);
	const MAX: Duration = Duration::from_secs(30);

	#[test]
	fn first_attempt_stays_near_the_minimum() {
		for _ in 0..32 {
			let d = resubscribe_delay(MIN, MAX, 1);
			assert!(d >= Duration::from_millis(450), "too short: {d:?}");
			assert!(d <= Duration::from_millis(550), "too long: {d:?}");
		}
	}

	#[test]
	fn delays_grow_and_saturate_at_the_cap() {
		let early = resubscribe_delay(MIN, MAX, 2);
		assert!(early >= Duration::from_millis(900), "got {early:?}");

		for attempt in [7, 20, u32::MAX] {
			let d = resubscribe_delay(MIN, MAX, attempt);
			assert!(d <= MAX + MAX / 10, "attempt {attempt} exceeded cap: {d:?}");
			assert!(d >= MAX - MAX / 10, "attempt {attempt} below cap window: {d:?}");
		}
	}

	#[test]
	fn degenerate_configs_do_not_panic() {
		let d = resubscribe_delay(Duration::ZERO, Duration::ZERO, 1);
		assert!(d <= Duration::from_millis(3));
	}
}
