use std::time::Duration;

use rand::Rng;

/// `min(base * 2^failures, cap)`, saturating instead of overflowing.
pub fn backoff_delay(base: Duration, failures: u32, cap: Duration) -> Duration {
    let factor = 2_u32.checked_pow(failures).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Spread `delay` uniformly over `delay * (1 ± ratio)`. The result never exceeds `cap`.
pub fn apply_jitter<R: Rng + ?Sized>(delay: Duration, ratio: f64, cap: Duration, rng: &mut R) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let ratio = ratio.min(1.0);
    let factor = rng.gen_range((1.0 - ratio)..=(1.0 + ratio));
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
        .unwrap_or(cap)
        .min(cap)
}
