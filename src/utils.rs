use std::time::Duration;

pub const fn is_power_of_two(n: u64) -> bool {
    if n == 0 {
        return false;
    }
    n & (n - 1) == 0
}

pub const fn prev_power_of_two(n: u64) -> u64 {
    let highest_bit_set_idx = (u64::BITS - 1) - (n | 1).leading_zeros();
    (1 << highest_bit_set_idx) & n
}

/// Yields the powers of two no greater than `n`, in ascending order.
pub fn iter_powers_of_two(n: u64) -> impl Iterator<Item = u64> + DoubleEndedIterator + Clone {
    let top_bits = u64::BITS - prev_power_of_two(n).leading_zeros();
    (0..top_bits).map(|b| 1u64 << b)
}

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Returns the median of a non-empty set of durations.
///
/// For an even number of samples, this is the mean of the two middle samples.
pub fn median(samples: &[Duration]) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2)
    }
}

/// Converts an operation count and a runtime into billions of operations per second.
pub fn gflops(flops: f64, runtime: Duration) -> f64 {
    1.0e-9 * flops / runtime.as_secs_f64()
}
