use std::time::Duration;
use rand::Rng;

/// Cluster size up to which intervals are not scaled
pub const SCALE_THRESHOLD: usize = 128;

/// Scales `interval` with the size of the cluster so that the total sync
/// load on the catalog grows logarithmically instead of linearly.
///
/// Every doubling of the cluster beyond the threshold adds one more
/// multiple of the base interval.
pub fn ae_scale(interval: Duration, members: usize) -> Duration {
    if members <= SCALE_THRESHOLD {
        return interval;
    }

    let doublings = (members as f64).log2() - (SCALE_THRESHOLD as f64).log2();
    let multiplier = doublings.ceil() as u32 + 1;
    interval.saturating_mul(multiplier)
}

/// Uniformly random duration in `[0, interval)`
pub fn random_stagger(interval: Duration) -> Duration {
    let nanos = interval.as_nanos().min(u64::MAX as u128) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::rng().random_range(0..nanos))
}
