use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock is set before the unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_monotonic_enough() {
        let a = timestamp_secs();
        let b = timestamp_secs();
        assert!(b >= a);
        // Sometime after 2020-01-01.
        assert!(a > 1_577_836_800);
    }
}
