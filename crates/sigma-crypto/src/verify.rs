//! Device verification against a persisted fingerprint hash.

use tracing::debug;

use crate::ct::ct_eq_32;
use crate::fingerprint::Collector;
use crate::FINGERPRINT_HASH_SIZE;

/// Re-collect the fingerprint and compare its hash with `cached` in constant
/// time. With no cached hash a comparison of identical cost still runs and
/// the result is `false`.
pub fn verify_device(collector: &Collector, cached: Option<&[u8; FINGERPRINT_HASH_SIZE]>) -> bool {
    let fresh = collector.fingerprint().hash();
    let (expected, present) = match cached {
        Some(hash) => (*hash, true),
        None => ([0u8; FINGERPRINT_HASH_SIZE], false),
    };
    let matched = ct_eq_32(&fresh, &expected);
    let ok = matched & present;
    debug!(ok, "device verification");
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::RawFingerprintParts;

    fn collector(serial: &str) -> Collector {
        Collector::Static(RawFingerprintParts {
            cpu_id: "cpu".into(),
            disk_serials: vec![serial.into()],
            platform_info: "test".into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_verify_matching_device() {
        let c = collector("disk-1");
        let hash = c.fingerprint().hash();
        assert!(verify_device(&c, Some(&hash)));
    }

    #[test]
    fn test_verify_other_device() {
        let hash = collector("disk-1").fingerprint().hash();
        assert!(!verify_device(&collector("disk-2"), Some(&hash)));
    }

    #[test]
    fn test_verify_without_cached_hash() {
        assert!(!verify_device(&collector("disk-1"), None));
    }
}
