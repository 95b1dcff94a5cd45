//! Optional post-stage consistency checks, gated by `Config::validate`.
//!
//! Both checks stream their inputs rather than loading them, since the
//! whole premise of external sorting is that the data need not fit in
//! memory. Multiset equality is checked via a commutative, streaming
//! fingerprint (count, wrapping sum of raw keys, wrapping sum of a mixed
//! hash of each key) rather than an in-memory frequency table, so
//! comparing two files stays O(1) in memory regardless of how many
//! duplicate keys they contain.

use std::path::Path;

use crate::error::{SortError, SortResult};
use crate::key::Key;
use crate::run_io::KeyReader;

/// Streams `path` and fails if any key is smaller than its predecessor.
pub fn check_sorted<K: Key>(path: &Path) -> SortResult<()> {
    let mut reader = KeyReader::<K>::open(path)?;
    let mut prev: Option<K> = None;
    let mut index: u64 = 0;
    while let Some(key) = reader.next_key()? {
        if let Some(p) = prev {
            if key < p {
                return Err(SortError::invariant(
                    "validate",
                    format!("{} is out of order at position {}: {:?} follows {:?}", path.display(), index, key, p),
                ));
            }
        }
        prev = Some(key);
        index += 1;
    }
    Ok(())
}

/// A commutative summary of a key stream: not a cryptographic digest,
/// just enough structure that an accidental mismatch is astronomically
/// unlikely while staying O(1) in memory.
#[derive(Debug, PartialEq, Eq)]
struct Fingerprint {
    count: u64,
    raw_sum: u64,
    mixed_sum: u64,
}

fn mix(x: u64) -> u64 {
    // splitmix64 finalizer: a fixed, well-distributed avalanche so
    // distinct keys rarely collide in the summed fingerprint.
    let mut z = x.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

fn fingerprint<K: Key>(path: &Path) -> SortResult<Fingerprint> {
    let mut reader = KeyReader::<K>::open(path)?;
    let mut fp = Fingerprint { count: 0, raw_sum: 0, mixed_sum: 0 };
    while let Some(key) = reader.next_key()? {
        let bytes = key.to_le_bytes();
        let mut v: u64 = 0;
        for (i, b) in bytes.as_ref().iter().enumerate() {
            v |= (*b as u64) << (8 * i);
        }
        fp.count += 1;
        fp.raw_sum = fp.raw_sum.wrapping_add(v);
        fp.mixed_sum = fp.mixed_sum.wrapping_add(mix(v));
    }
    Ok(fp)
}

/// Verifies the multiset of keys in `a` equals the multiset in `b`
/// without holding either file in memory.
pub fn check_multiset_equal<K: Key>(a: &Path, b: &Path) -> SortResult<()> {
    let fp_a = fingerprint::<K>(a)?;
    let fp_b = fingerprint::<K>(b)?;
    if fp_a != fp_b {
        return Err(SortError::invariant(
            "validate",
            format!("key multiset mismatch between {} and {}", a.display(), b.display()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_keys(path: &Path, keys: &[u32]) {
        let mut f = std::fs::File::create(path).unwrap();
        for k in keys {
            f.write_all(&k.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn accepts_sorted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        write_keys(&path, &[1, 2, 2, 5, 9]);
        assert!(check_sorted::<u32>(&path).is_ok());
    }

    #[test]
    fn rejects_unsorted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        write_keys(&path, &[1, 5, 2]);
        assert!(check_sorted::<u32>(&path).is_err());
    }

    #[test]
    fn multiset_equal_ignores_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_keys(&a, &[3, 1, 4, 1, 5]);
        write_keys(&b, &[1, 1, 3, 4, 5]);
        assert!(check_multiset_equal::<u32>(&a, &b).is_ok());
    }

    #[test]
    fn multiset_detects_a_changed_key() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_keys(&a, &[3, 1, 4, 1, 5]);
        write_keys(&b, &[3, 1, 4, 1, 6]);
        assert!(check_multiset_equal::<u32>(&a, &b).is_err());
    }

    #[test]
    fn multiset_detects_a_dropped_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_keys(&a, &[1, 1, 2]);
        write_keys(&b, &[1, 2, 2]);
        assert!(check_multiset_equal::<u32>(&a, &b).is_err());
    }
}
