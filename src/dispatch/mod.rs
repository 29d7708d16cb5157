//! Two-level string dispatch: a hash bucket, then equality within the
//! bucket.
//!
//! A [`DispatchTable`] is built once from a closed set of keys. Generated
//! code branches on the key's `String.hashCode` to pick a bucket and then
//! tests the bucket's candidates with `String.equals` in insertion order.
//! Equal hashes never prove equal keys, so singleton buckets are tested too.

mod emit;

use std::collections::BTreeMap;
use std::num::NonZeroI32;

pub use self::emit::emit;

/// `java.lang.String.hashCode`: `h = 31 * h + c` over UTF-16 code units.
pub fn java_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    pub hash: i32,
    /// Candidates in insertion order.
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Hit { bucket: usize, position: usize },
    /// Carries the natural hash of the key for diagnostics.
    Miss { key: String, hash: i32 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchTable {
    buckets: Vec<Bucket>,
    modulus: Option<NonZeroI32>,
}

impl DispatchTable {
    /// Groups `keys` by natural hash. Duplicates are ignored.
    pub fn build<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::group(keys, None)
    }

    /// Groups `keys` by `hash % modulus`, forcing unrelated keys into the
    /// same bucket. Only useful to exercise multi-key buckets.
    pub fn with_collision_modulus<I, S>(keys: I, modulus: NonZeroI32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::group(keys, Some(modulus))
    }

    fn group<I, S>(keys: I, modulus: Option<NonZeroI32>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut grouped: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        for key in keys {
            let key = key.into();
            let bucket = grouped.entry(bucket_hash(&key, modulus)).or_default();
            if !bucket.contains(&key) {
                bucket.push(key);
            }
        }
        DispatchTable {
            buckets: grouped
                .into_iter()
                .map(|(hash, keys)| Bucket { hash, keys })
                .collect(),
            modulus,
        }
    }

    /// Buckets sorted ascending by hash.
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn modulus(&self) -> Option<NonZeroI32> {
        self.modulus
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.keys.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// The value generated code switches on for `key`.
    pub fn hash_of(&self, key: &str) -> i32 {
        bucket_hash(key, self.modulus)
    }

    pub fn lookup(&self, key: &str) -> Lookup {
        let hash = self.hash_of(key);
        let found = self
            .buckets
            .binary_search_by_key(&hash, |b| b.hash)
            .ok()
            .and_then(|bucket| {
                let position = self.buckets[bucket].keys.iter().position(|k| k == key)?;
                Some(Lookup::Hit { bucket, position })
            });
        found.unwrap_or_else(|| Lookup::Miss {
            key: key.to_owned(),
            hash: java_hash(key),
        })
    }

    /// Runs `on_match` with the stored key equal to `key`, or `on_default`
    /// with the key and its natural hash.
    pub fn resolve<R>(&self, key: &str, on_match: impl FnOnce(&str) -> R, on_default: impl FnOnce(&str, i32) -> R) -> R {
        match self.lookup(key) {
            Lookup::Hit { bucket, position } => on_match(&self.buckets[bucket].keys[position]),
            Lookup::Miss { key, hash } => on_default(&key, hash),
        }
    }
}

fn bucket_hash(key: &str, modulus: Option<NonZeroI32>) -> i32 {
    let hash = java_hash(key);
    match modulus {
        // irem: the sign follows the dividend
        Some(m) => hash.wrapping_rem(m.get()),
        None => hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_java_hash() {
        assert_eq!(java_hash(""), 0);
        assert_eq!(java_hash("a"), 97);
        assert_eq!(java_hash("hello"), 99162322);
        assert_eq!(java_hash("FB"), java_hash("Ea"));
        // one supplementary character hashes as two surrogates
        assert_eq!(java_hash("\u{1F600}"), 0xD83D * 31 + 0xDE00);
    }

    #[test]
    fn test_natural_collision_shares_a_bucket() {
        let table = DispatchTable::build(["FB", "Ea", "x"]);
        assert_eq!(table.buckets().len(), 2);
        let shared = table.buckets().iter().find(|b| b.keys.len() == 2).unwrap();
        assert_eq!(shared.keys, vec!["FB".to_owned(), "Ea".to_owned()]);
        // "x" hashes to 120, below the shared 2236
        assert_eq!(table.lookup("Ea"), Lookup::Hit { bucket: 1, position: 1 });
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let table = DispatchTable::build(["a.()V", "a.()V"]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unknown_key_misses() {
        let table = DispatchTable::build(["a.()V"]);
        assert_eq!(
            table.lookup("b.()V"),
            Lookup::Miss {
                key: "b.()V".into(),
                hash: java_hash("b.()V"),
            }
        );
        let routed = table.resolve("b.()V", |_| 0, |_, hash| hash);
        assert_eq!(routed, java_hash("b.()V"));
    }

    proptest! {
        #[test]
        fn prop_every_key_resolves_to_itself(
            keys in prop::collection::vec("[a-z]{1,6}\\.\\(I?\\)V", 1..24),
            modulus in 1i32..5,
        ) {
            let natural = DispatchTable::build(keys.iter().cloned());
            let forced = DispatchTable::with_collision_modulus(keys.iter().cloned(), NonZeroI32::new(modulus).unwrap());
            for table in [&natural, &forced] {
                for key in &keys {
                    let resolved = table.resolve(key, |k| k.to_owned(), |_, _| String::new());
                    prop_assert_eq!(&resolved, key);
                }
                let hashes: Vec<i32> = table.buckets().iter().map(|b| b.hash).collect();
                prop_assert!(hashes.windows(2).all(|w| w[0] < w[1]));
            }
            prop_assert!(forced.buckets().len() <= 2 * modulus as usize - 1);
        }
    }
}
