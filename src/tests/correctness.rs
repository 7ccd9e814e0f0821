#[cfg(test)]
mod hashmap_test {
    use crate::hash::MaskHash;
    use crate::{Error, HashMap};
    use std::rc::Rc;
    use std::sync::atomic::Ordering::{Relaxed, SeqCst};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Arc, Barrier};
    use std::thread;

    static_assertions::assert_impl_all!(HashMap<u64, u64>: Send, Sync);
    static_assertions::assert_impl_all!(HashMap<String, u32>: Send, Sync);

    /// A key wrapping a non-`Send` payload; the table must not be shareable.
    #[derive(Clone, Eq, Ord, PartialEq, PartialOrd)]
    struct LocalKey(Rc<u64>);

    impl MaskHash for LocalKey {
        fn mask_hash(&self, mask_bits: u32) -> usize {
            self.0.mask_hash(mask_bits)
        }
    }

    static_assertions::assert_not_impl_any!(HashMap<LocalKey, u64>: Send, Sync);

    /// A key that counts its live instances, in the style of a leak canary.
    struct TrackedKey {
        id: u64,
        counter: &'static AtomicUsize,
    }

    impl TrackedKey {
        fn new(id: u64, counter: &'static AtomicUsize) -> Self {
            counter.fetch_add(1, Relaxed);
            Self { id, counter }
        }
    }

    impl Clone for TrackedKey {
        fn clone(&self) -> Self {
            Self::new(self.id, self.counter)
        }
    }

    impl Drop for TrackedKey {
        fn drop(&mut self) {
            self.counter.fetch_sub(1, Relaxed);
        }
    }

    impl PartialEq for TrackedKey {
        fn eq(&self, other: &Self) -> bool {
            self.id == other.id
        }
    }

    impl Eq for TrackedKey {}

    impl PartialOrd for TrackedKey {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for TrackedKey {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.id.cmp(&other.id)
        }
    }

    impl MaskHash for TrackedKey {
        fn mask_hash(&self, mask_bits: u32) -> usize {
            self.id.mask_hash(mask_bits)
        }
    }

    #[test]
    fn insert_and_lookup() {
        let map: HashMap<u64, u64> = HashMap::new();
        assert!(map.insert(1, 10).is_ok());
        assert!(map.insert(2, 20).is_ok());
        assert_eq!(map.get(&1), Some(10));
        assert_eq!(map.get(&2), Some(20));
        assert_eq!(map.get(&3), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let map: HashMap<u64, u64> = HashMap::new();
        assert!(map.insert(1, 10).is_ok());
        assert_eq!(map.insert(1, 11), Err(Error::KeyExists));
        assert_eq!(map.get(&1), Some(10));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn upsert_overwrites() {
        let map: HashMap<u64, u64> = HashMap::new();
        for value in [1, 2, 3, 4] {
            assert!(map.upsert(9, value).is_ok());
            assert_eq!(map.get(&9), Some(value));
        }
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn update_requires_presence() {
        let map: HashMap<u64, u64> = HashMap::new();
        assert!(!map.update(&5, 1));
        assert!(map.insert(5, 1).is_ok());
        assert!(map.update(&5, 2));
        assert_eq!(map.get(&5), Some(2));
    }

    #[test]
    fn remove_is_idempotent() {
        let map: HashMap<u64, u64> = HashMap::new();
        assert!(map.insert(1, 10).is_ok());
        assert_eq!(map.remove(&1), Some(10));
        assert_eq!(map.remove(&1), None);
        assert_eq!(map.get(&1), None);
        assert!(map.is_empty());
    }

    #[test]
    fn string_keys() {
        let map: HashMap<String, u32> = HashMap::new();
        assert!(map.insert("alpha".to_string(), 1).is_ok());
        assert!(map.insert("beta".to_string(), 2).is_ok());
        assert_eq!(map.get(&"alpha".to_string()), Some(1));
        assert!(map.update(&"beta".to_string(), 3));
        assert_eq!(map.remove(&"beta".to_string()), Some(3));
        assert_eq!(map.get(&"beta".to_string()), None);
    }

    #[test]
    fn chain_promotes_and_demotes() {
        // Every key lands in bucket zero; the chain shape is driven purely by
        // the record count.
        let map: HashMap<u64, u64> = HashMap::builder().hash_fn(|_, _| 0).build();
        for key in 0..6 {
            assert!(map.insert(key, key * 10).is_ok());
        }
        assert_eq!(map.chain_shape(&0), ('L', 6));

        // The seventh record converts the list into a tree.
        assert!(map.insert(6, 60).is_ok());
        assert_eq!(map.chain_shape(&0), ('T', 7));
        for key in 0..7 {
            assert_eq!(map.get(&key), Some(key * 10));
        }

        // Shrinking to five records keeps the tree.
        assert_eq!(map.remove(&4), Some(40));
        assert_eq!(map.remove(&5), Some(50));
        assert_eq!(map.chain_shape(&0), ('T', 5));

        // Dropping below five demotes back to a list.
        assert_eq!(map.remove(&3), Some(30));
        assert_eq!(map.chain_shape(&0), ('L', 4));
        for key in [0, 1, 2, 6] {
            assert_eq!(map.get(&key), Some(key * 10));
        }
        assert_eq!(map.get(&3), None);
    }

    #[test]
    fn chain_boundary_does_not_thrash() {
        let map: HashMap<u64, u64> = HashMap::builder().hash_fn(|_, _| 0).build();
        for key in 0..7 {
            assert!(map.insert(key, key).is_ok());
        }
        assert_eq!(map.remove(&0), Some(0));
        assert_eq!(map.remove(&1), Some(1));
        assert_eq!(map.remove(&2), Some(2));
        assert_eq!(map.chain_shape(&0), ('L', 4));

        // Oscillating around the transition points must only change shape at
        // the two thresholds.
        assert!(map.insert(7, 7).is_ok());
        assert_eq!(map.chain_shape(&0), ('L', 5));
        assert!(map.insert(8, 8).is_ok());
        assert_eq!(map.chain_shape(&0), ('L', 6));
        assert_eq!(map.remove(&7), Some(7));
        assert_eq!(map.chain_shape(&0), ('L', 5));
        assert!(map.insert(7, 7).is_ok());
        assert!(map.insert(9, 9).is_ok());
        assert_eq!(map.chain_shape(&0), ('T', 7));
        assert_eq!(map.remove(&8), Some(8));
        assert_eq!(map.remove(&9), Some(9));
        assert_eq!(map.chain_shape(&0), ('T', 5));
        assert_eq!(map.remove(&7), Some(7));
        assert_eq!(map.chain_shape(&0), ('L', 4));
    }

    #[test]
    fn growth_preserves_every_record() {
        let map: HashMap<u64, u64> = HashMap::builder()
            .initial_buckets(4)
            .load_factor(0.75)
            .build();
        assert_eq!(map.bucket_count(), 4);
        for key in 0..100 {
            assert!(map.insert(key, key + 1000).is_ok());
        }
        assert!(map.bucket_count() >= 128);
        assert_eq!(map.len(), 100);
        for key in 0..100 {
            assert_eq!(map.get(&key), Some(key + 1000));
        }
    }

    #[test]
    fn fixed_capacity_surfaces_exhaustion() {
        let map: HashMap<u64, u64> = HashMap::builder()
            .initial_buckets(16)
            .resizable(false)
            .build();
        let mut stored = 0;
        for key in 0..100 {
            match map.insert(key, key) {
                Ok(()) => stored += 1,
                Err(Error::OutOfMemory) => break,
                Err(error) => panic!("unexpected error: {error}"),
            }
        }
        assert!(stored >= 12, "a 16-bucket table should hold its threshold");
        assert!(stored < 100);
        assert_eq!(map.len(), stored);
        // The stored prefix must be fully retrievable, and the table must
        // still reject fresh inserts.
        for key in 0..stored as u64 {
            assert_eq!(map.get(&key), Some(key));
        }
        assert_eq!(map.insert(1000, 1), Err(Error::OutOfMemory));
        // Removal makes room again.
        assert_eq!(map.remove(&0), Some(0));
        assert!(map.insert(1000, 1).is_ok());
    }

    #[test]
    fn growth_cap_is_honored() {
        let map: HashMap<u64, u64> = HashMap::builder()
            .initial_buckets(4)
            .max_buckets(8)
            .build();
        let mut result = Ok(());
        for key in 0..100 {
            result = map.insert(key, key);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(Error::OutOfMemory));
        assert_eq!(map.bucket_count(), 8);
    }

    #[test]
    fn uncounted_table_does_not_count() {
        let map: HashMap<u64, u64> = HashMap::builder()
            .resizable(false)
            .countable(false)
            .build();
        assert!(map.insert(1, 1).is_ok());
        assert!(map.insert(2, 2).is_ok());
        assert_eq!(map.len(), 0);
        assert_eq!(map.get(&1), Some(1));
    }

    #[test]
    fn drop_releases_every_key() {
        static LIVE: AtomicUsize = AtomicUsize::new(0);

        {
            let map: HashMap<TrackedKey, u64> =
                HashMap::builder().initial_buckets(4).build();
            for id in 0..100 {
                assert!(map.insert(TrackedKey::new(id, &LIVE), id).is_ok());
            }
            // Growth happened along the way; exactly one live clone per
            // record may remain.
            assert!(map.bucket_count() > 4);
            assert_eq!(LIVE.load(Relaxed), 100);
            for id in 0..30 {
                assert_eq!(map.remove(&TrackedKey::new(id, &LIVE)), Some(id));
            }
            assert_eq!(LIVE.load(Relaxed), 70);
        }
        assert_eq!(LIVE.load(Relaxed), 0);
    }

    #[test]
    fn collided_keys_survive_drop_accounting() {
        static LIVE: AtomicUsize = AtomicUsize::new(0);

        {
            let map: HashMap<TrackedKey, u64> =
                HashMap::builder().hash_fn(|_, _| 3).build();
            for id in 0..20 {
                assert!(map.insert(TrackedKey::new(id, &LIVE), id).is_ok());
            }
            assert_eq!(map.chain_shape(&TrackedKey::new(0, &LIVE)).0, 'T');
            for id in 0..17 {
                assert_eq!(map.remove(&TrackedKey::new(id, &LIVE)), Some(id));
            }
            assert_eq!(map.chain_shape(&TrackedKey::new(0, &LIVE)).0, 'L');
            assert_eq!(LIVE.load(Relaxed), 3);
        }
        assert_eq!(LIVE.load(Relaxed), 0);
    }

    #[test]
    fn scan_visits_every_record_once() {
        let map: HashMap<u64, u64> = HashMap::builder().initial_buckets(8).build();
        for key in 0..50 {
            assert!(map.insert(key, key * 2).is_ok());
        }
        let mut seen = std::collections::BTreeMap::new();
        map.scan(|key, value| {
            assert!(seen.insert(*key, value).is_none());
        });
        assert_eq!(seen.len(), 50);
        for (key, value) in seen {
            assert_eq!(value, key * 2);
        }
    }

    #[test]
    fn statistics_reflect_distribution() {
        let map: HashMap<u64, u64> = HashMap::builder().hash_fn(|_, _| 0).build();
        for key in 0..9 {
            assert!(map.insert(key, key).is_ok());
        }
        let stats = map.statistics();
        assert_eq!(stats.buckets, 256);
        assert_eq!(stats.filled_buckets, 1);
        assert_eq!(stats.len, 9);
        assert_eq!(stats.collisions, 1);
        assert_eq!(stats.max_collision, 9);

        let spread: HashMap<u64, u64> = HashMap::new();
        for key in 0..64 {
            assert!(spread.insert(key, key).is_ok());
        }
        let stats = spread.statistics();
        assert_eq!(stats.len, 64);
        assert_eq!(stats.filled_buckets, 64);
        assert_eq!(stats.collisions, 0);
        assert_eq!(stats.max_collision, 0);
    }

    #[test]
    fn evaluate_hasher_reports_collisions() {
        let keys: Vec<u64> = (0..64).collect();
        let stats = crate::hash::evaluate_hasher(u64::mask_hash, &keys, 64);
        assert_eq!(stats.buckets, 64);
        assert_eq!(stats.len, 64);
        assert_eq!(stats.filled_buckets, 64);
        assert_eq!(stats.collisions, 0);

        let stats = crate::hash::evaluate_hasher(|_, _| 0, &keys, 64);
        assert_eq!(stats.filled_buckets, 1);
        assert_eq!(stats.collisions, 1);
        assert_eq!(stats.max_collision, 64);
    }

    #[test]
    fn debug_output_contains_entries() {
        let map: HashMap<u64, u64> = HashMap::new();
        assert!(map.insert(1, 2).is_ok());
        let rendered = format!("{map:?}");
        assert!(rendered.contains("1: 2"));
    }

    #[test]
    fn concurrent_inserts_across_growth() {
        let map: Arc<HashMap<u64, u64>> =
            Arc::new(HashMap::builder().initial_buckets(4).build());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8_u64)
            .map(|t| {
                let map = map.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..1000 {
                        let key = t * 1000 + i;
                        assert!(map.insert(key, key).is_ok());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 8000);
        for key in 0..8000 {
            assert_eq!(map.get(&key), Some(key));
        }
    }

    #[test]
    fn readers_never_observe_torn_values() {
        let map: Arc<HashMap<u64, u64>> = Arc::new(HashMap::new());
        assert!(map.insert(0, 0).is_ok());
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let map = map.clone();
                let done = done.clone();
                thread::spawn(move || {
                    while !done.load(SeqCst) {
                        let value = map.get(&0).unwrap();
                        // Updates always write mirrored halves; any mix of two
                        // writes would break the mirror.
                        assert_eq!(value >> 32, value & 0xffff_ffff);
                    }
                })
            })
            .collect();

        for i in 0..100_000_u64 {
            let mirrored = (i << 32) | i;
            assert!(map.update(&0, mirrored));
        }
        done.store(true, SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn concurrent_mixed_operations_match_serial_replay() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        const PER_THREAD_KEYS: u64 = 512;
        const OPS: usize = 20_000;

        let map: Arc<HashMap<u64, u64>> =
            Arc::new(HashMap::builder().initial_buckets(4).build());
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4_u64)
            .map(|t| {
                let map = map.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    // Threads operate on disjoint key ranges, so a per-thread
                    // serial replay must reproduce the final table.
                    let base = t * PER_THREAD_KEYS;
                    let mut rng = StdRng::seed_from_u64(t);
                    barrier.wait();
                    for _ in 0..OPS {
                        let key = base + rng.gen_range(0..PER_THREAD_KEYS);
                        match rng.gen_range(0..10) {
                            0..=5 => {
                                map.get(&key);
                            }
                            6 | 7 => {
                                let _ = map.insert(key, key ^ 0xff);
                            }
                            8 => {
                                map.update(&key, key ^ 0xabcd);
                            }
                            _ => {
                                map.remove(&key);
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..4_u64 {
            let base = t * PER_THREAD_KEYS;
            let mut model = std::collections::HashMap::new();
            let mut rng = StdRng::seed_from_u64(t);
            for _ in 0..OPS {
                let key = base + rng.gen_range(0..PER_THREAD_KEYS);
                match rng.gen_range(0..10) {
                    0..=5 => {}
                    6 | 7 => {
                        model.entry(key).or_insert(key ^ 0xff);
                    }
                    8 => {
                        if let Some(value) = model.get_mut(&key) {
                            *value = key ^ 0xabcd;
                        }
                    }
                    _ => {
                        model.remove(&key);
                    }
                }
            }
            for key in base..base + PER_THREAD_KEYS {
                assert_eq!(map.get(&key), model.get(&key).copied(), "key {key}");
            }
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_roundtrip() {
        let map: HashMap<u64, u64> = HashMap::new();
        for key in 0..32 {
            assert!(map.insert(key, key * 3).is_ok());
        }
        let encoded = serde_json::to_string(&map).unwrap();
        let decoded: HashMap<u64, u64> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.len(), 32);
        for key in 0..32 {
            assert_eq!(decoded.get(&key), Some(key * 3));
        }
    }
}
