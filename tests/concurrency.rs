mod common;

use std::thread;

use common::TestCache;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn concurrent_mixed_ops_keep_the_region_consistent() {
    let t = TestCache::new("mixed");

    let workers: Vec<_> = (0..4u64)
        .map(|worker| {
            let cache = t.attach();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(worker);
                for round in 0..2500u32 {
                    let key = format!("key{}", rng.gen_range(0..64));
                    match rng.gen_range(0..3) {
                        0 => {
                            let value = format!("{key}:{worker}:{round}");
                            cache.set(key.as_bytes(), value.as_bytes(), false).unwrap();
                        }
                        1 => {
                            if let Some(value) = cache.get(key.as_bytes()).unwrap() {
                                let text = String::from_utf8(value.data).unwrap();
                                assert!(
                                    text.starts_with(&format!("{key}:")),
                                    "read a value belonging to another key: {text}"
                                );
                            }
                        }
                        _ => {
                            cache.delete(key.as_bytes()).unwrap();
                        }
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    t.cache.check_integrity().unwrap();

    // Whatever survived is internally consistent: each key's value carries
    // its own name.
    for i in 0..64 {
        let key = format!("key{i}");
        if let Some(value) = t.cache.get(key.as_bytes()).unwrap() {
            let text = String::from_utf8(value.data).unwrap();
            assert!(text.starts_with(&format!("{key}:")));
        }
    }
}

#[test]
fn same_key_writes_are_serialised() {
    let t = TestCache::new("serialised");

    let workers: Vec<_> = (0..4u32)
        .map(|worker| {
            let cache = t.attach();
            thread::spawn(move || {
                for round in 0..1000u32 {
                    let value = format!("{worker}:{round}");
                    cache.set(b"contended", value.as_bytes(), false).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    // The globally last write is some thread's final round; an untorn
    // value therefore ends in ":999".
    let value = t.cache.get(b"contended").unwrap().unwrap();
    let text = String::from_utf8(value.data).unwrap();
    assert!(text.ends_with(":999"), "unexpected survivor: {text}");

    t.cache.check_integrity().unwrap();
}

#[test]
fn hit_and_miss_counters_reconcile() {
    let t = TestCache::new("reconcile");
    t.cache.set(b"hot", b"x", false).unwrap();

    let workers: Vec<_> = (0..4u32)
        .map(|worker| {
            let cache = t.attach();
            thread::spawn(move || {
                for n in 0..500u32 {
                    if n % 2 == 0 {
                        assert!(cache.get(b"hot").unwrap().is_some());
                    } else {
                        let key = format!("cold{worker}:{n}");
                        assert!(cache.get(key.as_bytes()).unwrap().is_none());
                    }
                }
                // Dropping the handle folds its buffered counters in.
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let stats = t.cache.stats().unwrap();
    assert_eq!(stats.get_hit_count, 1000);
    assert_eq!(stats.get_miss_count, 1000);
}
