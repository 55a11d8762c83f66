//! Model checks of the hash table against `std::collections::HashMap`.

use emberkv::dict::{HashTable, ResizePolicy};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
enum Op {
    Insert(u16, u32),
    Upsert(u16, u32),
    Remove(u16),
    Get(u16),
    Expand(usize),
    Shrink,
    RehashStep(usize),
    TogglePolicy,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u16..512, any::<u32>()).prop_map(|(k, v)| Op::Insert(k, v)),
        2 => (0u16..512, any::<u32>()).prop_map(|(k, v)| Op::Upsert(k, v)),
        3 => (0u16..512).prop_map(Op::Remove),
        2 => (0u16..512).prop_map(Op::Get),
        1 => (0usize..2048).prop_map(Op::Expand),
        1 => Just(Op::Shrink),
        1 => (1usize..8).prop_map(Op::RehashStep),
        1 => Just(Op::TogglePolicy),
    ]
}

proptest! {
    #[test]
    fn test_matches_hashmap_model(ops in prop::collection::vec(op(), 1..400)) {
        let policy = ResizePolicy::default();
        let mut table: HashTable<u16, u32> = HashTable::with_policy(policy.clone());
        let mut model: HashMap<u16, u32> = HashMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let inserted = table.insert(k, v).is_ok();
                    prop_assert_eq!(inserted, !model.contains_key(&k));
                    model.entry(k).or_insert(v);
                }
                Op::Upsert(k, v) => {
                    let created = table.upsert(k, v);
                    prop_assert_eq!(created, model.insert(k, v).is_none());
                }
                Op::Remove(k) => {
                    let removed = table.remove(&k).map(|(_, v)| v);
                    prop_assert_eq!(removed, model.remove(&k));
                }
                Op::Get(k) => {
                    prop_assert_eq!(table.get(&k).copied(), model.get(&k).copied());
                }
                Op::Expand(size) => {
                    let _ = table.expand(size);
                }
                Op::Shrink => {
                    let _ = table.shrink_to_fit();
                }
                Op::RehashStep(n) => {
                    table.rehash_step(n);
                }
                Op::TogglePolicy => policy.set_enabled(!policy.is_enabled()),
            }
            prop_assert_eq!(table.len(), model.len());
        }

        let mut seen: Vec<(u16, u32)> = table.iter().map(|(k, v)| (*k, *v)).collect();
        seen.sort_unstable();
        let mut expected: Vec<(u16, u32)> = model.into_iter().collect();
        expected.sort_unstable();
        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn test_scan_visits_every_stable_key(
        keys in prop::collection::hash_set(any::<u32>(), 1..300),
        churn in prop::collection::vec(any::<u32>(), 0..300),
    ) {
        let mut table: HashTable<u32, ()> = HashTable::new();
        for &k in &keys {
            table.insert(k, ()).unwrap();
        }

        // Keys present for the whole scan must be reported; inserts between
        // calls grow the table and start migrations.
        let mut seen = HashSet::new();
        let mut churn = churn.into_iter();
        let mut cursor = 0;
        loop {
            cursor = table.scan(cursor, |k, _| {
                seen.insert(*k);
            });
            if let Some(extra) = churn.next() {
                let _ = table.insert(extra, ());
            }
            table.rehash_step(1);
            if cursor == 0 {
                break;
            }
        }
        for k in &keys {
            prop_assert!(seen.contains(k), "key {} missed by scan", k);
        }
    }
}

#[test]
fn test_growth_completes_through_lookups() {
    let mut table: HashTable<u32, u32> = HashTable::new();
    for i in 0..1000 {
        table.insert(i, i * 2).unwrap();
    }
    for _ in 0..10_000 {
        if !table.is_rehashing() {
            break;
        }
        table.get(&0);
    }
    assert!(!table.is_rehashing());
    assert!(table.table_size() >= 1000);
    assert_eq!(table.get(&999), Some(&1998));
}

#[test]
fn test_forbidden_policy_defers_growth() {
    let policy = ResizePolicy::default();
    policy.forbid();
    let mut table: HashTable<u32, ()> = HashTable::with_policy(policy.clone());
    for i in 0..16 {
        table.insert(i, ()).unwrap();
    }
    assert_eq!(table.table_size(), 4);

    policy.allow();
    table.insert(100, ()).unwrap();
    assert!(table.is_rehashing() || table.table_size() > 4);
}
