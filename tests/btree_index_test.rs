use std::sync::Arc;
use std::thread;

use anyhow::Result;

use stratadb::common::types::Rid;
use stratadb::index::btree::BTreeIndex;
use stratadb::transaction::{IsolationLevel, Transaction};

mod common;
use common::{create_test_buffer_pool, init_test_logger};

fn rid(n: i32) -> Rid {
    Rid::new(n, n as u32)
}

fn txn(id: u32) -> Transaction {
    Transaction::new(id, IsolationLevel::RepeatableRead)
}

#[test]
fn test_insert_and_get() -> Result<()> {
    let (pool, _file) = create_test_buffer_pool(10, 2)?;
    let index = BTreeIndex::<i32>::new("test_idx", pool, 4, 4);
    let t = txn(1);

    assert!(index.is_empty());
    assert_eq!(index.get(&5)?, None);

    for key in [5, 3, 8, 2, 7] {
        assert!(index.insert(key, rid(key), &t)?);
    }
    assert!(!index.is_empty());

    for key in [5, 3, 8, 2, 7] {
        assert_eq!(index.get(&key)?, Some(rid(key)));
    }
    assert_eq!(index.get(&100)?, None);
    Ok(())
}

#[test]
fn test_duplicate_insert_is_rejected() -> Result<()> {
    let (pool, _file) = create_test_buffer_pool(10, 2)?;
    let index = BTreeIndex::<i32>::new("test_idx", pool, 4, 4);
    let t = txn(1);

    assert!(index.insert(1, rid(1), &t)?);
    assert!(!index.insert(1, rid(99), &t)?);
    // The original value survives the rejected insert.
    assert_eq!(index.get(&1)?, Some(rid(1)));
    Ok(())
}

#[test]
fn test_sequential_inserts_split_leaves() -> Result<()> {
    let (pool, _file) = create_test_buffer_pool(10, 2)?;
    let index = BTreeIndex::<i32>::new("test_idx", pool, 4, 4);
    let t = txn(1);

    for key in 1..=10 {
        assert!(index.insert(key, rid(key), &t)?);
    }

    // One root level above the leaves.
    assert_eq!(index.height()?, 2);

    for key in 1..=10 {
        assert_eq!(index.get(&key)?, Some(rid(key)));
    }

    // The leaf chain enumerates every key in ascending order.
    let keys: Vec<i32> = index.iter()?.map(|(k, _)| k).collect();
    assert_eq!(keys, (1..=10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_remove_triggers_merge_and_redistribute() -> Result<()> {
    let (pool, _file) = create_test_buffer_pool(10, 2)?;
    let index = BTreeIndex::<i32>::new("test_idx", pool, 4, 4);
    let t = txn(1);

    for key in 1..=10 {
        index.insert(key, rid(key), &t)?;
    }
    // Underflow the middle leaves.
    for key in [3, 4, 5] {
        index.remove(&key, &t)?;
    }

    for key in [3, 4, 5] {
        assert_eq!(index.get(&key)?, None);
    }
    let remaining = [1, 2, 6, 7, 8, 9, 10];
    for key in remaining {
        assert_eq!(index.get(&key)?, Some(rid(key)));
    }
    let keys: Vec<i32> = index.iter()?.map(|(k, _)| k).collect();
    assert_eq!(keys, remaining.to_vec());
    Ok(())
}

#[test]
fn test_remove_absent_key_is_noop() -> Result<()> {
    let (pool, _file) = create_test_buffer_pool(10, 2)?;
    let index = BTreeIndex::<i32>::new("test_idx", pool, 4, 4);
    let t = txn(1);

    index.remove(&7, &t)?; // empty tree

    index.insert(1, rid(1), &t)?;
    index.insert(2, rid(2), &t)?;
    index.remove(&7, &t)?; // populated tree, missing key

    let keys: Vec<i32> = index.iter()?.map(|(k, _)| k).collect();
    assert_eq!(keys, vec![1, 2]);
    Ok(())
}

#[test]
fn test_remove_everything_then_reinsert() -> Result<()> {
    let (pool, _file) = create_test_buffer_pool(10, 2)?;
    let index = BTreeIndex::<i32>::new("test_idx", pool, 4, 4);
    let t = txn(1);

    for key in 1..=5 {
        index.insert(key, rid(key), &t)?;
    }
    for key in 1..=5 {
        index.remove(&key, &t)?;
    }

    assert!(index.is_empty());
    assert_eq!(index.height()?, 0);
    assert_eq!(index.get(&3)?, None);
    assert!(index.iter()?.next().is_none());

    // An emptied tree accepts a fresh root.
    assert!(index.insert(42, rid(42), &t)?);
    assert_eq!(index.get(&42)?, Some(rid(42)));
    assert_eq!(index.height()?, 1);
    Ok(())
}

#[test]
fn test_insert_remove_restores_key_set() -> Result<()> {
    let (pool, _file) = create_test_buffer_pool(10, 2)?;
    let index = BTreeIndex::<i32>::new("test_idx", pool, 4, 4);
    let t = txn(1);

    for key in (1..=20).step_by(2) {
        index.insert(key, rid(key), &t)?;
    }
    let before: Vec<i32> = index.iter()?.map(|(k, _)| k).collect();

    index.insert(8, rid(8), &t)?;
    index.remove(&8, &t)?;

    let after: Vec<i32> = index.iter()?.map(|(k, _)| k).collect();
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn test_iter_from_positions_at_lower_bound() -> Result<()> {
    let (pool, _file) = create_test_buffer_pool(10, 2)?;
    let index = BTreeIndex::<i32>::new("test_idx", pool, 4, 4);
    let t = txn(1);

    for key in (2..=20).step_by(2) {
        index.insert(key, rid(key), &t)?;
    }

    // Exact hit.
    let keys: Vec<i32> = index.iter_from(&8)?.map(|(k, _)| k).collect();
    assert_eq!(keys, vec![8, 10, 12, 14, 16, 18, 20]);

    // Between keys: starts at the next larger one.
    let keys: Vec<i32> = index.iter_from(&9)?.map(|(k, _)| k).collect();
    assert_eq!(keys, vec![10, 12, 14, 16, 18, 20]);

    // Before the smallest key.
    let keys: Vec<i32> = index.iter_from(&0)?.map(|(k, _)| k).collect();
    assert_eq!(keys.len(), 10);

    // Past the largest key.
    let mut it = index.iter_from(&21)?;
    assert!(it.next().is_none());
    Ok(())
}

#[test]
fn test_string_keys() -> Result<()> {
    let (pool, _file) = create_test_buffer_pool(10, 2)?;
    let index = BTreeIndex::<String>::new("names_idx", pool, 4, 4);
    let t = txn(1);

    for (i, name) in ["cherry", "apple", "banana", "fig", "date"].iter().enumerate() {
        assert!(index.insert(name.to_string(), rid(i as i32), &t)?);
    }

    assert_eq!(index.get(&"banana".to_string())?, Some(rid(2)));
    assert_eq!(index.get(&"grape".to_string())?, None);

    let keys: Vec<String> = index.iter()?.map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["apple", "banana", "cherry", "date", "fig"]);
    Ok(())
}

#[test]
fn test_large_shuffled_workload() -> Result<()> {
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    let (pool, _file) = create_test_buffer_pool(20, 2)?;
    let index = BTreeIndex::<i32>::new("test_idx", pool, 4, 4);
    let t = txn(1);

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut keys: Vec<i32> = (1..=500).collect();
    keys.shuffle(&mut rng);

    for &key in &keys {
        assert!(index.insert(key, rid(key), &t)?);
    }
    let sorted: Vec<i32> = index.iter()?.map(|(k, _)| k).collect();
    assert_eq!(sorted, (1..=500).collect::<Vec<_>>());

    // Remove a shuffled half and verify the survivors.
    let (removed, kept) = keys.split_at(250);
    for key in removed {
        index.remove(key, &t)?;
    }
    for key in removed {
        assert_eq!(index.get(key)?, None);
    }
    let mut kept: Vec<i32> = kept.to_vec();
    kept.sort_unstable();
    let sorted: Vec<i32> = index.iter()?.map(|(k, _)| k).collect();
    assert_eq!(sorted, kept);
    Ok(())
}

#[test]
fn test_concurrent_disjoint_inserts() -> Result<()> {
    init_test_logger();
    let (pool, _file) = create_test_buffer_pool(50, 2)?;
    let index = Arc::new(BTreeIndex::<i32>::new("test_idx", pool, 4, 4));

    let mut handles = Vec::new();
    for worker in 0..4u32 {
        let index = index.clone();
        handles.push(thread::spawn(move || {
            let t = Transaction::new(worker + 1, IsolationLevel::RepeatableRead);
            let base = worker as i32 * 100;
            for key in base..base + 50 {
                index.insert(key, rid(key), &t).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let keys: Vec<i32> = index.iter()?.map(|(k, _)| k).collect();
    assert_eq!(keys.len(), 200);
    assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    for worker in 0..4i32 {
        for key in worker * 100..worker * 100 + 50 {
            assert_eq!(index.get(&key)?, Some(rid(key)));
        }
    }
    Ok(())
}

#[test]
fn test_concurrent_readers_during_inserts() -> Result<()> {
    let (pool, _file) = create_test_buffer_pool(50, 2)?;
    let index = Arc::new(BTreeIndex::<i32>::new("test_idx", pool, 4, 4));

    // Seed half the keys, then read them continuously while a writer adds
    // the other half.
    {
        let t = txn(1);
        for key in (0..200).step_by(2) {
            index.insert(key, rid(key), &t)?;
        }
    }

    let writer = {
        let index = index.clone();
        thread::spawn(move || {
            let t = Transaction::new(2, IsolationLevel::RepeatableRead);
            for key in (1..200).step_by(2) {
                index.insert(key, rid(key), &t).unwrap();
            }
        })
    };
    let reader = {
        let index = index.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                for key in (0..200).step_by(2) {
                    assert_eq!(index.get(&key).unwrap(), Some(rid(key)));
                }
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();

    let keys: Vec<i32> = index.iter()?.map(|(k, _)| k).collect();
    assert_eq!(keys, (0..200).collect::<Vec<_>>());
    Ok(())
}
