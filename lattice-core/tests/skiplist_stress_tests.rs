use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use lattice_core::Skiplist;

#[test]
fn test_concurrent_disjoint_inserts() {
    let list: Arc<Skiplist<u32>> = Arc::new(Skiplist::new());
    let num_threads = 16u32;
    let per_thread = 62_500u32;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                let base = t * per_thread;
                for i in base..base + per_thread {
                    list.insert(i);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let items = list.to_vec();
    assert_eq!(items.len(), 1_000_000);
    for (expected, item) in items.into_iter().enumerate() {
        assert_eq!(item as usize, expected);
    }
}

#[test]
fn test_concurrent_insert_delete_same_values() {
    let list: Arc<Skiplist<usize>> = Arc::new(Skiplist::new());
    let num_threads = 8;
    let values = 200usize;

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                for _ in 0..20 {
                    for i in 0..values {
                        list.insert(i);
                    }
                    for i in 0..values {
                        list.delete(&i);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // Every thread deleted as many of each value as it inserted.
    assert!(list.is_empty());
    let stats = list.stats();
    assert_eq!(stats.node_count, 0);
}

#[test]
fn test_concurrent_mixed_operations_stay_sorted() {
    let list: Arc<Skiplist<u64>> = Arc::new(Skiplist::new());
    let num_threads = 12;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let list = Arc::clone(&list);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..2_000u64 {
                    match t % 3 {
                        0 => {
                            list.insert(t as u64 * 10_000 + i);
                        }
                        1 => {
                            list.insert(i);
                            list.delete(&i);
                        }
                        _ => {
                            list.contains(&i);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let items = list.to_vec();
    for window in items.windows(2) {
        assert!(window[0] <= window[1], "list out of order");
    }
}

#[test]
fn test_readers_survive_concurrent_deletes() {
    let list: Arc<Skiplist<u64>> = Arc::new(Skiplist::new());
    for i in 0..10_000 {
        list.insert(i);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let list = Arc::clone(&list);
        let stop = Arc::clone(&stop);
        let seen = Arc::clone(&seen);
        handles.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let mut iter = list.iter();
                iter.seek_first();
                let mut prev = None;
                while iter.valid() {
                    let item = *iter.item().unwrap();
                    if let Some(p) = prev {
                        assert!(p <= item, "scan out of order");
                    }
                    prev = Some(item);
                    seen.fetch_add(1, Ordering::Relaxed);
                    iter.next();
                }
            }
        }));
    }

    // Deleters sweep the whole key space out from under the readers.
    for t in 0..2 {
        let list = Arc::clone(&list);
        handles.push(thread::spawn(move || {
            for i in (t..10_000u64).step_by(2) {
                list.delete(&i);
            }
        }));
    }

    // Let the scans overlap the deletes, then wind down.
    thread::sleep(std::time::Duration::from_millis(200));
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(list.is_empty());
    assert!(seen.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_quiescent_structure_has_no_stale_nodes() {
    let list: Arc<Skiplist<u32>> = Arc::new(Skiplist::new());
    let num_threads = 8;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                let base = t * 1_000;
                for i in base..base + 1_000 {
                    list.insert(i);
                }
                // Delete the lower half of this thread's range.
                for i in base..base + 500 {
                    assert!(list.delete(&i));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // A final walk must see exactly the live items, each once.
    let items = list.to_vec();
    assert_eq!(items.len(), num_threads as usize * 500);
    for chunk in 0..num_threads {
        for i in chunk * 1_000 + 500..chunk * 1_000 + 1_000 {
            assert!(list.contains(&i));
        }
        for i in chunk * 1_000..chunk * 1_000 + 500 {
            assert!(!list.contains(&i));
        }
    }

    let stats = list.stats();
    assert_eq!(stats.node_count as usize, num_threads as usize * 500);
}
