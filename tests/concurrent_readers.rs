use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use poh_index::{IndexConfig, MemoryNodeStore, PostOrderTree};

const ENTRIES: i64 = 3_000;

#[test]
fn readers_see_consistent_prefixes_while_writer_appends() {
    let store = Arc::new(MemoryNodeStore::new());
    let tree = PostOrderTree::new(3, IndexConfig::new(3, 4), Arc::clone(&store)).expect("tree");
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        for reader in 0..4 {
            let tree = &tree;
            let done = &done;
            scope.spawn(move || {
                let mut queries = 0u64;
                while !done.load(Ordering::Acquire) || queries < 100 {
                    let ts = (queries as i64 * 37 + reader) % ENTRIES * 2;
                    // entry i sits at timestamp 2 * i with value i
                    let visible = tree.entry_count() as i64;
                    let found = tree.find_highest(ts).expect("find_highest");
                    if visible > ts / 2 {
                        assert_eq!(found, Some(ts / 2), "find_highest({ts})");
                    } else if let Some(value) = found {
                        assert!(value <= ts / 2, "find_highest({ts}) = {value}");
                    }
                    if let Some(groups) = tree.find_all(ts, ts + 10).expect("find_all") {
                        let values: Vec<i64> = groups.into_iter().flatten().collect();
                        assert!(values.windows(2).all(|w| w[0] == w[1] + 1), "{values:?}");
                    }
                    queries += 1;
                }
            });
        }

        for i in 0..ENTRIES {
            tree.append(i * 2, i).expect("append");
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(tree.entry_count(), ENTRIES as u64);
    assert_eq!(tree.find_highest(i64::MAX).expect("query"), Some(ENTRIES - 1));
    assert_eq!(store.outstanding(), 0);
}
