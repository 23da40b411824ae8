//! Compares the tree against a linear scan over the appended entries.

use poh_index::{IndexConfig, MemoryNodeStore, PostOrderTree};
use quickcheck::{QuickCheck, TestResult};

fn model_highest(ts: &[i64], at: i64) -> Option<i64> {
    ts.iter().rposition(|&t| t <= at).map(|i| i as i64)
}

fn group_by_leaf(mut picked: Vec<usize>, entries_per_node: usize) -> Option<Vec<Vec<i64>>> {
    if picked.is_empty() {
        return None;
    }
    picked.sort_unstable_by(|a, b| b.cmp(a));

    let mut groups: Vec<Vec<i64>> = Vec::new();
    let mut current_leaf = None;
    for i in picked {
        let leaf = i / entries_per_node;
        if current_leaf != Some(leaf) {
            groups.push(Vec::new());
            current_leaf = Some(leaf);
        }
        if let Some(group) = groups.last_mut() {
            group.push(i as i64);
        }
    }
    Some(groups)
}

fn model_find_all(ts: &[i64], entries_per_node: usize, lo: i64, hi: i64) -> Option<Vec<Vec<i64>>> {
    let picked = (0..ts.len()).filter(|&i| lo <= ts[i] && ts[i] <= hi).collect();
    group_by_leaf(picked, entries_per_node)
}

fn model_min_based(ts: &[i64], entries_per_node: usize, lo: i64, hi: i64) -> Option<Vec<Vec<i64>>> {
    let mut picked: Vec<usize> = (0..ts.len()).filter(|&i| lo <= ts[i] && ts[i] <= hi).collect();
    if let Some(pred) = ts.iter().rposition(|&t| t < lo) {
        picked.push(pred);
    }
    group_by_leaf(picked, entries_per_node)
}

fn prop_matches_model(arity: u8, epn: u8, gaps: Vec<u8>, queries: Vec<(i16, u8)>) -> TestResult {
    let arity = 2 + (arity % 4) as usize;
    let epn = 1 + (epn % 5) as usize;
    let tree = PostOrderTree::new(1, IndexConfig::new(arity, epn), MemoryNodeStore::new())
        .expect("tree");

    let mut ts = Vec::with_capacity(gaps.len());
    let mut now = 0i64;
    for (i, gap) in gaps.iter().enumerate() {
        // gap 0 produces duplicate timestamps
        now += i64::from(gap % 4);
        tree.append(now, i as i64).expect("append");
        ts.push(now);
    }

    for (lo, width) in queries {
        let lo = i64::from(lo).rem_euclid(now + 20) - 5;
        let hi = lo + i64::from(width % 16);
        if tree.find_highest(lo).expect("find_highest") != model_highest(&ts, lo) {
            return TestResult::error(format!("find_highest({lo}) diverged, arity {arity} epn {epn}"));
        }
        let found = tree.find_all(lo, hi).expect("find_all");
        let expected = model_find_all(&ts, epn, lo, hi);
        if found != expected {
            return TestResult::error(format!(
                "find_all({lo}, {hi}) = {found:?}, expected {expected:?}, arity {arity} epn {epn}"
            ));
        }
        let found = tree.find_all_min_based(lo, hi).expect("find_all_min_based");
        let expected = model_min_based(&ts, epn, lo, hi);
        if found != expected {
            return TestResult::error(format!(
                "find_all_min_based({lo}, {hi}) = {found:?}, expected {expected:?}, \
                 arity {arity} epn {epn}"
            ));
        }
    }
    if tree.store().outstanding() != 0 {
        return TestResult::error("unreleased nodes");
    }
    TestResult::passed()
}

#[test]
fn tree_matches_linear_scan() {
    QuickCheck::new()
        .tests(300)
        .quickcheck(prop_matches_model as fn(u8, u8, Vec<u8>, Vec<(i16, u8)>) -> TestResult);
}

#[test]
fn model_reproduces_documented_groups() {
    let ts = [3, 5, 11, 18, 20, 25, 30, 30, 30, 35, 45, 50, 55, 65, 75, 85, 93, 99, 105];
    // the model is zero-based; shift to the 1-based values used elsewhere
    let shifted = |groups: Option<Vec<Vec<i64>>>| {
        groups.map(|g| {
            g.into_iter()
                .map(|v| v.into_iter().map(|x| x + 1).collect())
                .collect::<Vec<Vec<i64>>>()
        })
    };
    assert_eq!(
        shifted(model_min_based(&ts, 3, 30, 30)),
        Some(vec![vec![9, 8, 7], vec![6]])
    );
    assert_eq!(
        shifted(model_min_based(&ts, 3, 82, 98)),
        Some(vec![vec![17, 16], vec![15]])
    );
    assert_eq!(shifted(model_find_all(&ts, 3, 30, 30)), Some(vec![vec![9, 8, 7]]));
    assert_eq!(shifted(model_find_all(&ts, 3, 61, 63)), None);
}
