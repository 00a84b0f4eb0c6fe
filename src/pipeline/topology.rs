//! Advisory producer-first ordering of stage copies.
//!
//! A bounded cocktail sort over adjacent pairs with a precedence predicate.
//! The result is used for logging and for the order in which the
//! single-threaded driver visits copies. Channels enforce the real data
//! order, so nothing depends on this being a strict topological order.

use crate::pipeline::definition::Reachability;
use crate::pipeline::id::StageId;

/// Outcome of one sort run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortStats {
    pub iterations: usize,
    pub swaps: usize,
    /// No adjacent pair is out of order at the end
    pub sorted: bool,
}

/// Sort `items` so that, as far as adjacent swaps can tell, an item never
/// sits after something it precedes.
///
/// Each outer iteration runs a forward and a backward pass over the active
/// window. Once three quarters of the item count worth of iterations have
/// run, the window shrinks from whichever end saw no swaps. The sort stops
/// when an iteration swaps nothing, or after `2 * len` iterations.
pub fn cocktail_sort<T>(items: &mut [T], precedes: impl Fn(&T, &T) -> bool) -> SortStats {
    let n = items.len();
    let mut stats = SortStats::default();
    if n < 2 {
        stats.sorted = true;
        return stats;
    }

    let shrink_after = ((n as f64) * 0.75).round() as usize;
    let max_iterations = 2 * n;
    let (mut lo, mut hi) = (0usize, n - 1);

    while stats.iterations < max_iterations && lo < hi {
        stats.iterations += 1;

        let mut forward = 0;
        for y in lo..hi {
            if precedes(&items[y + 1], &items[y]) {
                items.swap(y, y + 1);
                forward += 1;
            }
        }

        let mut backward = 0;
        for z in (lo + 1..=hi).rev() {
            if precedes(&items[z], &items[z - 1]) {
                items.swap(z, z - 1);
                backward += 1;
            }
        }

        stats.swaps += forward + backward;
        if forward + backward == 0 {
            break;
        }

        if stats.iterations >= shrink_after {
            if forward == 0 && hi > lo {
                hi -= 1;
            }
            if backward == 0 && lo < hi {
                lo += 1;
            }
        }
    }

    stats.sorted = items.windows(2).all(|w| !precedes(&w[1], &w[0]));
    stats
}

/// Precedence of stage copies: upstream stages first, then copy order
/// within one stage.
pub fn copy_precedes(reach: &Reachability, a: (StageId, usize), b: (StageId, usize)) -> bool {
    if a.0 == b.0 {
        a.1 < b.1
    } else {
        reach.is_upstream(a.0, b.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::definition::{PipelineDefinition, StageDefinition};
    use proptest::prelude::*;

    fn chain(n: usize) -> PipelineDefinition {
        let mut def = PipelineDefinition::new("chain");
        for i in 0..n {
            def = def.stage(StageDefinition::new(format!("s{}", i), "dummy"));
        }
        for i in 1..n {
            def = def.hop(format!("s{}", i - 1), format!("s{}", i));
        }
        def
    }

    #[test]
    fn test_sorts_reversed_chain() {
        let def = chain(6);
        let reach = def.reachability();
        let mut items: Vec<(StageId, usize)> = (0..6u32).rev().map(|i| (StageId(i), 0)).collect();
        let stats = cocktail_sort(&mut items, |a, b| copy_precedes(&reach, *a, *b));
        assert!(stats.sorted);
        assert!(stats.swaps > 0);
        let order: Vec<u32> = items.iter().map(|(s, _)| s.0).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_copies_of_one_stage_keep_copy_order() {
        let def = chain(2);
        let reach = def.reachability();
        let mut items = vec![
            (StageId(1), 1),
            (StageId(0), 1),
            (StageId(1), 0),
            (StageId(0), 0),
        ];
        cocktail_sort(&mut items, |a, b| copy_precedes(&reach, *a, *b));
        assert_eq!(
            items,
            vec![(StageId(0), 0), (StageId(0), 1), (StageId(1), 0), (StageId(1), 1)]
        );
    }

    #[test]
    fn test_sorted_input_needs_no_swaps() {
        let def = chain(4);
        let reach = def.reachability();
        let mut items: Vec<_> = (0..4u32).map(|i| (StageId(i), 0)).collect();
        let stats = cocktail_sort(&mut items, |a, b| copy_precedes(&reach, *a, *b));
        assert_eq!(stats.swaps, 0);
        assert_eq!(stats.iterations, 1);
    }

    #[test]
    fn test_trivial_lists() {
        let mut empty: Vec<u8> = vec![];
        assert!(cocktail_sort(&mut empty, |a, b| a < b).sorted);
        let mut one = vec![1];
        assert_eq!(cocktail_sort(&mut one, |a, b| a < b).swaps, 0);
    }

    /// Random DAG: edges only go from lower to higher stage index.
    fn dag_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>, Vec<usize>)> {
        (2usize..9).prop_flat_map(|n| {
            let edges = proptest::collection::vec((0..n, 0..n), 0..(n * 2))
                .prop_map(|es| es.into_iter().filter(|(a, b)| a < b).collect::<Vec<_>>());
            let order = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
            (Just(n), edges, order)
        })
    }

    proptest! {
        #[test]
        fn prop_sort_is_idempotent((n, edges, order) in dag_strategy()) {
            let mut def = PipelineDefinition::new("dag");
            for i in 0..n {
                def = def.stage(StageDefinition::new(format!("s{}", i), "dummy"));
            }
            for (a, b) in edges {
                def = def.hop(format!("s{}", a), format!("s{}", b));
            }
            let reach = def.reachability();
            let mut items: Vec<(StageId, usize)> =
                order.into_iter().map(|i| (StageId(i as u32), 0)).collect();

            let first = cocktail_sort(&mut items, |a, b| copy_precedes(&reach, *a, *b));
            prop_assert!(first.iterations <= 2 * n);
            if first.sorted {
                let before = items.clone();
                let second = cocktail_sort(&mut items, |a, b| copy_precedes(&reach, *a, *b));
                prop_assert_eq!(second.swaps, 0);
                prop_assert_eq!(items, before);
            }
        }
    }
}
