//! Channel selection strategies.

use crate::rpc::config::SelectionStrategy;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks which of a connection's channels carries the next send
pub trait ChannelSelector: Send + Sync + fmt::Debug {
    /// Return an index in `0..channels`. `channels` is never zero.
    fn select(&self, channels: usize) -> usize;
}

/// Uniformly random choice
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl ChannelSelector for RandomSelector {
    fn select(&self, channels: usize) -> usize {
        rand::thread_rng().gen_range(0..channels)
    }
}

/// Cycles through channels in order
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl ChannelSelector for RoundRobinSelector {
    fn select(&self, channels: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % channels
    }
}

impl SelectionStrategy {
    /// Build a selector for this strategy
    pub fn selector(self) -> Box<dyn ChannelSelector> {
        match self {
            SelectionStrategy::Random => Box::new(RandomSelector),
            SelectionStrategy::RoundRobin => Box::new(RoundRobinSelector::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_cycles() {
        let selector = RoundRobinSelector::default();
        let picks: Vec<_> = (0..6).map(|_| selector.select(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_random_in_range() {
        let selector = RandomSelector;
        for _ in 0..1000 {
            assert!(selector.select(4) < 4);
        }
        assert_eq!(selector.select(1), 0);
    }

    #[test]
    fn test_strategy_builds_selector() {
        let selector = SelectionStrategy::RoundRobin.selector();
        assert_eq!(selector.select(2), 0);
        assert_eq!(selector.select(2), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_round_robin_visits_every_channel(channels in 1usize..64, rounds in 1usize..4) {
            let selector = RoundRobinSelector::default();
            let mut hits = vec![0usize; channels];
            for _ in 0..channels * rounds {
                hits[selector.select(channels)] += 1;
            }
            proptest::prop_assert!(hits.iter().all(|&h| h == rounds));
        }

        #[test]
        fn prop_selectors_stay_in_range(channels in 1usize..64) {
            for strategy in [SelectionStrategy::Random, SelectionStrategy::RoundRobin] {
                let selector = strategy.selector();
                for _ in 0..16 {
                    proptest::prop_assert!(selector.select(channels) < channels);
                }
            }
        }
    }
}
