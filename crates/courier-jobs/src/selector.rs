//! Queue ordering for each dequeue attempt.

use courier_config::QueuesConfig;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};

/// How queues are ordered on each dequeue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// First queue picked with probability proportional to its weight.
    Weighted,
    /// Higher weight always drained first.
    Strict,
}

/// Produces the queue order for a dequeue attempt.
#[derive(Debug, Clone)]
pub struct QueueSelector {
    mode: SelectionMode,
    /// Each queue repeated `weight` times.
    expanded: Vec<String>,
    /// Queues by descending weight, ties broken by name.
    strict: Vec<String>,
}

impl QueueSelector {
    /// Creates a selector from queue weights. Zero weights are skipped.
    pub fn new(weights: &BTreeMap<String, u32>, mode: SelectionMode) -> Self {
        let mut strict: Vec<(&String, u32)> = weights
            .iter()
            .filter(|(_, w)| **w > 0)
            .map(|(q, w)| (q, *w))
            .collect();
        strict.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let expanded = strict
            .iter()
            .flat_map(|(q, w)| std::iter::repeat((*q).clone()).take(*w as usize))
            .collect();

        Self {
            mode,
            expanded,
            strict: strict.into_iter().map(|(q, _)| q.clone()).collect(),
        }
    }

    /// Creates a selector from queue configuration.
    pub fn from_config(config: &QueuesConfig) -> Self {
        let mode = if config.strict_priority {
            SelectionMode::Strict
        } else {
            SelectionMode::Weighted
        };
        Self::new(&config.weights, mode)
    }

    /// Selection mode.
    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// All queue names, highest weight first.
    pub fn queues(&self) -> &[String] {
        &self.strict
    }

    /// Queue order for the next dequeue attempt.
    pub fn order(&self) -> Vec<String> {
        self.order_with(&mut rand::thread_rng())
    }

    /// Queue order for the next dequeue attempt, using `rng` for shuffling.
    pub fn order_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<String> {
        match self.mode {
            SelectionMode::Strict => self.strict.clone(),
            SelectionMode::Weighted => {
                let mut shuffled: Vec<&String> = self.expanded.iter().collect();
                shuffled.shuffle(rng);

                let mut seen = HashSet::with_capacity(self.strict.len());
                shuffled
                    .into_iter()
                    .filter(|q| seen.insert(q.as_str()))
                    .cloned()
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn weights() -> BTreeMap<String, u32> {
        BTreeMap::from([
            ("critical".to_string(), 6),
            ("default".to_string(), 3),
            ("low".to_string(), 1),
        ])
    }

    #[test]
    fn test_strict_order() {
        let mut w = weights();
        w.insert("bulk".to_string(), 1);
        let selector = QueueSelector::new(&w, SelectionMode::Strict);
        assert_eq!(selector.order(), vec!["critical", "default", "bulk", "low"]);
    }

    #[test]
    fn test_weighted_includes_every_queue_once() {
        let selector = QueueSelector::new(&weights(), SelectionMode::Weighted);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let mut order = selector.order_with(&mut rng);
            assert_eq!(order.len(), 3);
            order.sort();
            assert_eq!(order, vec!["critical", "default", "low"]);
        }
    }

    #[test]
    fn test_weighted_first_pick_converges_to_weights() {
        let selector = QueueSelector::new(&weights(), SelectionMode::Weighted);
        let mut rng = StdRng::seed_from_u64(42);
        let rounds = 20_000;

        let mut firsts: HashMap<String, usize> = HashMap::new();
        for _ in 0..rounds {
            let order = selector.order_with(&mut rng);
            *firsts.entry(order[0].clone()).or_default() += 1;
        }

        let ratio = |q: &str| firsts.get(q).copied().unwrap_or(0) as f64 / rounds as f64;
        assert!((ratio("critical") - 0.6).abs() < 0.03, "critical {}", ratio("critical"));
        assert!((ratio("default") - 0.3).abs() < 0.03, "default {}", ratio("default"));
        assert!((ratio("low") - 0.1).abs() < 0.03, "low {}", ratio("low"));
    }

    #[test]
    fn test_zero_weight_skipped() {
        let mut w = weights();
        w.insert("off".to_string(), 0);
        let selector = QueueSelector::new(&w, SelectionMode::Weighted);
        assert!(!selector.order().contains(&"off".to_string()));
        assert_eq!(selector.queues().len(), 3);
    }

    #[test]
    fn test_from_config() {
        let config = QueuesConfig {
            strict_priority: true,
            ..QueuesConfig::default()
        };
        assert_eq!(QueueSelector::from_config(&config).mode(), SelectionMode::Strict);
    }
}
