//! Proxy rotation for audit runs. A rotator hands out proxy URLs according
//! to the configured strategy; the browser client applies the value at its
//! next connect or reconnect.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::Deserialize;
use std::collections::VecDeque;
use tracing::warn;

use crate::config::ProxySection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStrategy {
    /// Direct connections, no proxy ever.
    #[default]
    None,
    /// Pick one proxy when the run starts and keep it for every query.
    PerSite,
    /// Rotate through the pool, reshuffling once each server has been used.
    PerQuery,
}

impl ProxyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStrategy::None => "none",
            ProxyStrategy::PerSite => "per_site",
            ProxyStrategy::PerQuery => "per_query",
        }
    }
}

impl std::fmt::Display for ProxyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct ProxyRotator {
    strategy: ProxyStrategy,
    servers: Vec<String>,
    queue: VecDeque<String>,
    pinned: Option<String>,
    rng: ChaCha20Rng,
}

impl ProxyRotator {
    pub fn new(section: &ProxySection) -> Self {
        let mut rng = match section.seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        if section.strategy != ProxyStrategy::None && section.servers.is_empty() {
            warn!(
                strategy = %section.strategy,
                "Proxy strategy configured without servers, running direct"
            );
        }
        let pinned = if section.strategy == ProxyStrategy::PerSite {
            section.servers.choose(&mut rng).cloned()
        } else {
            None
        };
        Self {
            strategy: section.strategy,
            servers: section.servers.clone(),
            queue: VecDeque::new(),
            pinned,
            rng,
        }
    }

    pub fn strategy(&self) -> ProxyStrategy {
        self.strategy
    }

    /// Returns the proxy to use for the next connection, or `None` for a
    /// direct connection. Per-query rotation drains a shuffled copy of the
    /// pool so every server is used once before any repeats.
    pub fn next(&mut self) -> Option<String> {
        if self.servers.is_empty() {
            return None;
        }
        match self.strategy {
            ProxyStrategy::None => None,
            ProxyStrategy::PerSite => self.pinned.clone(),
            ProxyStrategy::PerQuery => {
                if self.queue.is_empty() {
                    let mut round = self.servers.clone();
                    round.shuffle(&mut self.rng);
                    self.queue.extend(round);
                }
                self.queue.pop_front()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn section(strategy: ProxyStrategy, servers: &[&str], seed: u64) -> ProxySection {
        ProxySection {
            strategy,
            servers: servers.iter().map(|server| server.to_string()).collect(),
            seed: Some(seed),
        }
    }

    #[test]
    fn none_strategy_always_runs_direct() {
        let mut rotator = ProxyRotator::new(&section(
            ProxyStrategy::None,
            &["http://proxy-a:3128"],
            1,
        ));
        assert_eq!(rotator.next(), None);
        assert_eq!(rotator.next(), None);
    }

    #[test]
    fn per_site_pins_a_single_server() {
        let mut rotator = ProxyRotator::new(&section(
            ProxyStrategy::PerSite,
            &["http://proxy-a:3128", "http://proxy-b:3128"],
            42,
        ));
        let first = rotator.next();
        assert!(first.is_some());
        for _ in 0..5 {
            assert_eq!(rotator.next(), first);
        }
    }

    #[test]
    fn per_query_uses_each_server_once_per_round() {
        let servers = ["http://a:1", "http://b:1", "http://c:1"];
        let mut rotator = ProxyRotator::new(&section(ProxyStrategy::PerQuery, &servers, 7));
        for _ in 0..4 {
            let mut round: Vec<String> = (0..servers.len())
                .filter_map(|_| rotator.next())
                .collect();
            round.sort();
            assert_eq!(round, vec!["http://a:1", "http://b:1", "http://c:1"]);
        }
    }

    #[test]
    fn per_query_distribution_is_even() {
        let servers = ["http://a:1", "http://b:1", "http://c:1"];
        let mut rotator = ProxyRotator::new(&section(ProxyStrategy::PerQuery, &servers, 9));
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..12 {
            let proxy = rotator.next().unwrap();
            *counts.entry(proxy).or_default() += 1;
        }
        assert!(counts.values().all(|count| *count == 4));
    }

    #[test]
    fn seeded_rotators_agree() {
        let servers = ["http://a:1", "http://b:1", "http://c:1", "http://d:1"];
        let mut left = ProxyRotator::new(&section(ProxyStrategy::PerQuery, &servers, 11));
        let mut right = ProxyRotator::new(&section(ProxyStrategy::PerQuery, &servers, 11));
        for _ in 0..8 {
            assert_eq!(left.next(), right.next());
        }
    }

    #[test]
    fn empty_pool_with_rotation_strategy_runs_direct() {
        let mut rotator = ProxyRotator::new(&section(ProxyStrategy::PerQuery, &[], 3));
        assert_eq!(rotator.next(), None);
    }
}
