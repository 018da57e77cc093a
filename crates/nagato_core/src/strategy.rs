//! The process-wide, monotone map from `host:port` to the evasion strategy
//! that has been observed to work against that upstream.

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpstreamStrategy {
    Unknown,
    AbsoluteUriHttps,
    OriginFormFragmented,
}

/// Shared across every session; never shrinks, only grows more evasive.
#[derive(Default)]
pub struct StrategyTable {
    inner: DashMap<String, UpstreamStrategy>,
}

impl StrategyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> UpstreamStrategy {
        self.inner
            .get(key)
            .map(|entry| *entry)
            .unwrap_or(UpstreamStrategy::Unknown)
    }

    /// Commits `strategy` for `key`, ignoring the write if the table already
    /// holds something at least as evasive.
    pub fn commit(&self, key: &str, strategy: UpstreamStrategy) {
        self.inner
            .entry(key.to_string())
            .and_modify(|current| {
                if strategy > *current {
                    *current = strategy;
                }
            })
            .or_insert(strategy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_host_defaults_to_unknown_strategy() {
        let table = StrategyTable::new();
        assert_eq!(table.get("example.com:80"), UpstreamStrategy::Unknown);
    }

    #[test]
    fn commit_is_monotone() {
        let table = StrategyTable::new();
        table.commit("example.com:80", UpstreamStrategy::OriginFormFragmented);
        table.commit("example.com:80", UpstreamStrategy::AbsoluteUriHttps);
        assert_eq!(
            table.get("example.com:80"),
            UpstreamStrategy::OriginFormFragmented
        );
    }

    #[test]
    fn commit_upgrades_from_unknown() {
        let table = StrategyTable::new();
        table.commit("example.com:80", UpstreamStrategy::AbsoluteUriHttps);
        assert_eq!(table.get("example.com:80"), UpstreamStrategy::AbsoluteUriHttps);
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        let table = StrategyTable::new();
        table.commit("a.example:80", UpstreamStrategy::OriginFormFragmented);
        assert_eq!(table.get("b.example:80"), UpstreamStrategy::Unknown);
    }
}
