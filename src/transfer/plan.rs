//! Strategy selection for a single transfer.

use serde::Serialize;

/// Which way bytes move.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Operator to target.
    Upload,
    /// Target to operator.
    Download,
}

/// How bytes move.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Embedded in the agent protocol.
    Direct,
    /// Through a temporary relay object and grant.
    Relayed,
}

/// Picks [`Strategy::Direct`] strictly below `threshold`.
#[must_use]
pub const fn choose_strategy(size: u64, threshold: u64) -> Strategy {
    if size < threshold {
        Strategy::Direct
    } else {
        Strategy::Relayed
    }
}

/// Immutable description of one transfer, computed once per request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TransferPlan {
    source: String,
    destination: String,
    direction: Direction,
    size: u64,
    strategy: Strategy,
}

impl TransferPlan {
    /// Plans a transfer of `size` bytes against `threshold`.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        direction: Direction,
        size: u64,
        threshold: u64,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            direction,
            size,
            strategy: choose_strategy(size, threshold),
        }
    }

    /// Where bytes come from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Where bytes go.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Upload or download.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Payload size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Chosen strategy.
    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MIB: u64 = 1024 * 1024;

    #[rstest]
    #[case(0, Strategy::Direct)]
    #[case(MIB - 1, Strategy::Direct)]
    #[case(MIB, Strategy::Relayed)]
    #[case(2 * MIB, Strategy::Relayed)]
    fn threshold_boundary_is_inclusive_for_the_relay(#[case] size: u64, #[case] expected: Strategy) {
        let plan = TransferPlan::new("a", "b", Direction::Upload, size, MIB);
        assert_eq!(plan.strategy(), expected);
    }

    #[test]
    fn strategy_is_monotonic_in_size() {
        let threshold = 4096;
        let mut seen_relay = false;
        for size in (0..3 * threshold).step_by(97) {
            match choose_strategy(size, threshold) {
                Strategy::Direct => assert!(!seen_relay, "direct after relay at {size}"),
                Strategy::Relayed => seen_relay = true,
            }
        }
        assert!(seen_relay);
    }
}
