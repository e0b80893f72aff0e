//! Gas fee estimation
//!
//! London-enabled chains: `2 * base_fee + max_priority_fee`, which keeps a
//! transaction includable through six consecutive full blocks. Legacy chains
//! fall back to a recency-weighted mean of recently observed gas prices.

use super::client::FeeSample;
use std::collections::VecDeque;

pub const DEFAULT_HISTORY_SIZE: usize = 200;

/// Recommended max fee per gas in wei, `None` when the sample has no EIP-1559 data
pub fn recommended_fee(sample: &FeeSample) -> Option<u128> {
    let base = sample.base_fee?;
    Some(
        base.saturating_mul(2)
            .saturating_add(sample.max_priority_fee.unwrap_or(0)),
    )
}

/// Capped history of gas prices, newest last
#[derive(Debug, Clone)]
pub struct GasPriceHistory {
    prices: VecDeque<u128>,
    capacity: usize,
}

impl GasPriceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, price: u128) {
        if self.prices.len() == self.capacity {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Mean weighted by recency: the i-th oldest sample weighs `i`, so the
    /// divisor is `n * (n + 1) / 2`.
    pub fn weighted_mean(&self) -> Option<u128> {
        let n = self.prices.len() as u128;
        if n == 0 {
            return None;
        }
        let weighted: u128 = self
            .prices
            .iter()
            .enumerate()
            .map(|(i, price)| price.saturating_mul(i as u128 + 1))
            .fold(0u128, |acc, v| acc.saturating_add(v));
        Some(weighted / (n * (n + 1) / 2))
    }

    /// Fee estimate for a fresh sample: EIP-1559 when available, else history
    pub fn estimate(&mut self, sample: &FeeSample) -> Option<u128> {
        if let Some(price) = sample.gas_price {
            self.record(price);
        }
        recommended_fee(sample).or_else(|| self.weighted_mean())
    }
}

impl Default for GasPriceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}
