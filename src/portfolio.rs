//! Portfolio valuation over REST ticker snapshots.
//!
//! Each balance is valued in every target currency using the direct pair's
//! last price, falling back to the reverse pair (dividing instead of
//! multiplying) when the direct market does not exist.

use std::collections::{BTreeSet, HashMap};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BitfinexError;
use crate::rest::RestClient;

/// Currencies a portfolio is valued in by default.
pub const DEFAULT_TARGETS: [&str; 5] = ["USD", "BTC", "XRP", "XMR", "DASH"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    pub amount: Decimal,
}

/// A set of balances, as loaded from a `{"currencies":[...]}` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub currencies: Vec<BalanceEntry>,
}

impl Portfolio {
    pub fn from_json(json: &str) -> Result<Self, BitfinexError> {
        serde_json::from_str(json).map_err(Into::into)
    }
}

/// The portfolio's total value expressed in one target currency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioValuation {
    pub currency: String,
    pub total_value: Decimal,
}

pub struct PortfolioCalculator {
    rest: RestClient,
    targets: Vec<String>,
}

impl PortfolioCalculator {
    pub fn new(rest: RestClient) -> Self {
        Self::with_targets(rest, DEFAULT_TARGETS.iter().map(|t| t.to_string()).collect())
    }

    pub fn with_targets(rest: RestClient, targets: Vec<String>) -> Self {
        Self { rest, targets }
    }

    /// Value `portfolio` in every target currency.
    pub async fn calculate(
        &self,
        portfolio: &Portfolio,
    ) -> Result<Vec<PortfolioValuation>, BitfinexError> {
        if portfolio.currencies.is_empty() {
            return Ok(Vec::new());
        }
        let rates = self.fetch_rates(portfolio).await?;
        valuations(&portfolio.currencies, &rates, &self.targets)
    }

    /// Fetch last prices for every (held, target) pair, keyed by the
    /// symbol that actually traded (direct or reverse).
    async fn fetch_rates(
        &self,
        portfolio: &Portfolio,
    ) -> Result<HashMap<String, Decimal>, BitfinexError> {
        let held: BTreeSet<&str> = portfolio
            .currencies
            .iter()
            .map(|entry| entry.symbol.as_str())
            .collect();

        let mut rates = HashMap::new();
        for from in held {
            for to in &self.targets {
                if from == to.as_str() {
                    continue;
                }
                let direct = format!("t{from}{to}");
                let reverse = format!("t{to}{from}");
                if rates.contains_key(&direct) || rates.contains_key(&reverse) {
                    continue;
                }

                match self.last_price(&direct).await {
                    Some(price) => {
                        debug!(symbol = %direct, %price, "rate found");
                        rates.insert(direct, price);
                    }
                    None => match self.last_price(&reverse).await {
                        Some(price) => {
                            debug!(symbol = %reverse, %price, "reverse rate found");
                            rates.insert(reverse, price);
                        }
                        None => {
                            return Err(BitfinexError::MissingRate {
                                from: from.to_string(),
                                to: to.clone(),
                            });
                        }
                    },
                }
            }
        }
        Ok(rates)
    }

    async fn last_price(&self, symbol: &str) -> Option<Decimal> {
        match self.rest.get_ticker(symbol).await {
            Ok(ticker) if ticker.last_price > Decimal::ZERO => Some(ticker.last_price),
            Ok(_) => None,
            Err(e) => {
                warn!(%symbol, "ticker fetch failed: {e}");
                None
            }
        }
    }
}

/// Pure valuation arithmetic over a prefetched rate table. Totals are
/// rounded to two decimal places.
pub fn valuations(
    balances: &[BalanceEntry],
    rates: &HashMap<String, Decimal>,
    targets: &[String],
) -> Result<Vec<PortfolioValuation>, BitfinexError> {
    let mut result = Vec::with_capacity(targets.len());
    for target in targets {
        let mut total = Decimal::ZERO;
        for entry in balances {
            if entry.symbol == *target {
                total += entry.amount;
                continue;
            }
            let direct = format!("t{}{}", entry.symbol, target);
            let reverse = format!("t{}{}", target, entry.symbol);
            if let Some(rate) = rates.get(&direct) {
                total += entry.amount * *rate;
            } else if let Some(rate) = rates.get(&reverse).filter(|rate| !rate.is_zero()) {
                total += entry.amount / *rate;
            } else {
                return Err(BitfinexError::MissingRate {
                    from: entry.symbol.clone(),
                    to: target.clone(),
                });
            }
        }
        result.push(PortfolioValuation {
            currency: target.clone(),
            total_value: total.round_dp(2),
        });
    }
    Ok(result)
}
