use crate::background::BackgroundTask;
use crate::batch::{BatchRequest, ReadBatcher, ReadError};
use crate::pricing::{PairReserves, PairSlots, PriceOracle, PricedToken};
use crate::tokens::{DescriptorCache, Holdings, TokenAggregator};
use alloy_primitives::Address;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// A token valued through one AMM pair against the quote asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedToken {
    pub token: Address,
    pub pair: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackedTokenError {
    #[error("expected token:pair, got {0}")]
    Malformed(String),
    #[error("invalid address {0}")]
    InvalidAddress(String),
}

impl FromStr for TrackedToken {
    type Err = TrackedTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (token, pair) = s
            .split_once(':')
            .ok_or_else(|| TrackedTokenError::Malformed(s.to_string()))?;
        let parse = |raw: &str| {
            let raw = raw.trim();
            Address::from_str(raw).map_err(|_| TrackedTokenError::InvalidAddress(raw.to_string()))
        };
        Ok(TrackedToken {
            token: parse(token)?,
            pair: parse(pair)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Valuation {
    /// No connected account, nothing was read.
    Disabled,
    Priced(Vec<PricedToken>),
}

impl Valuation {
    pub fn tokens(&self) -> &[PricedToken] {
        match self {
            Valuation::Disabled => &[],
            Valuation::Priced(tokens) => tokens,
        }
    }

    pub fn total_usd(&self) -> Decimal {
        self.tokens().iter().fold(Decimal::ZERO, |total, token| {
            total.saturating_add(token.usd_balance)
        })
    }
}

/// Values tracked tokens of one account on one chain.
pub struct Portfolio {
    aggregator: TokenAggregator,
    batcher: Arc<ReadBatcher>,
    oracle: PriceOracle,
    chain_id: u64,
}

impl Portfolio {
    pub fn new(
        batcher: Arc<ReadBatcher>,
        cache: DescriptorCache,
        oracle: PriceOracle,
        chain_id: u64,
    ) -> Self {
        Self {
            aggregator: TokenAggregator::new(batcher.clone(), cache),
            batcher,
            oracle,
            chain_id,
        }
    }

    pub fn oracle(&self) -> &PriceOracle {
        &self.oracle
    }

    /// Reads token records and pair reserves as two concurrent batches, then
    /// prices every token that resolved. Tokens keep the tracked order.
    pub async fn value(
        &self,
        owner: Option<Address>,
        tracked: &[TrackedToken],
    ) -> Result<Valuation, ReadError> {
        let tokens: Vec<Address> = tracked.iter().map(|t| t.token).collect();

        let started = Instant::now();
        let (holdings, reserves) = tokio::try_join!(
            self.aggregator.fetch(self.chain_id, owner, &tokens),
            self.read_pairs(owner.is_some(), tracked),
        )?;
        info!(
            "Fetched {} token records and {} pair reserves in {:?}",
            holdings.balances().len(),
            reserves.len(),
            started.elapsed()
        );

        let Holdings::Loaded(balances) = holdings else {
            return Ok(Valuation::Disabled);
        };

        let priced: Vec<PricedToken> = balances
            .into_iter()
            .map(|balance| {
                let pair = reserves.get(&balance.token.address);
                self.oracle.value(balance, pair)
            })
            .collect();
        info!("Valued {} tokens on chain {}", priced.len(), self.chain_id);
        Ok(Valuation::Priced(priced))
    }

    async fn read_pairs(
        &self,
        enabled: bool,
        tracked: &[TrackedToken],
    ) -> Result<HashMap<Address, PairReserves>, ReadError> {
        let mut request = BatchRequest::new().enabled_when(enabled);
        let slots: Vec<(Address, PairSlots)> = tracked
            .iter()
            .map(|t| (t.token, PairSlots::schedule(&mut request, t.pair)))
            .collect();

        let Some(response) = self
            .batcher
            .execute(self.chain_id, &request)
            .await?
            .into_response()
        else {
            return Ok(HashMap::new());
        };

        Ok(slots
            .into_iter()
            .filter_map(|(token, slots)| match slots.collect(&response) {
                Some(reserves) => Some((token, reserves)),
                None => {
                    warn!(
                        "Reserves for token {:?} unavailable, leaving it unpriced",
                        token
                    );
                    None
                }
            })
            .collect())
    }

    /// Runs [`Portfolio::value`] off the caller's task.
    pub fn spawn_valuation(
        self: Arc<Self>,
        owner: Option<Address>,
        tracked: Vec<TrackedToken>,
    ) -> BackgroundTask<Valuation> {
        BackgroundTask::spawn("portfolio valuation", async move {
            self.value(owner, &tracked).await
        })
    }
}

/// A position reported by a lending market, taken as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LendingPosition {
    pub owner: Address,
    pub market: String,
    pub asset_symbol: String,
    pub balance: Decimal,
    pub usd_value: Decimal,
    pub apy: Decimal,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("reading position feed {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed position feed {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait PositionFeed: Send + Sync {
    async fn positions(&self, owner: Address) -> Result<Vec<LendingPosition>, FeedError>;
}

/// Positions exported to a JSON array on disk.
pub struct JsonPositionFeed {
    path: PathBuf,
}

impl JsonPositionFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PositionFeed for JsonPositionFeed {
    async fn positions(&self, owner: Address) -> Result<Vec<LendingPosition>, FeedError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| FeedError::Io {
                path: self.path.clone(),
                source,
            })?;
        let positions: Vec<LendingPosition> =
            serde_json::from_str(&raw).map_err(|source| FeedError::Malformed {
                path: self.path.clone(),
                source,
            })?;

        Ok(positions.into_iter().filter(|p| p.owner == owner).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortfolioSummary {
    pub tokens_usd: Decimal,
    pub lending_usd: Decimal,
    pub total_usd: Decimal,
}

impl PortfolioSummary {
    pub fn new(valuation: &Valuation, lending: &[LendingPosition]) -> Self {
        let tokens_usd = valuation.total_usd();
        let lending_usd = lending
            .iter()
            .fold(Decimal::ZERO, |total, p| total.saturating_add(p.usd_value));
        Self {
            tokens_usd,
            lending_usd,
            total_usd: tokens_usd.saturating_add(lending_usd),
        }
    }
}
