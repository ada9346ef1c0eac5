//! Concentrated-liquidity positions held through a NonfungiblePositionManager.

use crate::batch::{BatchRequest, BatchResponse, ReadBatcher, ReadError, Slot};
use crate::contracts::INonfungiblePositionManager;
use alloy_primitives::{Address, U256};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

pub const POSITIONS_PAGE_SIZE: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum LiquidityError {
    #[error("pages start at 1")]
    InvalidPage,
    #[error("position count of {owner:?} unavailable")]
    CountUnavailable { owner: Address },
    #[error(transparent)]
    Read(#[from] ReadError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiquidityPosition {
    pub token_id: U256,
    pub token0: Address,
    pub token1: Address,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub liquidity: u128,
    pub fee_growth_inside0_last_x128: U256,
    pub fee_growth_inside1_last_x128: U256,
    pub tokens_owed0: u128,
    pub tokens_owed1: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionPage {
    /// Positions the owner holds in total.
    pub total: u64,
    /// 1-based.
    pub page: u64,
    pub positions: Vec<LiquidityPosition>,
}

impl PositionPage {
    pub fn page_count(&self) -> u64 {
        self.total.div_ceil(POSITIONS_PAGE_SIZE)
    }
}

pub struct LiquidityReader {
    batcher: Arc<ReadBatcher>,
    chain_id: u64,
    manager: Address,
}

impl LiquidityReader {
    pub fn new(batcher: Arc<ReadBatcher>, chain_id: u64, manager: Address) -> Self {
        Self {
            batcher,
            chain_id,
            manager,
        }
    }

    /// Reads one page of positions in three dependent batches: the count, the
    /// token ids of the page window, then the positions. Ids or positions that
    /// fail to read are left out. `None` when no owner is connected.
    pub async fn page(
        &self,
        owner: Option<Address>,
        page: u64,
    ) -> Result<Option<PositionPage>, LiquidityError> {
        if page == 0 {
            return Err(LiquidityError::InvalidPage);
        }
        let Some(owner) = owner else {
            return Ok(None);
        };

        let mut count_request = BatchRequest::new();
        let count = count_request.add(
            self.manager,
            INonfungiblePositionManager::balanceOfCall { owner },
        );
        let Some(response) = self.read(&count_request).await? else {
            return Ok(None);
        };
        let total = response
            .decode(&count)
            .ok_or(LiquidityError::CountUnavailable { owner })?;
        let total = u64::try_from(total).unwrap_or(u64::MAX);

        let start = (page - 1).saturating_mul(POSITIONS_PAGE_SIZE);
        let end = start.saturating_add(POSITIONS_PAGE_SIZE).min(total);
        debug!(
            "Reading positions {}..{} of {} for {:?}",
            start, end, total, owner
        );

        let token_ids = self.token_ids(owner, start..end).await?;
        let positions = self.positions(&token_ids).await?;
        info!(
            "Loaded {} positions on page {} for {:?}",
            positions.len(),
            page,
            owner
        );

        Ok(Some(PositionPage {
            total,
            page,
            positions,
        }))
    }

    async fn token_ids(
        &self,
        owner: Address,
        window: std::ops::Range<u64>,
    ) -> Result<Vec<U256>, ReadError> {
        if window.is_empty() {
            return Ok(Vec::new());
        }
        let mut request = BatchRequest::new();
        let slots: Vec<Slot<INonfungiblePositionManager::tokenOfOwnerByIndexCall>> = window
            .map(|index| {
                request.add(
                    self.manager,
                    INonfungiblePositionManager::tokenOfOwnerByIndexCall {
                        owner,
                        index: U256::from(index),
                    },
                )
            })
            .collect();

        let Some(response) = self.read(&request).await? else {
            return Ok(Vec::new());
        };
        Ok(slots
            .iter()
            .filter_map(|slot| response.decode(slot))
            .collect())
    }

    async fn positions(&self, token_ids: &[U256]) -> Result<Vec<LiquidityPosition>, ReadError> {
        if token_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut request = BatchRequest::new();
        let slots: Vec<_> = token_ids
            .iter()
            .map(|&token_id| {
                let slot = request.add(
                    self.manager,
                    INonfungiblePositionManager::positionsCall { tokenId: token_id },
                );
                (token_id, slot)
            })
            .collect();

        let Some(response) = self.read(&request).await? else {
            return Ok(Vec::new());
        };
        Ok(slots
            .iter()
            .filter_map(|(token_id, slot)| position(*token_id, slot, &response))
            .collect())
    }

    async fn read(&self, request: &BatchRequest) -> Result<Option<BatchResponse>, ReadError> {
        Ok(self
            .batcher
            .execute(self.chain_id, request)
            .await?
            .into_response())
    }
}

fn position(
    token_id: U256,
    slot: &Slot<INonfungiblePositionManager::positionsCall>,
    response: &BatchResponse,
) -> Option<LiquidityPosition> {
    let raw = response.decode(slot)?;
    Some(LiquidityPosition {
        token_id,
        token0: raw.token0,
        token1: raw.token1,
        tick_lower: i32::try_from(raw.tickLower).ok()?,
        tick_upper: i32::try_from(raw.tickUpper).ok()?,
        liquidity: raw.liquidity,
        fee_growth_inside0_last_x128: raw.feeGrowthInside0LastX128,
        fee_growth_inside1_last_x128: raw.feeGrowthInside1LastX128,
        tokens_owed0: raw.tokensOwed0,
        tokens_owed1: raw.tokensOwed1,
    })
}
