use crate::batch::{BatchRequest, BatchResponse, BatchState, ReadBatcher, ReadError, Slot};
use crate::contracts::IERC20;
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDescriptor {
    pub address: Address,
    pub decimals: u8,
    pub name: String,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub token: TokenDescriptor,
    pub raw_balance: U256,
    pub owner: Address,
}

/// Session cache of token metadata keyed by (chain id, token address).
///
/// Entries are write-once: a descriptor never changes after it was first fetched,
/// so a later insert for the same key is ignored.
#[derive(Clone, Default)]
pub struct DescriptorCache {
    cache: Arc<RwLock<HashMap<(u64, Address), TokenDescriptor>>>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, chain_id: u64, address: Address) -> Option<TokenDescriptor> {
        self.cache.read().await.get(&(chain_id, address)).cloned()
    }

    pub async fn insert(&self, chain_id: u64, descriptor: TokenDescriptor) {
        let mut cache = self.cache.write().await;
        cache
            .entry((chain_id, descriptor.address))
            .or_insert(descriptor);
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}

struct MetadataSlots {
    decimals: Slot<IERC20::decimalsCall>,
    name: Slot<IERC20::nameCall>,
    symbol: Slot<IERC20::symbolCall>,
}

/// The calls scheduled for one token. Metadata is only requested when the
/// descriptor is not cached yet.
pub struct TokenSlots {
    address: Address,
    balance: Slot<IERC20::balanceOfCall>,
    metadata: Metadata,
}

enum Metadata {
    Cached(TokenDescriptor),
    Requested(MetadataSlots),
}

/// Outcome of a holdings read for a list of tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Holdings {
    /// No connected account, nothing was read.
    Disabled,
    Loaded(Vec<TokenBalance>),
}

impl Holdings {
    pub fn balances(&self) -> &[TokenBalance] {
        match self {
            Holdings::Disabled => &[],
            Holdings::Loaded(balances) => balances,
        }
    }
}

pub struct TokenAggregator {
    batcher: Arc<ReadBatcher>,
    cache: DescriptorCache,
}

impl TokenAggregator {
    pub fn new(batcher: Arc<ReadBatcher>, cache: DescriptorCache) -> Self {
        Self { batcher, cache }
    }

    pub fn cache(&self) -> &DescriptorCache {
        &self.cache
    }

    /// Schedules balance and (uncached) metadata calls for every token, in order.
    pub async fn schedule(
        &self,
        chain_id: u64,
        owner: Address,
        tokens: &[Address],
        request: &mut BatchRequest,
    ) -> Vec<TokenSlots> {
        let mut scheduled = Vec::with_capacity(tokens.len());
        for &address in tokens {
            let balance = request.add(address, IERC20::balanceOfCall { owner });
            let metadata = match self.cache.get(chain_id, address).await {
                Some(descriptor) => Metadata::Cached(descriptor),
                None => Metadata::Requested(MetadataSlots {
                    decimals: request.add(address, IERC20::decimalsCall {}),
                    name: request.add(address, IERC20::nameCall {}),
                    symbol: request.add(address, IERC20::symbolCall {}),
                }),
            };
            scheduled.push(TokenSlots {
                address,
                balance,
                metadata,
            });
        }
        scheduled
    }

    /// Reads balance and metadata for `tokens` in one batch. Disabled when no
    /// account is connected.
    pub async fn fetch(
        &self,
        chain_id: u64,
        owner: Option<Address>,
        tokens: &[Address],
    ) -> Result<Holdings, ReadError> {
        let Some(owner) = owner else {
            return Ok(Holdings::Disabled);
        };

        let mut request = BatchRequest::new();
        let slots = self.schedule(chain_id, owner, tokens, &mut request).await;

        let started = Instant::now();
        let response = match self.batcher.execute(chain_id, &request).await? {
            BatchState::Disabled => return Ok(Holdings::Disabled),
            BatchState::Ready(response) => response,
        };

        let balances = self.collect(chain_id, owner, &slots, &response).await;
        info!(
            "Loaded {} of {} token balances in {:?}",
            balances.len(),
            tokens.len(),
            started.elapsed()
        );
        Ok(Holdings::Loaded(balances))
    }

    /// Assembles one record per token whose fields all resolved, caching newly
    /// seen descriptors. Tokens with missing fields are skipped.
    pub async fn collect(
        &self,
        chain_id: u64,
        owner: Address,
        slots: &[TokenSlots],
        response: &BatchResponse,
    ) -> Vec<TokenBalance> {
        let mut balances = Vec::with_capacity(slots.len());
        for token_slots in slots {
            let Some(balance) = assemble(owner, token_slots, response) else {
                warn!(
                    "Skipping token {:?}: incomplete batch results",
                    token_slots.address
                );
                continue;
            };
            if matches!(token_slots.metadata, Metadata::Requested(_)) {
                debug!(
                    "Caching descriptor for {} ({:?})",
                    balance.token.symbol, balance.token.address
                );
                self.cache.insert(chain_id, balance.token.clone()).await;
            }
            balances.push(balance);
        }
        balances
    }
}

fn assemble(owner: Address, slots: &TokenSlots, response: &BatchResponse) -> Option<TokenBalance> {
    let raw_balance = response.decode(&slots.balance)?;
    let token = match &slots.metadata {
        Metadata::Cached(descriptor) => descriptor.clone(),
        Metadata::Requested(metadata) => TokenDescriptor {
            address: slots.address,
            decimals: response.decode(&metadata.decimals)?,
            name: response.decode(&metadata.name)?,
            symbol: response.decode(&metadata.symbol)?,
        },
    };
    Some(TokenBalance {
        token,
        raw_balance,
        owner,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::test_support::StaticReadSource;
    use alloy::sol_types::SolValue;
    use alloy_primitives::address;

    const CHAIN: u64 = 1;
    const OWNER: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const TOKEN_A: Address = address!("0x1111111111111111111111111111111111111111");
    const TOKEN_B: Address = address!("0x2222222222222222222222222222222222222222");

    fn answer_token(source: &StaticReadSource, token: Address, balance: u64, symbol: &str) {
        source.answer(
            token,
            IERC20::balanceOfCall { owner: OWNER },
            U256::from(balance).abi_encode(),
        );
        source.answer(
            token,
            IERC20::decimalsCall {},
            <alloy::sol_types::sol_data::Uint<8> as alloy::sol_types::SolType>::abi_encode(&18u8),
        );
        source.answer(
            token,
            IERC20::nameCall {},
            format!("{symbol} Token").abi_encode(),
        );
        source.answer(
            token,
            IERC20::symbolCall {},
            symbol.to_string().abi_encode(),
        );
    }

    fn aggregator(source: Arc<StaticReadSource>) -> TokenAggregator {
        let batcher = Arc::new(ReadBatcher::new().with_source(source));
        TokenAggregator::new(batcher, DescriptorCache::new())
    }

    #[tokio::test]
    async fn test_fetch_preserves_token_order() {
        let source = Arc::new(StaticReadSource::new(CHAIN));
        answer_token(&source, TOKEN_A, 10, "AAA");
        answer_token(&source, TOKEN_B, 20, "BBB");

        let holdings = aggregator(source.clone())
            .fetch(CHAIN, Some(OWNER), &[TOKEN_B, TOKEN_A])
            .await
            .unwrap();

        let symbols: Vec<_> = holdings
            .balances()
            .iter()
            .map(|b| b.token.symbol.as_str())
            .collect();
        assert_eq!(symbols, vec!["BBB", "AAA"]);
        assert_eq!(holdings.balances()[0].raw_balance, U256::from(20u64));
        assert_eq!(source.batches().len(), 1);
        assert_eq!(source.batches()[0].len(), 8);
    }

    #[tokio::test]
    async fn test_failed_name_call_skips_only_that_token() {
        let source = Arc::new(StaticReadSource::new(CHAIN));
        answer_token(&source, TOKEN_A, 10, "AAA");
        answer_token(&source, TOKEN_B, 20, "BBB");
        source.fail(TOKEN_A, IERC20::nameCall {});

        let holdings = aggregator(source)
            .fetch(CHAIN, Some(OWNER), &[TOKEN_A, TOKEN_B])
            .await
            .unwrap();

        assert_eq!(
            holdings,
            Holdings::Loaded(vec![TokenBalance {
                token: TokenDescriptor {
                    address: TOKEN_B,
                    decimals: 18,
                    name: "BBB Token".to_string(),
                    symbol: "BBB".to_string(),
                },
                raw_balance: U256::from(20u64),
                owner: OWNER,
            }])
        );
    }

    #[tokio::test]
    async fn test_cached_descriptor_only_refreshes_balance() {
        let source = Arc::new(StaticReadSource::new(CHAIN));
        answer_token(&source, TOKEN_A, 10, "AAA");
        let aggregator = aggregator(source.clone());

        aggregator
            .fetch(CHAIN, Some(OWNER), &[TOKEN_A])
            .await
            .unwrap();
        assert_eq!(aggregator.cache().len().await, 1);

        let holdings = aggregator
            .fetch(CHAIN, Some(OWNER), &[TOKEN_A])
            .await
            .unwrap();

        let batches = source.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(holdings.balances()[0].token.symbol, "AAA");
    }

    #[tokio::test]
    async fn test_no_owner_is_disabled() {
        let source = Arc::new(StaticReadSource::new(CHAIN));
        let holdings = aggregator(source.clone())
            .fetch(CHAIN, None, &[TOKEN_A])
            .await
            .unwrap();

        assert_eq!(holdings, Holdings::Disabled);
        assert!(source.batches().is_empty());
    }

    #[tokio::test]
    async fn test_cache_is_write_once() {
        let cache = DescriptorCache::new();
        let original = TokenDescriptor {
            address: TOKEN_A,
            decimals: 6,
            name: "First".to_string(),
            symbol: "ONE".to_string(),
        };
        cache.insert(CHAIN, original.clone()).await;
        cache
            .insert(
                CHAIN,
                TokenDescriptor {
                    symbol: "TWO".to_string(),
                    ..original.clone()
                },
            )
            .await;

        assert_eq!(cache.get(CHAIN, TOKEN_A).await, Some(original));
        assert_eq!(cache.get(10, TOKEN_A).await, None);
    }
}
