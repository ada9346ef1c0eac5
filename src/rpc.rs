use crate::batch::{CallDescriptor, CallOutcome, ReadError, ReadSource};
use crate::config::Config;
use crate::contracts::IMulticall3;
use crate::orchestrator::{ConfirmedTx, WriteError, WriteSource};
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::providers::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder};
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolCall, decode_revert_reason};
use alloy::transports::TransportResult;
use alloy_primitives::{Address, Bytes, TxHash};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_RETRIES: usize = 5;

/// Read and write access to one chain over a rotating set of RPC endpoints.
///
/// Reads and gas estimates are retried with backoff, moving to the next endpoint
/// after every error. Submissions go out exactly once.
#[derive(Clone)]
pub struct RpcClient {
    providers: Vec<DynProvider>,
    urls: Vec<String>,
    current_provider: Arc<AtomicUsize>,
    max_retries: usize,
    chain_id: u64,
    multicall: Address,
    account: Option<Address>,
}

impl RpcClient {
    pub fn new(
        rpc_urls: &[String],
        chain_id: u64,
        multicall: Address,
        signer: Option<PrivateKeySigner>,
    ) -> Result<Self> {
        if rpc_urls.is_empty() {
            return Err(anyhow!("At least one RPC URL must be provided"));
        }

        let account = signer.as_ref().map(PrivateKeySigner::address);
        let mut providers = Vec::new();
        for url in rpc_urls {
            let parsed_url = url
                .parse()
                .map_err(|_| anyhow!("Invalid RPC URL: {}", url))?;
            let provider = match &signer {
                Some(signer) => ProviderBuilder::new()
                    .wallet(EthereumWallet::from(signer.clone()))
                    .connect_http(parsed_url)
                    .erased(),
                None => ProviderBuilder::new().connect_http(parsed_url).erased(),
            };
            providers.push(provider);
        }

        if let Some(account) = account {
            info!("Signing as {:?}", account);
        }

        Ok(RpcClient {
            providers,
            urls: rpc_urls.to_vec(),
            current_provider: Arc::new(AtomicUsize::new(0)),
            max_retries: DEFAULT_MAX_RETRIES,
            chain_id,
            multicall,
            account,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.json_rpc_urls,
            config.chain_id,
            config.multicall_address,
            config.signer.clone(),
        )
    }

    /// Wraps already connected providers, e.g. mocked transports.
    pub fn from_providers(
        providers: Vec<DynProvider>,
        chain_id: u64,
        multicall: Address,
        account: Option<Address>,
    ) -> Self {
        let urls = (0..providers.len())
            .map(|i| format!("provider #{i}"))
            .collect();
        RpcClient {
            providers,
            urls,
            current_provider: Arc::new(AtomicUsize::new(0)),
            max_retries: DEFAULT_MAX_RETRIES,
            chain_id,
            multicall,
            account,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn get_provider(&self) -> &DynProvider {
        let index = self.current_provider.load(Ordering::Relaxed) % self.providers.len();
        &self.providers[index]
    }

    pub fn get_current_url(&self) -> &str {
        let index = self.current_provider.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[index]
    }

    pub fn rotate_provider(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);

        if self.providers.len() > 1 {
            debug!("Rotating to RPC provider #{}", next);
        }
    }

    fn get_retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(100)
            .factor(2)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries)
    }

    fn handle_error(&self, error_str: &str) {
        let current_url = self.get_current_url();
        warn!(
            "RPC error on {}: {}, rotating provider",
            current_url, error_str
        );
        self.rotate_provider();
    }

    fn handle_timeout(&self) -> anyhow::Error {
        let current_url = self.get_current_url();
        warn!(
            "Request timeout after {} seconds on {}, rotating provider",
            REQUEST_TIMEOUT.as_secs(),
            current_url
        );
        self.rotate_provider();
        anyhow!(
            "Request timeout after {} seconds",
            REQUEST_TIMEOUT.as_secs()
        )
    }

    /// Runs `request` against the current endpoint, rotating and backing off on
    /// errors and timeouts.
    async fn with_retry<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: Fn(DynProvider) -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let client = self.clone();
        Retry::spawn(self.get_retry_strategy(), move || {
            let client = client.clone();
            let future = request(client.get_provider().clone());
            async move {
                match timeout(REQUEST_TIMEOUT, future).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => {
                        let error_str = e.to_string();
                        client.handle_error(&error_str);
                        Err(anyhow!("{}", e))
                    }
                    Err(_) => Err(client.handle_timeout()),
                }
            }
        })
        .await
    }

    pub async fn call(&self, target: Address, calldata: Bytes) -> Result<Bytes> {
        let tx = TransactionRequest::default()
            .with_to(target)
            .with_input(calldata);
        self.with_retry(move |provider| {
            let tx = tx.clone();
            async move { provider.call(tx).await }
        })
        .await
    }

    pub async fn get_latest_block(&self) -> Result<u64> {
        self.with_retry(|provider| async move { provider.get_block_number().await })
            .await
    }
}

#[async_trait]
impl ReadSource for RpcClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn aggregate(&self, calls: &[CallDescriptor]) -> Result<Vec<CallOutcome>, ReadError> {
        let calldata = IMulticall3::aggregate3Call {
            calls: calls
                .iter()
                .map(|call| IMulticall3::Call3 {
                    target: call.target,
                    allowFailure: true,
                    callData: call.calldata.clone(),
                })
                .collect(),
        }
        .abi_encode();

        let raw = self
            .call(self.multicall, calldata.into())
            .await
            .map_err(|e| ReadError::Transport(e.to_string()))?;
        let results = IMulticall3::aggregate3Call::abi_decode_returns(&raw)
            .map_err(|e| ReadError::Transport(format!("undecodable aggregate3 response: {e}")))?;

        Ok(results
            .into_iter()
            .map(|result| {
                if result.success {
                    CallOutcome::Success(result.returnData)
                } else {
                    let reason = decode_revert_reason(&result.returnData)
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "call reverted".to_string());
                    CallOutcome::Failure(reason)
                }
            })
            .collect())
    }
}

#[async_trait]
impl WriteSource for RpcClient {
    fn account(&self) -> Option<Address> {
        self.account
    }

    async fn submit(&self, target: Address, calldata: Bytes) -> Result<TxHash, WriteError> {
        let account = self
            .account
            .ok_or_else(|| WriteError::Rejected("no signing account configured".to_string()))?;
        let tx = TransactionRequest::default()
            .with_from(account)
            .with_to(target)
            .with_input(calldata);

        let pending = self
            .get_provider()
            .send_transaction(tx)
            .await
            .map_err(|e| WriteError::Rejected(e.to_string()))?;
        Ok(*pending.tx_hash())
    }

    async fn wait_for_confirmations(
        &self,
        tx_hash: TxHash,
        confirmations: u64,
        timeout: Option<Duration>,
    ) -> Result<ConfirmedTx, WriteError> {
        debug!(
            "Waiting for {} confirmations of {:?}",
            confirmations, tx_hash
        );
        let provider = self.get_provider();
        let receipt = PendingTransactionBuilder::new(provider.root().clone(), tx_hash)
            .with_required_confirmations(confirmations)
            .get_receipt();

        let receipt = match timeout {
            Some(limit) => {
                tokio::time::timeout(limit, receipt)
                    .await
                    .map_err(|_| WriteError::Timeout {
                        tx_hash,
                        waited: limit,
                    })?
            }
            None => receipt.await,
        }
        .map_err(|e| WriteError::Confirmation {
            tx_hash,
            message: e.to_string(),
        })?;

        confirmed(&receipt, confirmations)
    }

    async fn estimate_gas(&self, target: Address, calldata: Bytes) -> Result<u64, WriteError> {
        let mut tx = TransactionRequest::default()
            .with_to(target)
            .with_input(calldata);
        if let Some(account) = self.account {
            tx = tx.with_from(account);
        }
        self.with_retry(move |provider| {
            let tx = tx.clone();
            async move { provider.estimate_gas(tx).await }
        })
        .await
        .map_err(|e| WriteError::Estimation(e.to_string()))
    }
}

/// A mined receipt is only a confirmation when its status is success.
fn confirmed(receipt: &TransactionReceipt, confirmations: u64) -> Result<ConfirmedTx, WriteError> {
    if !receipt.status() {
        return Err(WriteError::Reverted {
            tx_hash: receipt.transaction_hash,
        });
    }

    Ok(ConfirmedTx {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number,
        gas_used: receipt.gas_used,
        confirmations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchRequest, ReadBatcher};
    use crate::contracts::{IERC20, MULTICALL3_ADDRESS};
    use alloy::providers::mock::Asserter;
    use alloy::sol_types::SolValue;
    use alloy_primitives::{U256, address};

    const TOKEN: Address = address!("0x1111111111111111111111111111111111111111");
    const OWNER: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

    fn client(asserters: &[Asserter]) -> RpcClient {
        let providers = asserters
            .iter()
            .map(|asserter| {
                ProviderBuilder::new()
                    .connect_mocked_client(asserter.clone())
                    .erased()
            })
            .collect();
        RpcClient::from_providers(providers, 1, MULTICALL3_ADDRESS, Some(OWNER)).with_max_retries(1)
    }

    fn aggregate_response(results: Vec<IMulticall3::Call3Result>) -> Bytes {
        IMulticall3::aggregate3Call::abi_encode_returns(&results).into()
    }

    #[tokio::test]
    async fn test_aggregate_maps_results_in_order() {
        let asserter = Asserter::new();
        asserter.push_success(&aggregate_response(vec![
            IMulticall3::Call3Result {
                success: true,
                returnData: U256::from(42u64).abi_encode().into(),
            },
            IMulticall3::Call3Result {
                success: false,
                returnData: Bytes::new(),
            },
        ]));
        let batcher = ReadBatcher::new().with_source(Arc::new(client(&[asserter])));

        let mut request = BatchRequest::new();
        let balance = request.add(TOKEN, IERC20::balanceOfCall { owner: OWNER });
        let decimals = request.add(TOKEN, IERC20::decimalsCall {});
        let response = batcher
            .execute(1, &request)
            .await
            .unwrap()
            .into_response()
            .unwrap();

        assert_eq!(response.decode(&balance), Some(U256::from(42u64)));
        assert_eq!(response.decode(&decimals), None);
        assert_eq!(
            response.outcome(&decimals),
            Some(&CallOutcome::Failure("call reverted".to_string()))
        );
    }

    #[tokio::test]
    async fn test_rotates_to_next_provider_on_error() {
        let failing = Asserter::new();
        failing.push_failure_msg("rate limited");
        let healthy = Asserter::new();
        healthy.push_success(&Bytes::from(U256::from(7u64).abi_encode()));
        let client = client(&[failing, healthy]);

        let raw = client.call(TOKEN, Bytes::new()).await.unwrap();

        assert_eq!(U256::abi_decode(&raw).unwrap(), U256::from(7u64));
        assert_eq!(client.get_current_url(), "provider #1");
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_transport_error() {
        let asserter = Asserter::new();
        asserter.push_failure_msg("connection refused");
        asserter.push_failure_msg("connection refused");
        let client = client(&[asserter]);

        let err = client.aggregate(&[]).await.unwrap_err();

        assert!(
            matches!(err, ReadError::Transport(message) if message.contains("connection refused"))
        );
    }

    #[tokio::test]
    async fn test_estimate_gas() {
        let asserter = Asserter::new();
        asserter.push_success(&"0x5208");
        let client = client(&[asserter]);

        let gas = client.estimate_gas(TOKEN, Bytes::new()).await.unwrap();

        assert_eq!(gas, 21_000);
    }

    #[tokio::test]
    async fn test_submit_without_account_is_rejected() {
        let asserter = Asserter::new();
        let provider = ProviderBuilder::new()
            .connect_mocked_client(asserter)
            .erased();
        let client = RpcClient::from_providers(vec![provider], 1, MULTICALL3_ADDRESS, None);

        let err = client.submit(TOKEN, Bytes::new()).await.unwrap_err();

        assert!(matches!(err, WriteError::Rejected(_)));
        assert_eq!(client.account(), None);
    }

    fn receipt(status: &str) -> TransactionReceipt {
        serde_json::from_value(serde_json::json!({
            "type": "0x2",
            "status": status,
            "cumulativeGasUsed": "0x5208",
            "logs": [],
            "logsBloom": format!("0x{}", "0".repeat(512)),
            "transactionHash": TxHash::with_last_byte(9),
            "transactionIndex": "0x0",
            "blockHash": TxHash::with_last_byte(1),
            "blockNumber": "0x64",
            "gasUsed": "0x5208",
            "effectiveGasPrice": "0x3b9aca00",
            "from": OWNER,
            "to": TOKEN,
            "contractAddress": null
        }))
        .unwrap()
    }

    #[test]
    fn test_failed_receipt_is_a_revert() {
        let err = confirmed(&receipt("0x0"), 3).unwrap_err();

        assert!(matches!(
            err,
            WriteError::Reverted { tx_hash } if tx_hash == TxHash::with_last_byte(9)
        ));
    }

    #[test]
    fn test_successful_receipt_is_confirmed() {
        let confirmed = confirmed(&receipt("0x1"), 3).unwrap();

        assert_eq!(
            confirmed,
            ConfirmedTx {
                tx_hash: TxHash::with_last_byte(9),
                block_number: Some(100),
                gas_used: 21_000,
                confirmations: 3,
            }
        );
    }

    #[test]
    fn test_new_rejects_empty_url_list() {
        assert!(RpcClient::new(&[], 1, MULTICALL3_ADDRESS, None).is_err());
    }
}
