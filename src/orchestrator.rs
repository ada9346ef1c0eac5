//! Approve-then-multisend distribution of an ERC-20 token.
//!
//! A run moves through `Idle → AllowanceChecked → Approving → Approved → Sending →
//! Confirming → Confirmed`, or lands in `Errored` from any step. The approval, when
//! needed, is for exactly the distribution total and must reach its confirmation
//! depth before the transfer is submitted. Nothing is retried: after a failure the
//! caller resets the orchestrator and runs it again.
//!
//! The latest state sits in a `watch` channel behind [`TransferOrchestrator::state`].
//! Each transition is also sent in order on a `broadcast` channel, see
//! [`TransferOrchestrator::subscribe`].

use crate::batch::{BatchRequest, ReadBatcher, ReadError};
use crate::contracts::{IERC20, IMultisend};
use crate::recipients::{Distribution, ParseError};
use alloy::sol_types::SolCall;
use alloy_primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

pub const APPROVAL_CONFIRMATIONS: u64 = 1;
pub const TRANSFER_CONFIRMATIONS: u64 = 3;

/// A run publishes at most seven transitions after `Idle`.
const TRANSITION_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: TxHash },
    #[error("waiting for {tx_hash} failed: {message}")]
    Confirmation { tx_hash: TxHash, message: String },
    #[error("{tx_hash} not confirmed after {}s, it may still confirm", waited.as_secs())]
    Timeout { tx_hash: TxHash, waited: Duration },
    #[error("gas estimation failed: {0}")]
    Estimation(String),
}

/// A mined transaction that reached the requested depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedTx {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub confirmations: u64,
}

/// Transaction submission endpoint for the connected account.
#[async_trait]
pub trait WriteSource: Send + Sync {
    /// The signing account, `None` when no wallet is connected.
    fn account(&self) -> Option<Address>;

    async fn submit(&self, target: Address, calldata: Bytes) -> Result<TxHash, WriteError>;

    /// Resolves once `tx_hash` is `confirmations` blocks deep. Dropping the
    /// future abandons the wait, not the transaction.
    async fn wait_for_confirmations(
        &self,
        tx_hash: TxHash,
        confirmations: u64,
        timeout: Option<Duration>,
    ) -> Result<ConfirmedTx, WriteError>;

    async fn estimate_gas(&self, target: Address, calldata: Bytes) -> Result<u64, WriteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad user input, fixable by editing it.
    Validation,
    /// Missing wallet or data, or not enough funds.
    Precondition,
    /// The read endpoint could not be reached.
    Transport,
    /// A submitted transaction was rejected, reverted or never confirmed.
    Transaction,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Invalid(#[from] ParseError),
    #[error("Wallet is not connected")]
    WalletDisconnected,
    #[error("Token balance is not available yet")]
    BalanceNotLoaded,
    #[error("Insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: U256, required: U256 },
    #[error("A transfer already ran on this orchestrator, reset it before retrying")]
    NotIdle,
    #[error("Reading account state failed: {0}")]
    Read(#[from] ReadError),
    #[error("{kind} failed: {source}")]
    Transaction {
        kind: TxKind,
        #[source]
        source: WriteError,
    },
}

impl TransferError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransferError::Invalid(_) => ErrorCategory::Validation,
            TransferError::WalletDisconnected
            | TransferError::BalanceNotLoaded
            | TransferError::InsufficientBalance { .. }
            | TransferError::NotIdle => ErrorCategory::Precondition,
            TransferError::Read(_) => ErrorCategory::Transport,
            TransferError::Transaction { .. } => ErrorCategory::Transaction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub token: Address,
    pub distribution: Distribution,
    /// The multisend contract, spender of the approval.
    pub spender: Address,
}

impl TransferRequest {
    pub fn new(token: Address, distribution: Distribution, spender: Address) -> Self {
        Self {
            token,
            distribution,
            spender,
        }
    }

    pub fn total(&self) -> U256 {
        self.distribution.total()
    }

    pub fn approve_calldata(&self) -> Bytes {
        IERC20::approveCall {
            spender: self.spender,
            amount: self.total(),
        }
        .abi_encode()
        .into()
    }

    pub fn multisend_calldata(&self) -> Bytes {
        IMultisend::multisendERC20Call {
            token: self.token,
            recipients: self.distribution.recipients(),
            amounts: self.distribution.amounts(),
            total: self.total(),
        }
        .abi_encode()
        .into()
    }

    /// A plain `transfer` to the first recipient, the baseline for gas comparison.
    pub fn single_transfer_calldata(&self) -> Bytes {
        let first = &self.distribution.instructions()[0];
        IERC20::transferCall {
            to: first.address,
            amount: first.amount,
        }
        .abi_encode()
        .into()
    }
}

/// Balance and allowance of the connected account, read together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub owner: Address,
    pub balance: U256,
    pub allowance: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    AllowanceChecked {
        allowance: U256,
        required: U256,
    },
    /// `tx_hash` is set once the approval was submitted.
    Approving {
        tx_hash: Option<TxHash>,
    },
    /// `tx_hash` is `None` when the existing allowance already covered the total.
    Approved {
        tx_hash: Option<TxHash>,
    },
    Sending,
    Confirming {
        tx_hash: TxHash,
    },
    Confirmed {
        tx_hash: TxHash,
        block_number: Option<u64>,
    },
    Errored {
        message: String,
    },
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Confirmed { .. } | TransferState::Errored { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Approval,
    Transfer,
}

impl TxKind {
    fn call(self, request: &TransferRequest) -> (Address, Bytes) {
        match self {
            TxKind::Approval => (request.token, request.approve_calldata()),
            TxKind::Transfer => (request.spender, request.multisend_calldata()),
        }
    }

    fn submitting(self) -> TransferState {
        match self {
            TxKind::Approval => TransferState::Approving { tx_hash: None },
            TxKind::Transfer => TransferState::Sending,
        }
    }

    fn awaiting(self, tx_hash: TxHash) -> TransferState {
        match self {
            TxKind::Approval => TransferState::Approving {
                tx_hash: Some(tx_hash),
            },
            TxKind::Transfer => TransferState::Confirming { tx_hash },
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxKind::Approval => write!(f, "Approval"),
            TxKind::Transfer => write!(f, "Batch transfer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub approval: u64,
    pub transfer: u64,
    /// `None` waits as long as it takes.
    pub timeout: Option<Duration>,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            approval: APPROVAL_CONFIRMATIONS,
            transfer: TRANSFER_CONFIRMATIONS,
            timeout: None,
        }
    }
}

impl ConfirmationPolicy {
    pub fn depth(&self, kind: TxKind) -> u64 {
        match kind {
            TxKind::Approval => self.approval,
            TxKind::Transfer => self.transfer,
        }
    }
}

pub struct TransferOrchestrator<W: WriteSource> {
    batcher: Arc<ReadBatcher>,
    writer: Arc<W>,
    chain_id: u64,
    policy: ConfirmationPolicy,
    state: watch::Sender<TransferState>,
    transitions: broadcast::Sender<TransferState>,
}

impl<W: WriteSource> TransferOrchestrator<W> {
    pub fn new(batcher: Arc<ReadBatcher>, writer: Arc<W>, chain_id: u64) -> Self {
        let (state, _) = watch::channel(TransferState::Idle);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            batcher,
            writer,
            chain_id,
            policy: ConfirmationPolicy::default(),
            state,
            transitions,
        }
    }

    pub fn with_policy(mut self, policy: ConfirmationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn writer(&self) -> &Arc<W> {
        &self.writer
    }

    /// Every transition from now on, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferState> {
        self.transitions.subscribe()
    }

    pub fn state(&self) -> TransferState {
        self.state.borrow().clone()
    }

    /// Returns a finished or failed orchestrator to `Idle` for another attempt.
    pub fn reset(&mut self) {
        self.transition(TransferState::Idle);
    }

    /// Reads balance and allowance of the connected account in one batch.
    /// `None` when no wallet is connected or either value could not be read.
    pub async fn load_account(
        &self,
        request: &TransferRequest,
    ) -> Result<Option<AccountSnapshot>, TransferError> {
        let owner = self.writer.account();
        let holder = owner.unwrap_or(Address::ZERO);

        let mut batch = BatchRequest::new().enabled_when(owner.is_some());
        let balance = batch.add(request.token, IERC20::balanceOfCall { owner: holder });
        let allowance = batch.add(
            request.token,
            IERC20::allowanceCall {
                owner: holder,
                spender: request.spender,
            },
        );

        let Some(response) = self
            .batcher
            .execute(self.chain_id, &batch)
            .await?
            .into_response()
        else {
            return Ok(None);
        };

        match (
            owner,
            response.decode(&balance),
            response.decode(&allowance),
        ) {
            (Some(owner), Some(balance), Some(allowance)) => Ok(Some(AccountSnapshot {
                owner,
                balance,
                allowance,
            })),
            _ => {
                warn!(
                    "Balance or allowance of token {:?} unavailable",
                    request.token
                );
                Ok(None)
            }
        }
    }

    /// Runs one distribution attempt to completion.
    pub async fn run(
        &mut self,
        request: &TransferRequest,
        snapshot: Option<&AccountSnapshot>,
    ) -> Result<ConfirmedTx, TransferError> {
        if *self.state.borrow() != TransferState::Idle {
            return Err(TransferError::NotIdle);
        }

        match self.execute(request, snapshot).await {
            Ok(confirmed) => Ok(confirmed),
            Err(e) => {
                warn!("Distribution failed: {}", e);
                self.transition(TransferState::Errored {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        request: &TransferRequest,
        snapshot: Option<&AccountSnapshot>,
    ) -> Result<ConfirmedTx, TransferError> {
        let snapshot = self.check_preconditions(request, snapshot)?;
        let total = request.total();

        self.transition(TransferState::AllowanceChecked {
            allowance: snapshot.allowance,
            required: total,
        });

        let approval = if snapshot.allowance >= total {
            info!(
                "Allowance {} covers total {}, skipping approval",
                snapshot.allowance, total
            );
            None
        } else {
            Some(self.stage(TxKind::Approval, request).await?)
        };
        self.transition(TransferState::Approved {
            tx_hash: approval.map(|tx| tx.tx_hash),
        });

        let confirmed = self.stage(TxKind::Transfer, request).await?;
        self.transition(TransferState::Confirmed {
            tx_hash: confirmed.tx_hash,
            block_number: confirmed.block_number,
        });
        Ok(confirmed)
    }

    fn check_preconditions<'a>(
        &self,
        request: &TransferRequest,
        snapshot: Option<&'a AccountSnapshot>,
    ) -> Result<&'a AccountSnapshot, TransferError> {
        let account = self
            .writer
            .account()
            .ok_or(TransferError::WalletDisconnected)?;
        let snapshot = snapshot
            .filter(|s| s.owner == account)
            .ok_or(TransferError::BalanceNotLoaded)?;

        if snapshot.balance < request.total() {
            return Err(TransferError::InsufficientBalance {
                balance: snapshot.balance,
                required: request.total(),
            });
        }
        Ok(snapshot)
    }

    /// Submits one transaction and waits for the depth its kind requires.
    async fn stage(
        &self,
        kind: TxKind,
        request: &TransferRequest,
    ) -> Result<ConfirmedTx, TransferError> {
        let (target, calldata) = kind.call(request);
        let fail = |source| TransferError::Transaction { kind, source };

        self.transition(kind.submitting());
        let tx_hash = self.writer.submit(target, calldata).await.map_err(fail)?;
        info!(tx_hash = %tx_hash, chain_id = self.chain_id, "{} submitted", kind);

        self.transition(kind.awaiting(tx_hash));
        let depth = self.policy.depth(kind);
        let confirmed = self
            .writer
            .wait_for_confirmations(tx_hash, depth, self.policy.timeout)
            .await
            .map_err(fail)?;
        info!(tx_hash = %tx_hash, confirmations = depth, "{} confirmed", kind);

        Ok(confirmed)
    }

    fn transition(&self, next: TransferState) {
        self.state.send_replace(next.clone());
        // No subscriber is fine.
        let _ = self.transitions.send(next);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use alloy_primitives::address;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum WriterCall {
        Submit { target: Address, calldata: Bytes },
        Wait { tx_hash: TxHash, confirmations: u64 },
        Estimate { target: Address },
    }

    /// Write source that records every call and answers from canned results.
    #[derive(Default)]
    pub struct RecordingWriter {
        account: Option<Address>,
        revert_on_submit: Option<usize>,
        revert_on_wait: bool,
        timeout_on_wait: bool,
        failing_estimates: bool,
        calls: Mutex<Vec<WriterCall>>,
    }

    impl RecordingWriter {
        pub fn connected(account: Address) -> Self {
            Self {
                account: Some(account),
                ..Default::default()
            }
        }

        /// Rejects the submission with the given 0-based index.
        pub fn rejecting(mut self, index: usize) -> Self {
            self.revert_on_submit = Some(index);
            self
        }

        /// Every mined transaction comes back with a failed receipt.
        pub fn reverting(mut self) -> Self {
            self.revert_on_wait = true;
            self
        }

        pub fn timing_out(mut self) -> Self {
            self.timeout_on_wait = true;
            self
        }

        pub fn failing_estimates(mut self) -> Self {
            self.failing_estimates = true;
            self
        }

        pub fn calls(&self) -> Vec<WriterCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn submissions(&self) -> Vec<(Address, Bytes)> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    WriterCall::Submit { target, calldata } => Some((target, calldata)),
                    _ => None,
                })
                .collect()
        }

        fn submitted_count(&self) -> usize {
            self.submissions().len()
        }
    }

    #[async_trait]
    impl WriteSource for RecordingWriter {
        fn account(&self) -> Option<Address> {
            self.account
        }

        async fn submit(&self, target: Address, calldata: Bytes) -> Result<TxHash, WriteError> {
            let index = self.submitted_count();
            self.calls
                .lock()
                .unwrap()
                .push(WriterCall::Submit { target, calldata });
            if self.revert_on_submit == Some(index) {
                return Err(WriteError::Rejected("execution reverted".to_string()));
            }
            Ok(TxHash::with_last_byte(index as u8 + 1))
        }

        async fn wait_for_confirmations(
            &self,
            tx_hash: TxHash,
            confirmations: u64,
            timeout: Option<Duration>,
        ) -> Result<ConfirmedTx, WriteError> {
            self.calls.lock().unwrap().push(WriterCall::Wait {
                tx_hash,
                confirmations,
            });
            if self.revert_on_wait {
                return Err(WriteError::Reverted { tx_hash });
            }
            if self.timeout_on_wait {
                return Err(WriteError::Timeout {
                    tx_hash,
                    waited: timeout.unwrap_or_default(),
                });
            }
            Ok(ConfirmedTx {
                tx_hash,
                block_number: Some(100),
                gas_used: 50_000,
                confirmations,
            })
        }

        async fn estimate_gas(&self, target: Address, _calldata: Bytes) -> Result<u64, WriteError> {
            self.calls
                .lock()
                .unwrap()
                .push(WriterCall::Estimate { target });
            if self.failing_estimates {
                return Err(WriteError::Estimation("execution reverted".to_string()));
            }
            Ok(if target == TOKEN { 35_000 } else { 90_000 })
        }
    }

    pub const TOKEN: Address = address!("0x1111111111111111111111111111111111111111");
    pub const SPENDER: Address = address!("0x0C149FbbBE49baB59B1d1d0749f4109F02a46F77");
    pub const OWNER: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
}
