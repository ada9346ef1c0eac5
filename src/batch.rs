//! Batched contract reads.
//!
//! A [`BatchRequest`] collects view calls against arbitrary contracts. Each call
//! added returns a typed [`Slot`] that later decodes its own result out of the
//! [`BatchResponse`], so callers never compute offsets into the flat result list.
//! The whole request goes out as one multicall round trip through a [`ReadSource`];
//! individual calls may fail without failing the batch.

use alloy::sol_types::SolCall;
use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("no read source configured for chain {0}")]
    UnsupportedChain(u64),
    #[error("batch returned {returned} results for {expected} calls")]
    LengthMismatch { expected: usize, returned: usize },
    #[error("batch read failed: {0}")]
    Transport(String),
}

/// One view call in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    pub target: Address,
    pub calldata: Bytes,
}

/// Per-call result of a batch. A failure never aborts its neighbours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success(Bytes),
    Failure(String),
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success(_))
    }
}

/// A multicall-capable read endpoint for one chain.
#[async_trait]
pub trait ReadSource: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Executes every call with allow-failure semantics and returns one outcome
    /// per call, in input order.
    async fn aggregate(&self, calls: &[CallDescriptor]) -> Result<Vec<CallOutcome>, ReadError>;
}

/// Handle to one call inside a [`BatchRequest`].
pub struct Slot<C> {
    index: usize,
    _call: PhantomData<fn() -> C>,
}

impl<C> Slot<C> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<C> Clone for Slot<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Slot<C> {}

impl<C> std::fmt::Debug for Slot<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").field("index", &self.index).finish()
    }
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    calls: Vec<CallDescriptor>,
    enabled: bool,
}

impl Default for BatchRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchRequest {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            enabled: true,
        }
    }

    /// Marks the request disabled unless `condition` holds, e.g. a connected
    /// account being present. A disabled request is never sent.
    pub fn enabled_when(mut self, condition: bool) -> Self {
        self.enabled = self.enabled && condition;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn add<C: SolCall>(&mut self, target: Address, call: C) -> Slot<C> {
        let index = self.calls.len();
        self.calls.push(CallDescriptor {
            target,
            calldata: Bytes::from(call.abi_encode()),
        });
        Slot {
            index,
            _call: PhantomData,
        }
    }

    pub fn calls(&self) -> &[CallDescriptor] {
        &self.calls
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchResponse {
    outcomes: Vec<CallOutcome>,
}

impl BatchResponse {
    pub fn new(outcomes: Vec<CallOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn outcome<C>(&self, slot: &Slot<C>) -> Option<&CallOutcome> {
        self.outcomes.get(slot.index)
    }

    /// Decodes the return value of the call behind `slot`. `None` when the call
    /// failed, is missing, or returned data that does not decode.
    pub fn decode<C: SolCall>(&self, slot: &Slot<C>) -> Option<C::Return> {
        match self.outcome(slot)? {
            CallOutcome::Success(data) => match C::abi_decode_returns(data) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(
                        "Call #{} ({}) did not decode: {}",
                        slot.index,
                        C::SIGNATURE,
                        e
                    );
                    None
                }
            },
            CallOutcome::Failure(reason) => {
                debug!("Call #{} ({}) failed: {}", slot.index, C::SIGNATURE, reason);
                None
            }
        }
    }

    pub fn outcomes(&self) -> &[CallOutcome] {
        &self.outcomes
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Result of submitting a request: a disabled request is not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchState {
    Disabled,
    Ready(BatchResponse),
}

impl BatchState {
    pub fn into_response(self) -> Option<BatchResponse> {
        match self {
            BatchState::Disabled => None,
            BatchState::Ready(response) => Some(response),
        }
    }
}

/// Routes batch requests to the read source registered for a chain.
#[derive(Clone, Default)]
pub struct ReadBatcher {
    sources: HashMap<u64, Arc<dyn ReadSource>>,
}

impl ReadBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Arc<dyn ReadSource>) -> Self {
        self.register(source);
        self
    }

    pub fn register(&mut self, source: Arc<dyn ReadSource>) {
        self.sources.insert(source.chain_id(), source);
    }

    pub async fn execute(
        &self,
        chain_id: u64,
        request: &BatchRequest,
    ) -> Result<BatchState, ReadError> {
        if !request.is_enabled() {
            debug!("Batch for chain {} disabled, skipping", chain_id);
            return Ok(BatchState::Disabled);
        }

        let source = self
            .sources
            .get(&chain_id)
            .ok_or(ReadError::UnsupportedChain(chain_id))?;

        if request.is_empty() {
            return Ok(BatchState::Ready(BatchResponse::default()));
        }

        info!(
            "Dispatching batch of {} calls on chain {}",
            request.len(),
            chain_id
        );
        let outcomes = source.aggregate(request.calls()).await?;

        if outcomes.len() != request.len() {
            return Err(ReadError::LengthMismatch {
                expected: request.len(),
                returned: outcomes.len(),
            });
        }

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        if failed > 0 {
            debug!("{} of {} calls failed in batch", failed, outcomes.len());
        }

        Ok(BatchState::Ready(BatchResponse::new(outcomes)))
    }
}
